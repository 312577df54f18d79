//! In-memory device backend
//!
//! Plays back a script of reads so the reader and the bridge can be driven
//! without hardware. When the script runs dry the handle either reports
//! "no data" or, in synthetic mode, generates reports at the nominal rate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::DeviceError;
use super::hid::{DeviceBackend, DeviceInfo, HidHandle, HAND_PRODUCT_ID, HAND_USAGE};
use super::report::{RawReport, CHANNEL_COUNT};

const MOCK_PATH: &str = "mock://hand";
const SYNTHETIC_PERIOD: Duration = Duration::from_millis(1);

/// One scripted read
#[derive(Clone, Debug)]
pub enum MockRead {
    Report(Vec<u8>),
    Empty,
    Fail(String),
}

#[derive(Debug, Default)]
struct MockShared {
    script: Mutex<VecDeque<MockRead>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    reads: AtomicUsize,
    nonblocking: AtomicBool,
    synthetic_counter: AtomicUsize,
}

/// Read-only view of what the backend's handles went through
#[derive(Clone, Debug)]
pub struct MockProbe {
    shared: Arc<MockShared>,
}

impl MockProbe {
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    pub fn nonblocking(&self) -> bool {
        self.shared.nonblocking.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[derive(Clone, Debug)]
pub struct MockBackend {
    listing: Vec<DeviceInfo>,
    shared: Arc<MockShared>,
    open_delay: Duration,
    open_failure: Option<String>,
    synthetic: bool,
}

impl MockBackend {
    /// Backend listing one interface that matches the default selector
    pub fn hand() -> Self {
        Self::with_listing(vec![DeviceInfo {
            vendor_id: 0x16c0,
            product_id: HAND_PRODUCT_ID,
            usage_page: 0xFF00,
            usage: HAND_USAGE,
            path: MOCK_PATH.to_string(),
            product: Some("Mock hand".to_string()),
        }])
    }

    pub fn with_listing(listing: Vec<DeviceInfo>) -> Self {
        Self {
            listing,
            shared: Arc::new(MockShared::default()),
            open_delay: Duration::ZERO,
            open_failure: None,
            synthetic: false,
        }
    }

    /// Opening the device blocks for `delay` before returning
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_open_failure(mut self, reason: impl Into<String>) -> Self {
        self.open_failure = Some(reason.into());
        self
    }

    /// Generate reports forever once the script is exhausted
    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn push(&self, read: MockRead) {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(read);
    }

    pub fn push_report(&self, report: &RawReport) {
        self.push(MockRead::Report(report.to_bytes().to_vec()));
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            shared: self.shared.clone(),
        }
    }
}

impl DeviceBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.listing.clone())
    }

    fn open_path(&self, path: &str) -> Result<Box<dyn HidHandle>, DeviceError> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        if let Some(reason) = &self.open_failure {
            return Err(DeviceError::Open {
                path: path.to_string(),
                reason: reason.clone(),
            });
        }

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            shared: self.shared.clone(),
            synthetic: self.synthetic,
        }))
    }
}

#[derive(Debug)]
struct MockHandle {
    shared: Arc<MockShared>,
    synthetic: bool,
}

impl MockHandle {
    fn next_read(&self) -> Option<MockRead> {
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        self.shared
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn synthetic_report(&self) -> Vec<u8> {
        let tick = self.shared.synthetic_counter.fetch_add(1, Ordering::SeqCst);
        let phase = (tick as f64 / 1000.0) * std::f64::consts::TAU;
        let mut channels = [0u16; CHANNEL_COUNT];
        for (i, slot) in channels.iter_mut().enumerate() {
            let level = 0.5 + 0.25 * (phase + i as f64 * 0.3).sin();
            *slot = (level * f64::from(u16::MAX)) as u16;
        }
        RawReport {
            counter: tick as u32,
            channels,
        }
        .to_bytes()
        .to_vec()
    }

    fn fill(&self, buf: &mut [u8], read: MockRead) -> Result<usize, DeviceError> {
        match read {
            MockRead::Report(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            MockRead::Empty => Ok(0),
            MockRead::Fail(reason) => Err(DeviceError::Transport(reason)),
        }
    }
}

impl HidHandle for MockHandle {
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError> {
        self.shared.nonblocking.store(nonblocking, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        match self.next_read() {
            Some(read) => self.fill(buf, read),
            None if self.synthetic => {
                let report = self.synthetic_report();
                self.fill(buf, MockRead::Report(report))
            }
            None => Ok(0),
        }
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, DeviceError> {
        match self.next_read() {
            Some(read) => self.fill(buf, read),
            None if self.synthetic => {
                std::thread::sleep(SYNTHETIC_PERIOD.min(timeout));
                let report = self.synthetic_report();
                self.fill(buf, MockRead::Report(report))
            }
            None => {
                std::thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
