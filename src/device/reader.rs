use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use statum::{machine, state};
use tracing::{debug, info, warn};

use super::error::DeviceError;
use super::hid::{DeviceBackend, DeviceInfo, DeviceSelector, HidHandle};
use super::report::{RawReport, REPORT_LEN};
use super::transform::{HandTransform, OutputVector, OUTPUT_LEN};
use crate::clock::Clock;
use crate::stream::{StreamInfo, StreamOutlet, StreamRegistry, TimestampedSample};

/// Every read asks for exactly one report. The device pads its packets to
/// 64 bytes; the HID layer truncates them to the buffer, so only a shorter
/// read is malformed.
const READ_BUF_LEN: usize = REPORT_LEN;

/// Upper bound on the idle wait after an empty non-blocking read, one
/// nominal sample period at 1 kHz
pub const MAX_IDLE_WAIT: Duration = Duration::from_millis(1);

pub const DEFAULT_IDLE_WAIT_US: u64 = 500;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10;

/// How each poll waits for the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReadMode {
    /// Every read waits up to `timeout_ms` for a report. The bound keeps the
    /// shutdown flag observable while the device is silent.
    Blocking { timeout_ms: u64 },
    /// Reads return immediately; an empty read is followed by `idle_wait_us`
    /// of sleep before the next poll.
    NonBlocking { idle_wait_us: u64 },
}

impl Default for ReadMode {
    fn default() -> Self {
        Self::Blocking {
            timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl ReadMode {
    pub fn non_blocking() -> Self {
        Self::NonBlocking {
            idle_wait_us: DEFAULT_IDLE_WAIT_US,
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        matches!(self, Self::NonBlocking { .. })
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self {
            Self::Blocking { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
            Self::NonBlocking { .. } => None,
        }
    }

    /// Sleep after an empty read, never longer than [`MAX_IDLE_WAIT`]
    pub fn idle_wait(&self) -> Option<Duration> {
        match self {
            Self::Blocking { .. } => None,
            Self::NonBlocking { idle_wait_us } => {
                Some(Duration::from_micros(*idle_wait_us).min(MAX_IDLE_WAIT))
            }
        }
    }
}

/// Everything the reader needs to find the device and announce its stream
#[derive(Clone, Debug)]
pub struct ReaderSettings {
    pub selector: DeviceSelector,
    pub read_mode: ReadMode,
    pub stream: StreamInfo,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            read_mode: ReadMode::default(),
            stream: StreamInfo::hand(),
        }
    }
}

/// Counters kept across polls
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub iterations: u64,
    pub samples: u64,
    pub empty_reads: u64,
    pub dropped: u64,
    pub transport_errors: u64,
    pub consecutive_failures: u32,
}

#[state]
#[derive(Debug, Clone)]
pub enum ReaderState {
    Closed,
    Streaming,
}

#[machine]
#[derive(Debug)]
pub struct DeviceReader<S: ReaderState> {
    backend: Arc<dyn DeviceBackend>,
    clock: Arc<dyn Clock>,
    settings: ReaderSettings,

    // Fixed for the reader's lifetime
    transform: HandTransform,

    handle: Option<Box<dyn HidHandle>>,
    outlet: Option<StreamOutlet>,

    read_buf: [u8; READ_BUF_LEN],
    output: OutputVector,
    stats: PollStats,
}

impl<S: ReaderState> DeviceReader<S> {
    pub fn settings(&self) -> &ReaderSettings {
        &self.settings
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Releases the device handle and the outlet. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Releasing device handle {:?}", handle);
            drop(handle);
        }
        if let Some(outlet) = self.outlet.take() {
            drop(outlet);
        }
    }
}

impl DeviceReader<Closed> {
    pub fn create(
        settings: ReaderSettings,
        backend: Arc<dyn DeviceBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!("Creating DeviceReader with settings: {:?}", settings);
        Self::new(
            backend,
            clock,
            settings,
            HandTransform::default(),
            None,
            None,
            [0u8; READ_BUF_LEN],
            [f64::NAN; OUTPUT_LEN],
            PollStats::default(),
        )
    }

    /// Locates the device, opens it in the configured read mode and creates
    /// the outbound stream. On error every partially acquired resource is
    /// dropped before returning.
    pub fn open(
        mut self,
        registry: &StreamRegistry,
    ) -> Result<DeviceReader<Streaming>, DeviceError> {
        let selector = &self.settings.selector;
        let listing = self.backend.enumerate()?;
        let candidates: Vec<&DeviceInfo> =
            listing.iter().filter(|d| selector.matches(d)).collect();

        let device = match candidates.as_slice() {
            [] => {
                return Err(DeviceError::DeviceNotFound(format!(
                    "{} not among {} enumerated interfaces",
                    selector,
                    listing.len()
                )))
            }
            [only] => *only,
            [first, rest @ ..] => {
                warn!(
                    "{} interfaces match {}, using {} and ignoring {}",
                    rest.len() + 1,
                    selector,
                    first.path,
                    rest.len()
                );
                *first
            }
        };

        info!(
            "Opening {} at {} ({:?})",
            device.product.as_deref().unwrap_or("device"),
            device.path,
            self.settings.read_mode
        );
        let mut handle = self.backend.open_path(&device.path)?;
        handle.set_nonblocking(self.settings.read_mode.is_nonblocking())?;

        let outlet = registry.create_outlet(self.settings.stream.clone())?;

        self.handle = Some(handle);
        self.outlet = Some(outlet);
        self.stats = PollStats::default();
        info!("DeviceReader open, transitioning to Streaming state");
        Ok(self.transition())
    }
}

impl DeviceReader<Streaming> {
    pub fn stream_info(&self) -> &StreamInfo {
        &self.settings.stream
    }

    /// Performs exactly one read.
    ///
    /// * `Ok(None)` - the device had nothing ready; nothing was published
    /// * `Ok(Some(_))` - one sample was decoded, transformed and published
    /// * `Err(_)` - the read failed or the report was malformed; nothing was
    ///   published and the caller may keep polling if the error is recoverable
    pub fn poll(&mut self) -> Result<Option<TimestampedSample>, DeviceError> {
        self.stats.iterations += 1;

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| DeviceError::Transport("device handle already released".into()))?;

        let read = match self.settings.read_mode.read_timeout() {
            Some(timeout) => handle.read_timeout(&mut self.read_buf, timeout),
            None => handle.read(&mut self.read_buf),
        };
        let len = match read {
            Ok(len) => len,
            Err(e) => {
                self.stats.transport_errors += 1;
                self.stats.consecutive_failures += 1;
                return Err(e);
            }
        };
        if len == 0 {
            self.stats.empty_reads += 1;
            return Ok(None);
        }

        let timestamp = self.clock.now();
        let report = match RawReport::parse(&self.read_buf[..len]) {
            Ok(report) => report,
            Err(e) => {
                self.stats.dropped += 1;
                self.stats.consecutive_failures += 1;
                return Err(e);
            }
        };

        let decoded = report.decode();
        self.transform.apply_into(&decoded, &mut self.output);

        if let Some(outlet) = &self.outlet {
            outlet.push_sample(&self.output, timestamp);
        }
        self.stats.samples += 1;
        self.stats.consecutive_failures = 0;

        debug!(
            "Published sample at {:.6}s (device time {:.3}s)",
            timestamp, decoded.device_time
        );
        Ok(Some(TimestampedSample {
            vector: self.output,
            timestamp,
        }))
    }

    /// Releases the device and returns to the closed state
    pub fn close(mut self) -> DeviceReader<Closed> {
        self.release();
        info!(
            "DeviceReader closed after {} polls ({} samples)",
            self.stats.iterations, self.stats.samples
        );
        self.transition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockBackend, MockRead};
    use crate::device::report::CHANNEL_COUNT;

    #[derive(Debug)]
    struct FixedClock(f64);

    impl Clock for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    fn reader_with(backend: &MockBackend, read_mode: ReadMode) -> DeviceReader<Closed> {
        let settings = ReaderSettings {
            read_mode,
            ..ReaderSettings::default()
        };
        DeviceReader::create(settings, Arc::new(backend.clone()), Arc::new(FixedClock(42.0)))
    }

    fn saturated() -> RawReport {
        RawReport {
            counter: 1,
            channels: [u16::MAX; CHANNEL_COUNT],
        }
    }

    #[test]
    fn open_fails_without_matching_device() {
        let backend = MockBackend::with_listing(Vec::new());
        let registry = StreamRegistry::new();

        let err = reader_with(&backend, ReadMode::default())
            .open(&registry)
            .unwrap_err();
        assert!(matches!(err, DeviceError::DeviceNotFound(_)));
        assert!(registry.resolve("hand", "hand").is_none());
    }

    #[test]
    fn open_applies_read_mode_and_publishes_stream() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();

        let reader = reader_with(&backend, ReadMode::non_blocking())
            .open(&registry)
            .expect("mock device must open");
        assert!(reader.is_open());
        assert!(backend.probe().nonblocking());
        assert_eq!(registry.streams(), vec![StreamInfo::hand()]);
    }

    #[test]
    fn failed_open_leaves_no_stream_behind() {
        let backend = MockBackend::hand().with_open_failure("busy");
        let registry = StreamRegistry::new();

        let err = reader_with(&backend, ReadMode::default())
            .open(&registry)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
        assert_eq!(backend.probe().opened(), 0);
        assert!(registry.streams().is_empty());
    }

    #[test]
    fn poll_decodes_transforms_and_publishes() {
        let backend = MockBackend::hand();
        backend.push_report(&saturated());
        let registry = StreamRegistry::new();

        let mut reader = reader_with(&backend, ReadMode::non_blocking())
            .open(&registry)
            .unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();

        let sample = reader.poll().unwrap().expect("one report was queued");
        assert_eq!(sample.timestamp, 42.0);
        assert!(sample.vector[0].abs() < 1e-12);
        assert!((sample.vector[1] - 1.41421).abs() < 1e-5);
        assert_eq!(sample.vector[2], 2.0);

        let (vectors, timestamps) = inlet.pull_chunk().unwrap();
        assert_eq!(vectors, vec![sample.vector]);
        assert_eq!(timestamps, vec![42.0]);
    }

    #[test]
    fn empty_read_publishes_nothing_but_counts_iteration() {
        let backend = MockBackend::hand();
        backend.push(MockRead::Empty);
        let registry = StreamRegistry::new();

        let mut reader = reader_with(&backend, ReadMode::non_blocking())
            .open(&registry)
            .unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();

        assert!(reader.poll().unwrap().is_none());
        let stats = reader.stats();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.empty_reads, 1);
        assert_eq!(stats.samples, 0);
        assert!(inlet.pull_chunk().unwrap().0.is_empty());
    }

    #[test]
    fn short_report_is_dropped_and_polling_continues() {
        let backend = MockBackend::hand();
        backend.push(MockRead::Report(vec![0u8; 20]));
        backend.push_report(&saturated());
        let registry = StreamRegistry::new();

        let mut reader = reader_with(&backend, ReadMode::non_blocking())
            .open(&registry)
            .unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();

        let err = reader.poll().unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, DeviceError::ShortReport { actual: 20, .. }));
        assert_eq!(reader.stats().consecutive_failures, 1);

        assert!(reader.poll().unwrap().is_some());
        assert_eq!(reader.stats().dropped, 1);
        assert_eq!(reader.stats().consecutive_failures, 0);
        assert_eq!(inlet.pull_chunk().unwrap().1.len(), 1);
    }

    #[test]
    fn padded_packet_decodes_as_one_report() {
        let backend = MockBackend::hand();
        let mut packet = saturated().to_bytes().to_vec();
        packet.resize(64, 0);
        backend.push(MockRead::Report(packet));
        let registry = StreamRegistry::new();

        let mut reader = reader_with(&backend, ReadMode::non_blocking())
            .open(&registry)
            .unwrap();
        let sample = reader.poll().unwrap().expect("padded packet carries a report");
        assert_eq!(sample.vector[2], 2.0);
        assert_eq!(reader.stats().dropped, 0);
        assert_eq!(reader.stats().samples, 1);
    }

    #[test]
    fn blocking_read_times_out_as_empty() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();

        let mut reader = reader_with(&backend, ReadMode::Blocking { timeout_ms: 1 })
            .open(&registry)
            .unwrap();
        assert!(!backend.probe().nonblocking());
        assert!(reader.poll().unwrap().is_none());
    }

    #[test]
    fn close_releases_handle_and_stream() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();

        let reader = reader_with(&backend, ReadMode::default())
            .open(&registry)
            .unwrap();
        let mut closed = reader.close();
        assert!(!closed.is_open());
        assert_eq!(backend.probe().closed(), 1);
        assert!(registry.resolve("hand", "hand").is_none());

        closed.release();
        assert_eq!(backend.probe().closed(), 1);
    }

    #[test]
    fn dropping_an_open_reader_closes_the_device() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();

        let reader = reader_with(&backend, ReadMode::default())
            .open(&registry)
            .unwrap();
        drop(reader);
        assert_eq!(backend.probe().closed(), 1);
    }

    #[test]
    fn idle_wait_is_capped_at_one_sample_period() {
        let mode = ReadMode::NonBlocking {
            idle_wait_us: 50_000,
        };
        assert_eq!(mode.idle_wait(), Some(MAX_IDLE_WAIT));
        assert_eq!(ReadMode::default().idle_wait(), None);
        assert_eq!(
            ReadMode::non_blocking().idle_wait(),
            Some(Duration::from_micros(500))
        );
    }
}
