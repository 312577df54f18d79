use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::transform::{OutputVector, OUTPUT_LEN};

/// Stream name and type the hand device publishes under
pub const HAND_STREAM_NAME: &str = "hand";
pub const HAND_STREAM_TYPE: &str = "hand";

/// Nominal device sample rate, declared as stream metadata
pub const HAND_NOMINAL_SRATE: f64 = 1000.0;

/// How much data an inlet holds before new samples are dropped
pub const DEFAULT_INLET_BUFFER: Duration = Duration::from_secs(10);

pub const MAX_INLET_CAPACITY: usize = 1 << 24;

/// One published vector with its clock timestamp in seconds
#[derive(Clone, Debug, PartialEq)]
pub struct TimestampedSample {
    pub vector: OutputVector,
    pub timestamp: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Stream '{name}' of type '{stream_type}' already has an outlet")]
    DuplicateStream { name: String, stream_type: String },

    #[error("Stream declares {declared} channels but samples carry {expected}")]
    ChannelCountMismatch { declared: usize, expected: usize },

    #[error("Stream '{0}' is closed")]
    Closed(String),
}

/// Metadata describing a stream
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub stream_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
}

impl StreamInfo {
    pub fn new(
        name: impl Into<String>,
        stream_type: impl Into<String>,
        channel_count: usize,
        nominal_srate: f64,
    ) -> Self {
        Self {
            name: name.into(),
            stream_type: stream_type.into(),
            channel_count,
            nominal_srate,
        }
    }

    /// Stream description for the hand device's 15-channel output
    pub fn hand() -> Self {
        Self::new(
            HAND_STREAM_NAME,
            HAND_STREAM_TYPE,
            OUTPUT_LEN,
            HAND_NOMINAL_SRATE,
        )
    }

    /// Samples an inlet may hold for `buffer` worth of data at the nominal
    /// rate, between one and [`MAX_INLET_CAPACITY`]
    pub fn buffer_capacity(&self, buffer: Duration) -> usize {
        let samples = (self.nominal_srate * buffer.as_secs_f64()).round();
        if samples.is_finite() && samples >= 1.0 {
            (samples as usize).min(MAX_INLET_CAPACITY)
        } else {
            1
        }
    }

    fn key(&self) -> StreamKey {
        StreamKey {
            name: self.name.clone(),
            stream_type: self.stream_type.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StreamKey {
    name: String,
    stream_type: String,
}

struct Subscriber {
    tx: mpsc::Sender<TimestampedSample>,
    dropped: Arc<AtomicU64>,
    // set while the inlet's queue is full, so one overflow logs once
    overflowing: bool,
}

struct OutletShared {
    info: StreamInfo,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl OutletShared {
    fn subscribe(
        &self,
        capacity: usize,
    ) -> (mpsc::Receiver<TimestampedSample>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                tx,
                dropped: dropped.clone(),
                overflowing: false,
            });
        (rx, dropped)
    }
}

/// Discovery table shared by producers and consumers. Cloning is cheap and
/// every clone sees the same streams.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<StreamKey, Weak<OutletShared>>>>,
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("StreamRegistry")
            .field("streams", &streams.len())
            .finish()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the publish side of a stream. Fails if a live outlet already
    /// owns the same name and type.
    pub fn create_outlet(&self, info: StreamInfo) -> Result<StreamOutlet, ChannelError> {
        if info.channel_count != OUTPUT_LEN {
            return Err(ChannelError::ChannelCountMismatch {
                declared: info.channel_count,
                expected: OUTPUT_LEN,
            });
        }

        let key = info.key();
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams.get(&key).is_some_and(|w| w.strong_count() > 0) {
            return Err(ChannelError::DuplicateStream {
                name: info.name,
                stream_type: info.stream_type,
            });
        }

        let shared = Arc::new(OutletShared {
            info,
            subscribers: Mutex::new(Vec::new()),
        });
        streams.insert(key.clone(), Arc::downgrade(&shared));
        info!(
            "Created outlet '{}' ({}, {} channels @ {} Hz)",
            shared.info.name,
            shared.info.stream_type,
            shared.info.channel_count,
            shared.info.nominal_srate
        );

        Ok(StreamOutlet {
            shared,
            key,
            registry: self.clone(),
        })
    }

    /// Attaches a new consumer to a live stream, or `None` if nothing is
    /// published under that name and type. The inlet receives samples pushed
    /// after this call and buffers up to [`DEFAULT_INLET_BUFFER`] of them.
    pub fn resolve(&self, name: &str, stream_type: &str) -> Option<StreamInlet> {
        self.resolve_with_buffer(name, stream_type, DEFAULT_INLET_BUFFER)
    }

    /// Like [`resolve`](Self::resolve), holding at most `buffer` worth of
    /// samples at the stream's nominal rate. While the inlet is full, newer
    /// samples are dropped for it and counted.
    pub fn resolve_with_buffer(
        &self,
        name: &str,
        stream_type: &str,
        buffer: Duration,
    ) -> Option<StreamInlet> {
        let key = StreamKey {
            name: name.to_string(),
            stream_type: stream_type.to_string(),
        };
        let shared = {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.get(&key).and_then(Weak::upgrade)?
        };

        let capacity = shared.info.buffer_capacity(buffer);
        let (receiver, dropped) = shared.subscribe(capacity);
        debug!(
            "Resolved inlet for stream '{}' ({}), buffering {} samples",
            name, stream_type, capacity
        );
        Some(StreamInlet {
            info: shared.info.clone(),
            receiver: Some(receiver),
            dropped,
        })
    }

    /// Lists the streams that currently have a live outlet
    pub fn streams(&self) -> Vec<StreamInfo> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .values()
            .filter_map(Weak::upgrade)
            .map(|shared| shared.info.clone())
            .collect()
    }

    fn unregister(&self, key: &StreamKey, shared: &Arc<OutletShared>) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams
            .get(key)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(shared)))
        {
            streams.remove(key);
        }
    }
}

/// Publish side of a stream. Dropping it removes the stream from discovery;
/// inlets keep whatever was already queued for them.
pub struct StreamOutlet {
    shared: Arc<OutletShared>,
    key: StreamKey,
    registry: StreamRegistry,
}

impl fmt::Debug for StreamOutlet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamOutlet")
            .field("info", &self.shared.info)
            .finish()
    }
}

impl StreamOutlet {
    pub fn info(&self) -> &StreamInfo {
        &self.shared.info
    }

    /// Queues one sample for every attached inlet without waiting. A full
    /// inlet loses the sample; closed inlets are dropped from the fan-out list.
    pub fn push_sample(&self, vector: &OutputVector, timestamp: f64) {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let name = &self.shared.info.name;
        subscribers.retain_mut(|sub| {
            let sample = TimestampedSample {
                vector: *vector,
                timestamp,
            };
            match sub.tx.try_send(sample) {
                Ok(()) => {
                    sub.overflowing = false;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if !sub.overflowing {
                        warn!(
                            "Inlet on '{}' is full, dropping samples ({} so far)",
                            name, dropped
                        );
                        sub.overflowing = true;
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn have_consumers(&self) -> bool {
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.iter().any(|sub| !sub.tx.is_closed())
    }
}

impl Drop for StreamOutlet {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, &self.shared);
        debug!("Outlet '{}' closed", self.shared.info.name);
    }
}

/// Subscribe side of a stream
pub struct StreamInlet {
    info: StreamInfo,
    receiver: Option<mpsc::Receiver<TimestampedSample>>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for StreamInlet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamInlet")
            .field("info", &self.info)
            .field("open", &self.receiver.is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl StreamInlet {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Drains every sample queued since the last pull, in publish order.
    /// Vectors and timestamps are always the same length; both are empty
    /// when nothing arrived. Never waits for new data.
    pub fn pull_chunk(&mut self) -> Result<(Vec<OutputVector>, Vec<f64>), ChannelError> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| ChannelError::Closed(self.info.name.clone()))?;

        let mut vectors = Vec::new();
        let mut timestamps = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(sample) => {
                    vectors.push(sample.vector);
                    timestamps.push(sample.timestamp);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                // outlet gone, queue drained
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
        Ok((vectors, timestamps))
    }

    /// Detaches from the stream; later pulls fail with [`ChannelError::Closed`]
    pub fn close_stream(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            debug!("Inlet for '{}' closed", self.info.name);
        } else {
            warn!("Inlet for '{}' was already closed", self.info.name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    /// Samples lost because this inlet's buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(value: f64) -> OutputVector {
        [value; OUTPUT_LEN]
    }

    #[test]
    fn pull_on_quiet_stream_returns_two_empty_sequences() {
        let registry = StreamRegistry::new();
        let _outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        let mut inlet = registry.resolve("hand", "hand").expect("stream must resolve");

        let (vectors, timestamps) = inlet.pull_chunk().unwrap();
        assert!(vectors.is_empty());
        assert!(timestamps.is_empty());
    }

    #[test]
    fn pull_preserves_publish_order() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();

        for i in 0..5 {
            outlet.push_sample(&vector(i as f64), 10.0 + i as f64);
        }

        let (vectors, timestamps) = inlet.pull_chunk().unwrap();
        assert_eq!(timestamps, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
        assert_eq!(vectors.len(), timestamps.len());
        assert_eq!(vectors[3], vector(3.0));

        let (vectors, timestamps) = inlet.pull_chunk().unwrap();
        assert!(vectors.is_empty() && timestamps.is_empty());
    }

    #[test]
    fn every_inlet_sees_every_sample() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        let mut first = registry.resolve("hand", "hand").unwrap();
        let mut second = registry.resolve("hand", "hand").unwrap();

        outlet.push_sample(&vector(1.0), 1.0);
        outlet.push_sample(&vector(2.0), 2.0);

        assert_eq!(first.pull_chunk().unwrap().1, vec![1.0, 2.0]);
        assert_eq!(second.pull_chunk().unwrap().1, vec![1.0, 2.0]);
    }

    #[test]
    fn resolve_requires_matching_type() {
        let registry = StreamRegistry::new();
        let _outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        assert!(registry.resolve("hand", "EEG").is_none());
        assert!(registry.resolve("other", "hand").is_none());
    }

    #[test]
    fn duplicate_outlet_is_rejected_until_first_is_dropped() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        assert!(matches!(
            registry.create_outlet(StreamInfo::hand()),
            Err(ChannelError::DuplicateStream { .. })
        ));

        drop(outlet);
        assert!(registry.resolve("hand", "hand").is_none());
        assert!(registry.create_outlet(StreamInfo::hand()).is_ok());
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let registry = StreamRegistry::new();
        let info = StreamInfo::new("hand", "hand", 8, 1000.0);
        assert!(matches!(
            registry.create_outlet(info),
            Err(ChannelError::ChannelCountMismatch {
                declared: 8,
                expected: OUTPUT_LEN
            })
        ));
    }

    #[test]
    fn queued_samples_survive_outlet_drop() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();

        outlet.push_sample(&vector(0.5), 3.0);
        drop(outlet);

        assert_eq!(inlet.pull_chunk().unwrap().1, vec![3.0]);
        assert!(inlet.pull_chunk().unwrap().0.is_empty());
    }

    #[test]
    fn closed_inlet_refuses_pulls_and_is_pruned() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        let mut inlet = registry.resolve("hand", "hand").unwrap();
        assert!(outlet.have_consumers());

        inlet.close_stream();
        assert!(!inlet.is_open());
        assert!(matches!(inlet.pull_chunk(), Err(ChannelError::Closed(_))));

        outlet.push_sample(&vector(1.0), 1.0);
        assert!(!outlet.have_consumers());
    }

    #[test]
    fn full_inlet_drops_newest_samples_and_counts_them() {
        let registry = StreamRegistry::new();
        let outlet = registry.create_outlet(StreamInfo::hand()).unwrap();
        // 5 ms at 1 kHz
        let mut slow = registry
            .resolve_with_buffer("hand", "hand", Duration::from_millis(5))
            .unwrap();
        let mut fast = registry.resolve("hand", "hand").unwrap();

        for i in 0..8 {
            outlet.push_sample(&vector(i as f64), i as f64);
        }

        let (vectors, timestamps) = slow.pull_chunk().unwrap();
        assert_eq!(timestamps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(vectors.len(), 5);
        assert_eq!(slow.dropped(), 3);

        assert_eq!(fast.pull_chunk().unwrap().1.len(), 8);
        assert_eq!(fast.dropped(), 0);

        // drained inlet accepts samples again
        outlet.push_sample(&vector(9.0), 9.0);
        assert_eq!(slow.pull_chunk().unwrap().1, vec![9.0]);
        assert_eq!(slow.dropped(), 3);
    }

    #[test]
    fn buffer_capacity_follows_nominal_rate() {
        let info = StreamInfo::hand();
        assert_eq!(info.buffer_capacity(DEFAULT_INLET_BUFFER), 10_000);
        assert_eq!(info.buffer_capacity(Duration::from_micros(10)), 1);
        assert_eq!(info.buffer_capacity(Duration::ZERO), 1);
        assert_eq!(
            info.buffer_capacity(Duration::from_secs(1_000_000)),
            MAX_INLET_CAPACITY
        );
    }
}
