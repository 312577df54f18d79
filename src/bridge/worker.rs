//! Device-side half of the bridge
//!
//! Runs on a dedicated blocking thread and owns the [`DeviceReader`] for its
//! whole life. It talks to the foreground only through the readiness
//! oneshot, the shutdown token and the stream outlet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::device::reader::Streaming;
use crate::device::{DeviceBackend, DeviceError, DeviceReader, PollStats, ReaderSettings};
use crate::stream::{StreamInfo, StreamRegistry};

/// Pause after a failed read so an unplugged device does not spin the loop
const FAILURE_BACKOFF: Duration = Duration::from_millis(1);

pub type ReadySender = oneshot::Sender<Result<StreamInfo, DeviceError>>;

/// Everything moved onto the worker thread
pub struct WorkerContext {
    pub settings: ReaderSettings,
    pub backend: Arc<dyn DeviceBackend>,
    pub clock: Arc<dyn Clock>,
    pub registry: StreamRegistry,
    pub shutdown: CancellationToken,
    pub ready: ReadySender,
    pub stats_interval: Duration,
    pub max_consecutive_failures: u32,
}

/// Why the worker returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown observed while polling
    Shutdown,
    /// The device could not be opened; the error went to the readiness channel
    OpenFailed,
    /// Shutdown was requested before readiness could be signalled
    CancelledBeforeReady,
    /// Nobody was waiting for readiness any more
    Abandoned,
    /// Too many consecutive read failures
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub stats: PollStats,
}

pub fn run_worker(ctx: WorkerContext) -> WorkerReport {
    info!("Hand worker starting");

    let reader = DeviceReader::create(ctx.settings, ctx.backend, ctx.clock);
    let mut reader = match reader.open(&ctx.registry) {
        Ok(reader) => reader,
        Err(e) => {
            error!("Failed to open hand device: {}", e);
            if ctx.ready.send(Err(e)).is_err() {
                debug!("Open failure not delivered, bridge stopped waiting");
            }
            return WorkerReport {
                exit: WorkerExit::OpenFailed,
                stats: PollStats::default(),
            };
        }
    };

    if ctx.shutdown.is_cancelled() {
        warn!("Shutdown requested before the worker became ready");
        let stats = reader.stats();
        reader.close();
        return WorkerReport {
            exit: WorkerExit::CancelledBeforeReady,
            stats,
        };
    }

    if ctx.ready.send(Ok(reader.stream_info().clone())).is_err() {
        warn!("Bridge stopped waiting for readiness, closing device");
        let stats = reader.stats();
        reader.close();
        return WorkerReport {
            exit: WorkerExit::Abandoned,
            stats,
        };
    }
    info!("Hand worker ready, entering poll loop");

    let exit = poll_loop(
        &mut reader,
        &ctx.shutdown,
        ctx.stats_interval,
        ctx.max_consecutive_failures,
    );

    let stats = reader.stats();
    reader.close();
    info!("Hand worker finished: {:?}, {:?}", exit, stats);
    WorkerReport { exit, stats }
}

/// Polls until shutdown is observed. The flag is checked once per
/// iteration, so stop latency is bounded by one poll.
pub fn poll_loop(
    reader: &mut DeviceReader<Streaming>,
    shutdown: &CancellationToken,
    stats_interval: Duration,
    max_consecutive_failures: u32,
) -> WorkerExit {
    let idle_wait = reader.settings().read_mode.idle_wait();

    let log_interval =
        chrono::Duration::from_std(stats_interval).unwrap_or(chrono::Duration::seconds(10));
    let mut last_log_time = Local::now();
    let mut logged = reader.stats();

    while !shutdown.is_cancelled() {
        match reader.poll() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Some(wait) = idle_wait {
                    std::thread::sleep(wait);
                }
            }
            Err(e) if e.is_recoverable() => {
                let failures = reader.stats().consecutive_failures;
                if failures >= max_consecutive_failures {
                    error!(
                        "Giving up after {} consecutive read failures, last: {}",
                        failures, e
                    );
                    return WorkerExit::DeviceLost;
                }
                match e {
                    DeviceError::ShortReport { .. } => warn!("Dropped sample: {}", e),
                    _ => {
                        warn!("Read failed: {}", e);
                        std::thread::sleep(FAILURE_BACKOFF);
                    }
                }
            }
            Err(e) => {
                error!("Unrecoverable read error: {}", e);
                return WorkerExit::DeviceLost;
            }
        }

        let now = Local::now();
        if now - last_log_time > log_interval {
            let stats = reader.stats();
            let elapsed = (now - last_log_time).num_milliseconds().max(1) as f64 / 1000.0;
            info!(
                "Worker stats: {} samples, {} empty reads, {} dropped in {:.1}s (avg {:.1} Hz)",
                stats.samples - logged.samples,
                stats.empty_reads - logged.empty_reads,
                stats.dropped - logged.dropped,
                elapsed,
                (stats.samples - logged.samples) as f64 / elapsed
            );
            logged = stats;
            last_log_time = now;
        }
    }

    debug!("Shutdown observed after {} polls", reader.stats().iterations);
    WorkerExit::Shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LocalClock;
    use crate::device::mock::{MockBackend, MockRead};
    use crate::device::ReadMode;

    fn context(
        backend: &MockBackend,
        registry: &StreamRegistry,
        shutdown: &CancellationToken,
        ready: ReadySender,
    ) -> WorkerContext {
        WorkerContext {
            settings: ReaderSettings {
                read_mode: ReadMode::non_blocking(),
                ..ReaderSettings::default()
            },
            backend: Arc::new(backend.clone()),
            clock: Arc::new(LocalClock),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
            ready,
            stats_interval: Duration::from_secs(10),
            max_consecutive_failures: 3,
        }
    }

    #[test]
    fn open_failure_is_reported_through_readiness() {
        let backend = MockBackend::with_listing(Vec::new());
        let registry = StreamRegistry::new();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        let report = run_worker(context(&backend, &registry, &shutdown, tx));
        assert_eq!(report.exit, WorkerExit::OpenFailed);
        assert!(matches!(rx.try_recv(), Ok(Err(DeviceError::DeviceNotFound(_)))));
    }

    #[test]
    fn cancelled_worker_closes_device_without_signalling() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (tx, mut rx) = oneshot::channel();

        let report = run_worker(context(&backend, &registry, &shutdown, tx));
        assert_eq!(report.exit, WorkerExit::CancelledBeforeReady);
        assert_eq!(backend.probe().closed(), 1);
        assert!(rx.try_recv().is_err());
        assert!(registry.streams().is_empty());
    }

    #[test]
    fn abandoned_worker_closes_device() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();
        let shutdown = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        drop(rx);

        let report = run_worker(context(&backend, &registry, &shutdown, tx));
        assert_eq!(report.exit, WorkerExit::Abandoned);
        assert_eq!(backend.probe().closed(), 1);
    }

    #[test]
    fn repeated_failures_end_the_loop() {
        let backend = MockBackend::hand();
        for _ in 0..5 {
            backend.push(MockRead::Fail("unplugged".into()));
        }
        let registry = StreamRegistry::new();
        let shutdown = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();

        let report = run_worker(context(&backend, &registry, &shutdown, tx));
        assert_eq!(report.exit, WorkerExit::DeviceLost);
        assert_eq!(report.stats.transport_errors, 3);
        assert_eq!(backend.probe().closed(), 1);
    }

    #[test]
    fn empty_reads_keep_the_loop_alive_until_shutdown() {
        let backend = MockBackend::hand();
        let registry = StreamRegistry::new();
        let shutdown = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();
        let ctx = context(&backend, &registry, &shutdown, tx);

        let worker = std::thread::spawn(move || run_worker(ctx));
        std::thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        let report = worker.join().expect("worker thread must not panic");

        assert_eq!(report.exit, WorkerExit::Shutdown);
        assert!(report.stats.iterations > 1);
        assert_eq!(report.stats.iterations, report.stats.empty_reads);
        assert_eq!(report.stats.samples, 0);
    }
}
