use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::worker::{run_worker, WorkerContext, WorkerReport};
use crate::clock::{Clock, LocalClock};
use crate::device::{DeviceBackend, OutputVector, ReaderSettings};
use crate::stream::channel::DEFAULT_INLET_BUFFER;
use crate::stream::{StreamInlet, StreamRegistry};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 1000;

/// Lifecycle of a [`StreamBridge`]
///
/// ```text
/// Idle ──start()──► Starting ──ready──► Running ──stop()──► Stopping ──joined──► Stopped
///  ▲                   │                   │                                      ▲  │
///  └────── failure ────┘                   └──────── worker exited, read() ───────┘  │
///  Stopped ──start()──► Starting  ◄──────────────────────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct BridgeSettings {
    pub reader: ReaderSettings,
    /// Upper bound on the readiness handshake
    pub ready_timeout: Duration,
    /// How often the worker logs its poll statistics
    pub stats_interval: Duration,
    /// Consecutive read failures after which the worker gives up
    pub max_consecutive_failures: u32,
    /// Data the bridge's inlet holds between two `read()` calls
    pub inlet_buffer: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reader: ReaderSettings::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            inlet_buffer: DEFAULT_INLET_BUFFER,
        }
    }
}

/// Foreground handle on the device worker.
///
/// The worker polls the device on its own blocking thread and publishes into
/// the registry; the bridge holds one inlet on that stream and drains it on
/// every [`read`](Self::read). Nothing but the readiness oneshot, the
/// shutdown token and the stream connects the two sides.
pub struct StreamBridge {
    settings: BridgeSettings,
    backend: Arc<dyn DeviceBackend>,
    clock: Arc<dyn Clock>,
    registry: StreamRegistry,

    state: BridgeState,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<WorkerReport>>,
    inlet: Option<StreamInlet>,
    last_report: Option<WorkerReport>,
}

impl StreamBridge {
    pub fn new(settings: BridgeSettings, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            settings,
            backend,
            clock: Arc::new(LocalClock),
            registry: StreamRegistry::new(),
            state: BridgeState::Idle,
            shutdown: CancellationToken::new(),
            worker: None,
            inlet: None,
            last_report: None,
        }
    }

    /// Publish into an existing registry so other consumers can resolve the
    /// same stream
    pub fn with_registry(mut self, registry: StreamRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Whether a worker thread is still attached and has not returned
    pub fn is_worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Outcome of the most recently joined worker
    pub fn last_report(&self) -> Option<WorkerReport> {
        self.last_report
    }

    /// Launches the worker and waits for it to open the device and publish
    /// its stream, then attaches an inlet to that stream.
    ///
    /// Discovery only happens after readiness. Any failure cancels the
    /// worker and leaves the bridge `Idle`.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        match self.state {
            BridgeState::Idle | BridgeState::Stopped => {}
            state => {
                return Err(BridgeError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        // A worker left behind by a failed start must be gone first
        self.reap_worker().await?;

        info!("Starting stream bridge");
        self.state = BridgeState::Starting;
        self.shutdown = CancellationToken::new();

        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = WorkerContext {
            settings: self.settings.reader.clone(),
            backend: self.backend.clone(),
            clock: self.clock.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            ready: ready_tx,
            stats_interval: self.settings.stats_interval,
            max_consecutive_failures: self.settings.max_consecutive_failures,
        };
        self.worker = Some(tokio::task::spawn_blocking(move || run_worker(ctx)));
        debug!(
            "Worker spawned, waiting up to {:?} for readiness",
            self.settings.ready_timeout
        );

        let info = match tokio::time::timeout(self.settings.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(info))) => info,
            Ok(Ok(Err(device_error))) => {
                return Err(self.abort_start(BridgeError::Device(device_error)).await)
            }
            Ok(Err(_)) => return Err(self.abort_start(BridgeError::WorkerExited).await),
            Err(_) => {
                let timeout = self.settings.ready_timeout;
                return Err(self
                    .abort_start(BridgeError::WorkerStartTimeout(timeout))
                    .await);
            }
        };

        let resolved = self.registry.resolve_with_buffer(
            &info.name,
            &info.stream_type,
            self.settings.inlet_buffer,
        );
        let Some(inlet) = resolved else {
            let err = BridgeError::ChannelUnavailable {
                name: info.name,
                stream_type: info.stream_type,
            };
            return Err(self.abort_start(err).await);
        };

        info!(
            "Stream bridge running on '{}' ({} channels @ {} Hz)",
            info.name, info.channel_count, info.nominal_srate
        );
        self.inlet = Some(inlet);
        self.state = BridgeState::Running;
        Ok(())
    }

    /// Returns every sample published since the previous call, in publish
    /// order, with index-aligned timestamps. Both sequences are empty when
    /// nothing arrived. Never waits for data.
    ///
    /// Once the worker has exited on its own and its last samples were
    /// drained, fails with [`BridgeError::WorkerExited`] and leaves the bridge
    /// `Stopped`; `stop()` or the next `start()` joins the worker.
    pub fn read(&mut self) -> Result<(Vec<OutputVector>, Vec<f64>), BridgeError> {
        if self.state != BridgeState::Running {
            return Err(BridgeError::NotRunning(self.state));
        }
        let inlet = self
            .inlet
            .as_mut()
            .ok_or(BridgeError::NotRunning(self.state))?;

        // Checked before the pull so nothing pushed ahead of the exit is lost
        let worker_gone = self.worker.as_ref().is_some_and(|h| h.is_finished());
        let (vectors, timestamps) = inlet.pull_chunk()?;
        debug_assert_eq!(vectors.len(), timestamps.len());

        // Samples queued before the worker exited are still handed out first
        if vectors.is_empty() && worker_gone {
            warn!("Worker exited on its own, bridge no longer running");
            if let Some(mut inlet) = self.inlet.take() {
                inlet.close_stream();
            }
            self.state = BridgeState::Stopped;
            return Err(BridgeError::WorkerExited);
        }
        Ok((vectors, timestamps))
    }

    /// Detaches the inlet, signals shutdown and joins the worker. Safe in any
    /// state; on an idle bridge it only reaps a worker left by a failed start.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        match self.state {
            BridgeState::Idle | BridgeState::Stopped => return self.reap_worker().await,
            _ => {}
        }

        info!("Stopping stream bridge");
        self.state = BridgeState::Stopping;
        if let Some(mut inlet) = self.inlet.take() {
            inlet.close_stream();
        }
        self.shutdown.cancel();

        let joined = self.reap_worker().await;
        self.state = BridgeState::Stopped;
        info!("Stream bridge stopped");
        joined
    }

    async fn abort_start(&mut self, err: BridgeError) -> BridgeError {
        error!("Stream bridge failed to start: {}", err);
        self.shutdown.cancel();
        self.inlet = None;

        if let Some(mut worker) = self.worker.take() {
            match tokio::time::timeout(self.settings.ready_timeout, &mut worker).await {
                Ok(Ok(report)) => {
                    debug!("Worker exited after failed start: {:?}", report.exit);
                    self.last_report = Some(report);
                }
                Ok(Err(e)) => error!("Worker panicked during start: {}", e),
                Err(_) => {
                    warn!("Worker still busy after failed start, stop() will join it");
                    self.worker = Some(worker);
                }
            }
        }

        self.state = BridgeState::Idle;
        err
    }

    async fn reap_worker(&mut self) -> Result<(), BridgeError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        match worker.await {
            Ok(report) => {
                info!(
                    "Worker joined: {:?} after {} polls, {} samples, {} dropped",
                    report.exit,
                    report.stats.iterations,
                    report.stats.samples,
                    report.stats.dropped
                );
                self.last_report = Some(report);
                Ok(())
            }
            Err(e) => Err(BridgeError::WorkerPanicked(e.to_string())),
        }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if self.is_worker_alive() {
            warn!("StreamBridge dropped without stop(), worker will exit on its own");
        }
    }
}
