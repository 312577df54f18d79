use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use handstream::device::mock::MockBackend;
use handstream::device::DeviceBackend;
use handstream::{BridgeError, HandstreamConfig, StreamBridge};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Rate at which the foreground drains the bridge, one pull per frame
const FRAME_RATE_HZ: u64 = 60;

const MOCK_ENV: &str = "HANDSTREAM_MOCK";

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = HandstreamConfig::load(None).await?;
    info!("Initializing hand bridge with settings: {:?}", config);

    let backend = select_backend()?;
    let mut bridge = StreamBridge::new(config.bridge_settings(), backend);
    bridge
        .start()
        .await
        .map_err(|e| eyre!("Failed to start stream bridge: {}", e))?;

    // stop() runs whether or not the frame loop failed
    let frames = run_frames(&mut bridge).await;
    bridge
        .stop()
        .await
        .map_err(|e| eyre!("Failed to stop stream bridge: {}", e))?;

    if let Some(report) = bridge.last_report() {
        info!("Worker report: {:?}", report);
    }
    frames
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

/// Filter from `RUST_LOG`, falling back to INFO when unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn setup_logging_env() {
    let directives = std::env::var("RUST_LOG").ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(directives.as_deref()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn select_backend() -> Result<Arc<dyn DeviceBackend>> {
    let force_mock = std::env::var(MOCK_ENV).is_ok_and(|v| v == "1");

    #[cfg(feature = "hidapi")]
    if !force_mock {
        info!("Using hidapi backend");
        let backend = handstream::device::HidApiBackend::new()
            .map_err(|e| eyre!("Failed to initialise hidapi: {}", e))?;
        return Ok(Arc::new(backend));
    }

    if !force_mock {
        warn!("Built without the hidapi feature, falling back to the synthetic device");
    }
    info!("Using synthetic mock backend");
    Ok(Arc::new(MockBackend::hand().synthetic()))
}

/// Pulls from the bridge once per frame until Ctrl-C or the worker exits
async fn run_frames(bridge: &mut StreamBridge) -> Result<()> {
    let mut frame = tokio::time::interval(Duration::from_millis(1000 / FRAME_RATE_HZ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut frames: u64 = 0;
    let mut samples: usize = 0;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                return Ok(());
            }
            _ = frame.tick() => {
                let (vectors, timestamps) = match bridge.read() {
                    Ok(chunk) => chunk,
                    Err(BridgeError::WorkerExited) => {
                        warn!("Worker exited on its own, leaving frame loop");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                frames += 1;
                samples += vectors.len();

                if let (Some(latest), Some(timestamp)) = (vectors.last(), timestamps.last()) {
                    debug!("Frame {}: {} samples, latest at {:.4}s", frames, vectors.len(), timestamp);
                    if frames % FRAME_RATE_HZ == 0 {
                        info!(
                            "{} samples in last second, point 0 at ({:.4}, {:.4}, {:.4})",
                            samples, latest[0], latest[1], latest[2]
                        );
                        samples = 0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn rust_log_directives_raise_the_level() {
        let filter = log_filter(Some("handstream=debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn missing_or_invalid_rust_log_defaults_to_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(
            log_filter(Some("handstream=loud")).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }
}
