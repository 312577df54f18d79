use std::time::Duration;

use super::stream_bridge::BridgeState;
use crate::device::DeviceError;
use crate::stream::ChannelError;

/// Errors surfaced by [`super::StreamBridge`]
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The worker did not report an open device within the bound
    #[error("Worker did not signal readiness within {0:?}")]
    WorkerStartTimeout(Duration),

    /// The worker was ready but its stream could not be resolved
    #[error("Stream '{name}' of type '{stream_type}' could not be resolved")]
    ChannelUnavailable { name: String, stream_type: String },

    /// The worker failed to open the device
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Stream error: {0}")]
    Channel(#[from] ChannelError),

    /// `read()` outside the running state
    #[error("Bridge is not running (state: {0:?})")]
    NotRunning(BridgeState),

    #[error("Cannot {operation} while bridge is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BridgeState,
    },

    /// The worker went away, either before the readiness handshake or
    /// while the bridge was running
    #[error("Worker exited")]
    WorkerExited,

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}
