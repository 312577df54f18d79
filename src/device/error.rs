use crate::stream::ChannelError;

/// Errors raised while locating, opening or reading the hand device
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No enumerated device matched the selector
    #[error("No matching device: {0}")]
    DeviceNotFound(String),

    /// A device matched but the platform refused to open it
    #[error("Failed to open device at {path}: {reason}")]
    Open { path: String, reason: String },

    /// A read returned a report of the wrong length
    #[error("Malformed report: expected {expected} bytes, got {actual}")]
    ShortReport { expected: usize, actual: usize },

    /// The platform HID layer failed during enumeration or read
    #[error("Transport error: {0}")]
    Transport(String),

    /// The outbound stream could not be created
    #[error("Stream error: {0}")]
    Channel(#[from] ChannelError),
}

impl DeviceError {
    /// Whether the poll loop may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShortReport { .. } | Self::Transport(_))
    }
}
