//! Bridges the hand force-sensing device onto a named, timestamped sample
//! stream and lets consumers drain it in chunks without touching the device.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod device;
pub mod stream;

pub use bridge::{BridgeError, BridgeSettings, BridgeState, StreamBridge};
pub use config::HandstreamConfig;
pub use device::{DeviceError, DeviceReader, OutputVector, ReadMode};
pub use stream::{StreamInfo, StreamRegistry, TimestampedSample};
