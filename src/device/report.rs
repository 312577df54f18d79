//! Wire layout of the hand device input report
//!
//! Every report is 46 bytes, big-endian throughout:
//!
//! ```text
//! offset  0..4   u32  device counter (milliseconds)
//! offset  4..46  u16  21 channel values
//! ```
//!
//! Channel 0 carries device status and is decoded but not consumed by the
//! coordinate transform; channels 1..=20 feed the five sensing points.

use super::error::DeviceError;

/// Total length of one input report in bytes
pub const REPORT_LEN: usize = 46;

/// Number of 16-bit channels following the device counter
pub const CHANNEL_COUNT: usize = 21;

/// Channels consumed by the transform (everything after the status channel)
pub const SENSOR_CHANNELS: usize = CHANNEL_COUNT - 1;

const COUNTER_LEN: usize = 4;
const COUNTER_SCALE: f64 = 1000.0;
const CHANNEL_SCALE: f64 = u16::MAX as f64;

/// One undecoded input report, already length-checked
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReport {
    pub counter: u32,
    pub channels: [u16; CHANNEL_COUNT],
}

impl RawReport {
    /// Parses exactly [`REPORT_LEN`] bytes. Anything shorter or longer is a
    /// malformed read and is rejected instead of partially decoded.
    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.len() != REPORT_LEN {
            return Err(DeviceError::ShortReport {
                expected: REPORT_LEN,
                actual: bytes.len(),
            });
        }

        let (counter_bytes, channel_bytes) = bytes.split_at(COUNTER_LEN);
        let counter = u32::from_be_bytes([
            counter_bytes[0],
            counter_bytes[1],
            counter_bytes[2],
            counter_bytes[3],
        ]);

        let mut channels = [0u16; CHANNEL_COUNT];
        for (slot, pair) in channels.iter_mut().zip(channel_bytes.chunks_exact(2)) {
            *slot = u16::from_be_bytes([pair[0], pair[1]]);
        }

        Ok(Self { counter, channels })
    }

    /// Encodes the report back into its wire form
    pub fn to_bytes(&self) -> [u8; REPORT_LEN] {
        let mut out = [0u8; REPORT_LEN];
        out[..COUNTER_LEN].copy_from_slice(&self.counter.to_be_bytes());
        for (chunk, value) in out[COUNTER_LEN..]
            .chunks_exact_mut(2)
            .zip(self.channels.iter())
        {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
        out
    }

    /// Converts counter and channels into physical units
    pub fn decode(&self) -> DecodedSample {
        let mut channels = [0.0f64; CHANNEL_COUNT];
        for (slot, raw) in channels.iter_mut().zip(self.channels.iter()) {
            *slot = f64::from(*raw) / CHANNEL_SCALE;
        }

        DecodedSample {
            device_time: f64::from(self.counter) / COUNTER_SCALE,
            channels,
        }
    }
}

/// Report after unit normalization
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSample {
    /// Device counter in seconds
    pub device_time: f64,
    /// Channel readings mapped to `[0, 1]`
    pub channels: [f64; CHANNEL_COUNT],
}

impl DecodedSample {
    /// The channels the transform consumes, four per sensing point
    pub fn sensor_channels(&self) -> &[f64] {
        &self.channels[1..]
    }
}
