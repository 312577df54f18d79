//! Hand device access
//!
//! Turns raw HID input reports into published, timestamped vectors:
//!
//! 1. [`hid`] - enumeration and handle traits, optional `hidapi` backend
//! 2. [`report`] - fixed 46-byte wire layout and unit normalization
//! 3. [`transform`] - rotation of each sensing point into the output frame
//! 4. [`reader`] - the [`DeviceReader`] state machine tying them together
//!
//! ```text
//! HID read ──► RawReport ──► DecodedSample ──► OutputVector ──► StreamOutlet
//!              (46 bytes)    (units)           (15 values)      (+ timestamp)
//! ```

pub mod error;
pub mod hid;
pub mod mock;
pub mod reader;
pub mod report;
pub mod transform;

pub use error::DeviceError;
pub use hid::{DeviceBackend, DeviceInfo, DeviceSelector, HidHandle};
pub use reader::{DeviceReader, PollStats, ReadMode, ReaderSettings};
pub use report::{DecodedSample, RawReport};
pub use transform::{HandTransform, OutputVector};

#[cfg(feature = "hidapi")]
pub use hid::HidApiBackend;
