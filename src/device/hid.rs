//! Platform HID seam
//!
//! The reader only needs an enumeration listing and a handle that can read
//! fixed-size reports. [`DeviceBackend`] and [`HidHandle`] capture exactly
//! that, so the poll loop runs unchanged against the real `hidapi` backend
//! or the scripted backend in [`super::mock`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DeviceError;

/// Product id reported by the hand device
pub const HAND_PRODUCT_ID: u16 = 1158;

/// HID usage of the interface that carries force reports
pub const HAND_USAGE: u16 = 512;

/// One entry of the platform enumeration listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
    /// Opaque platform path, passed back to [`DeviceBackend::open_path`]
    pub path: String,
    pub product: Option<String>,
}

/// Identifiers a listing entry must carry to be picked
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    #[serde(default = "default_usage")]
    pub usage: u16,
}

fn default_product_id() -> u16 {
    HAND_PRODUCT_ID
}

fn default_usage() -> u16 {
    HAND_USAGE
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: HAND_PRODUCT_ID,
            usage: HAND_USAGE,
        }
    }
}

impl DeviceSelector {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id.map_or(true, |vid| vid == info.vendor_id)
            && info.product_id == self.product_id
            && info.usage == self.usage
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(
                f,
                "vendor {:#06x}, product {}, usage {}",
                vid, self.product_id, self.usage
            ),
            None => write!(f, "product {}, usage {}", self.product_id, self.usage),
        }
    }
}

/// An exclusively opened device. Dropping the handle closes it.
pub trait HidHandle: Send + fmt::Debug {
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError>;

    /// Reads one report; returns 0 when a non-blocking handle has nothing queued
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Reads one report, waiting at most `timeout`; returns 0 on timeout
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, DeviceError>;
}

/// Source of enumeration listings and opened handles
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn open_path(&self, path: &str) -> Result<Box<dyn HidHandle>, DeviceError>;
}

#[cfg(feature = "hidapi")]
pub use self::hidapi_backend::HidApiBackend;

#[cfg(feature = "hidapi")]
mod hidapi_backend {
    use std::ffi::CString;
    use std::fmt;
    use std::sync::Mutex;
    use std::time::Duration;

    use hidapi::{HidApi, HidDevice};
    use tracing::debug;

    use super::{DeviceBackend, DeviceInfo, HidHandle};
    use crate::device::error::DeviceError;

    /// Backend over the system HID library
    pub struct HidApiBackend {
        api: Mutex<HidApi>,
    }

    impl fmt::Debug for HidApiBackend {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.debug_struct("HidApiBackend").finish_non_exhaustive()
        }
    }

    impl HidApiBackend {
        pub fn new() -> Result<Self, DeviceError> {
            let api = HidApi::new().map_err(|e| DeviceError::Transport(e.to_string()))?;
            Ok(Self {
                api: Mutex::new(api),
            })
        }
    }

    impl DeviceBackend for HidApiBackend {
        fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
            let mut api = self.api.lock().unwrap_or_else(|e| e.into_inner());
            api.refresh_devices()
                .map_err(|e| DeviceError::Transport(e.to_string()))?;

            let listing: Vec<DeviceInfo> = api
                .device_list()
                .map(|d| DeviceInfo {
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    usage_page: d.usage_page(),
                    usage: d.usage(),
                    path: d.path().to_string_lossy().into_owned(),
                    product: d.product_string().map(str::to_owned),
                })
                .collect();
            debug!("hidapi enumerated {} interfaces", listing.len());
            Ok(listing)
        }

        fn open_path(&self, path: &str) -> Result<Box<dyn HidHandle>, DeviceError> {
            let c_path = CString::new(path).map_err(|e| DeviceError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            let api = self.api.lock().unwrap_or_else(|e| e.into_inner());
            let device = api.open_path(&c_path).map_err(|e| DeviceError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(HidApiHandle {
                device,
                path: path.to_string(),
            }))
        }
    }

    struct HidApiHandle {
        device: HidDevice,
        path: String,
    }

    impl fmt::Debug for HidApiHandle {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.debug_struct("HidApiHandle")
                .field("path", &self.path)
                .finish()
        }
    }

    impl HidHandle for HidApiHandle {
        fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError> {
            self.device
                .set_blocking_mode(!nonblocking)
                .map_err(|e| DeviceError::Transport(e.to_string()))
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            self.device
                .read(buf)
                .map_err(|e| DeviceError::Transport(e.to_string()))
        }

        fn read_timeout(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<usize, DeviceError> {
            let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            self.device
                .read_timeout(buf, millis)
                .map_err(|e| DeviceError::Transport(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(product_id: u16, usage: u16) -> DeviceInfo {
        DeviceInfo {
            vendor_id: 0x16c0,
            product_id,
            usage_page: 0xFFAB,
            usage,
            path: "/dev/hidraw3".into(),
            product: Some("hand".into()),
        }
    }

    #[test]
    fn default_selector_matches_hand_interface() {
        let selector = DeviceSelector::default();
        assert!(selector.matches(&listing(1158, 512)));
        assert!(!selector.matches(&listing(1158, 1)));
        assert!(!selector.matches(&listing(1157, 512)));
    }

    #[test]
    fn vendor_id_narrows_the_match() {
        let selector = DeviceSelector {
            vendor_id: Some(0x1234),
            ..DeviceSelector::default()
        };
        assert!(!selector.matches(&listing(1158, 512)));
    }
}
