//! # Configuration
//!
//! All tunables live in one TOML file:
//!
//! ```toml
//! [device]
//! product_id = 1158
//! usage = 512
//!
//! [device.read_mode]
//! mode = "non_blocking"
//! idle_wait_us = 500
//!
//! [stream]
//! name = "hand"
//! type = "hand"
//! nominal_srate = 1000.0
//!
//! [bridge]
//! ready_timeout_ms = 5000
//! stats_interval_secs = 10
//! max_consecutive_failures = 1000
//! inlet_buffer_secs = 10
//! ```
//!
//! The file is looked up at `$HANDSTREAM_CONFIG`, then in the user config
//! directory. A missing file is not an error: every section has defaults, so
//! the bridge still starts. Values outside their safe range are clamped with
//! a warning instead of rejected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::stream_bridge::{
    BridgeSettings, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_READY_TIMEOUT,
    DEFAULT_STATS_INTERVAL,
};
use crate::device::hid::DeviceSelector;
use crate::device::reader::{
    ReadMode, ReaderSettings, DEFAULT_READ_TIMEOUT_MS, MAX_IDLE_WAIT,
};
use crate::stream::channel::{
    DEFAULT_INLET_BUFFER, HAND_NOMINAL_SRATE, HAND_STREAM_NAME, HAND_STREAM_TYPE,
};
use crate::stream::StreamInfo;

pub const CONFIG_ENV: &str = "HANDSTREAM_CONFIG";
const CONFIG_DIR: &str = "handstream";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct HandstreamConfig {
    pub device: DeviceConfig,
    pub stream: StreamConfig,
    pub bridge: BridgeConfig,
}

/// Which device to open and how to read it
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub selector: DeviceSelector,
    pub read_mode: ReadMode,
}

/// Name and metadata the samples are published under
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub nominal_srate: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: HAND_STREAM_NAME.to_string(),
            stream_type: HAND_STREAM_TYPE.to_string(),
            nominal_srate: HAND_NOMINAL_SRATE,
        }
    }
}

/// Worker lifecycle tunables
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub ready_timeout_ms: u64,
    pub stats_interval_secs: u64,
    pub max_consecutive_failures: u32,
    pub inlet_buffer_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
            stats_interval_secs: DEFAULT_STATS_INTERVAL.as_secs(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            inlet_buffer_secs: DEFAULT_INLET_BUFFER.as_secs(),
        }
    }
}

impl HandstreamConfig {
    /// `<config dir>/handstream/config.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads from `path`, `$HANDSTREAM_CONFIG` or the default location, in
    /// that order. Falls back to defaults when no file exists.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(Self::default_path);

        let Some(path) = path else {
            warn!("No config directory available, using default configuration");
            return Ok(Self::default());
        };

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;
        if !exists {
            info!(
                "No config file at {}, using default configuration",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        debug!("Parsed configuration: {:?}", config);
        Ok(config.validated())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))
    }

    fn validated(mut self) -> Self {
        match &mut self.device.read_mode {
            ReadMode::NonBlocking { idle_wait_us } => {
                let max = MAX_IDLE_WAIT.as_micros() as u64;
                if *idle_wait_us > max {
                    warn!(
                        "idle_wait_us {} exceeds one sample period, clamping to {}",
                        idle_wait_us, max
                    );
                    *idle_wait_us = max;
                }
            }
            ReadMode::Blocking { timeout_ms } => {
                if *timeout_ms == 0 {
                    warn!(
                        "Blocking read timeout of 0 ms would spin, using {} ms",
                        DEFAULT_READ_TIMEOUT_MS
                    );
                    *timeout_ms = DEFAULT_READ_TIMEOUT_MS;
                }
            }
        }

        if !(self.stream.nominal_srate.is_finite() && self.stream.nominal_srate > 0.0) {
            warn!(
                "Invalid nominal_srate {}, using {}",
                self.stream.nominal_srate, HAND_NOMINAL_SRATE
            );
            self.stream.nominal_srate = HAND_NOMINAL_SRATE;
        }

        if self.bridge.ready_timeout_ms == 0 {
            warn!("ready_timeout_ms of 0 can never succeed, using default");
            self.bridge.ready_timeout_ms = BridgeConfig::default().ready_timeout_ms;
        }

        if self.bridge.max_consecutive_failures == 0 {
            self.bridge.max_consecutive_failures = 1;
        }

        if self.bridge.inlet_buffer_secs == 0 {
            warn!("inlet_buffer_secs of 0 would drop nearly every sample, using 1");
            self.bridge.inlet_buffer_secs = 1;
        }

        self
    }

    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo::new(
            self.stream.name.clone(),
            self.stream.stream_type.clone(),
            StreamInfo::hand().channel_count,
            self.stream.nominal_srate,
        )
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            selector: self.device.selector.clone(),
            read_mode: self.device.read_mode,
            stream: self.stream_info(),
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            reader: self.reader_settings(),
            ready_timeout: Duration::from_millis(self.bridge.ready_timeout_ms),
            stats_interval: Duration::from_secs(self.bridge.stats_interval_secs.max(1)),
            max_consecutive_failures: self.bridge.max_consecutive_failures,
            inlet_buffer: Duration::from_secs(self.bridge.inlet_buffer_secs),
        }
    }
}
