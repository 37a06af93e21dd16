//! Configuration using Figment.
//!
//! Loaded from a TOML file, then overridden by environment variables with the
//! `RUST_MIDI_` prefix, where `__` separates nesting levels:
//!
//! ```text
//! RUST_MIDI_LOGGING__LEVEL=debug
//! RUST_MIDI_INPUT__DEVICE_ID=1
//! ```
//!
//! Every section and field has a default, so an empty or missing file yields
//! [`MidiConfig::default`].

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::driver::DeviceId;
use crate::error::{MidiError, Result};
use crate::logging::{self, OutputFormat};
use crate::session::{SessionOptions, DEFAULT_JOIN_TIMEOUT, DEFAULT_WORKER_NAME};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_MIDI_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Log output
    pub logging: LoggingConfig,
    /// Input device and its sysex buffers
    pub input: InputConfig,
    /// Output device
    pub output: OutputConfig,
    /// Reclaim worker
    pub worker: WorkerConfig,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Line format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// `[input]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Input device to open
    pub device_id: DeviceId,
    /// Buffers queued before streaming starts
    pub sysex_buffer_count: usize,
    /// Capacity of each queued buffer in bytes
    pub sysex_buffer_size: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            sysex_buffer_count: 4,
            sysex_buffer_size: 1024,
        }
    }
}

/// `[output]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device to open
    pub device_id: DeviceId,
}

/// `[worker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name given to reclaim threads
    pub thread_name: String,
    /// How long close and stop wait for the worker to exit
    pub join_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_WORKER_NAME.to_string(),
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl MidiConfig {
    /// Load from `path` and the environment.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse a TOML document, without environment overrides.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(document))
            .extract()?;
        Ok(config)
    }

    /// Check value ranges after loading.
    pub fn validate(&self) -> Result<()> {
        logging::parse_level(&self.logging.level)?;

        if self.input.sysex_buffer_count == 0 {
            return Err(MidiError::Configuration(
                "input.sysex_buffer_count must be at least 1".to_string(),
            ));
        }
        if self.input.sysex_buffer_size == 0 {
            return Err(MidiError::Configuration(
                "input.sysex_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.worker.thread_name.trim().is_empty() {
            return Err(MidiError::Configuration(
                "worker.thread_name must not be empty".to_string(),
            ));
        }
        if self.worker.join_timeout_ms == 0 {
            return Err(MidiError::Configuration(
                "worker.join_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker settings for sessions and output devices.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            worker_name: self.worker.thread_name.clone(),
            join_timeout: Duration::from_millis(self.worker.join_timeout_ms),
        }
    }
}
