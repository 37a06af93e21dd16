//! Tracing initialisation.
//!
//! Installs a global `tracing-subscriber` registry with one `fmt` layer in
//! the configured [`OutputFormat`]. `RUST_LOG` takes precedence over the
//! configured level when set.
//!
//! # Example
//! ```no_run
//! use rust_midi::{config::MidiConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MidiConfig::load_from("midi.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!("MIDI host started");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::MidiConfig;
use crate::error::{MidiError, Result};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line with colors, for development
    #[default]
    Pretty,
    /// Single line without colors
    Compact,
    /// One JSON object per line
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Fallback level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Include thread names (the reclaim worker is named)
    pub with_thread_names: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_thread_names: true,
            with_file_and_line: false,
        }
    }
}

impl LoggingOptions {
    /// Options at `level` with the default format.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Build options from the `[logging]` section.
    pub fn from_config(config: &MidiConfig) -> Result<Self> {
        Ok(Self {
            level: parse_level(&config.logging.level)?,
            format: config.logging.format,
            ..Default::default()
        })
    }
}

/// Initialise logging from a loaded configuration.
pub fn init_from_config(config: &MidiConfig) -> Result<()> {
    init(LoggingOptions::from_config(config)?)
}

/// Install the global subscriber.
///
/// # Errors
///
/// [`MidiError::Configuration`] if a global subscriber is already installed.
pub fn init(options: LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.as_str().to_ascii_lowercase()));

    let layer = fmt_layer::layer()
        .with_thread_names(options.with_thread_names)
        .with_file(options.with_file_and_line)
        .with_line_number(options.with_file_and_line);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        OutputFormat::Pretty => layer.pretty().with_filter(filter).boxed(),
        OutputFormat::Compact => layer
            .compact()
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => layer.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| MidiError::Configuration(format!("Failed to initialize tracing: {e}")))
}

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| {
        MidiError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = MidiConfig::default();
        config.logging.level = "debug".into();
        config.logging.format = OutputFormat::Json;

        let options = LoggingOptions::from_config(&config).unwrap();
        assert_eq!(options.level, Level::DEBUG);
        assert_eq!(options.format, OutputFormat::Json);
    }

    #[test]
    fn test_builder_keeps_defaults() {
        let options = LoggingOptions::new(Level::WARN).with_format(OutputFormat::Compact);
        assert_eq!(options.level, Level::WARN);
        assert_eq!(options.format, OutputFormat::Compact);
        assert!(options.with_thread_names);
        assert!(!options.with_file_and_line);
    }
}
