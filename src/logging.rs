//! Logging setup for programs embedding a worker.
//!
//! # Environment Variables
//!
//! - `IPROCESS_LOG` - Log filter (overrides RUST_LOG)
//! - `IPROCESS_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `IPROCESS_LOG_FORMAT` - Output format: pretty, compact, json
//! - `IPROCESS_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Thread names are on by default: worker loops are named `request-N`,
//! `reader` and `timer.<name>`, which is usually what you want to grep for.
//!
//! ```no_run
//! use iprocess::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single-line output.
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format: '{s}'. Valid options: pretty, compact, json")),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!("Unknown log rotation: '{s}'. Valid options: hourly, daily, never")),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration, passed to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level, used when no filter is set.
    pub level: Level,
    pub format: LogFormat,
    /// Also write to this file.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; takes precedence over `level`.
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Never,
            filter: None,
            show_target: true,
            show_thread_names: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set (e.g. from `-v`) wins over `IPROCESS_LOG`,
    /// `RUST_LOG` and `IPROCESS_LOG_LEVEL`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides), reading
    /// variables through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.filter.is_none() {
            self.filter = lookup("IPROCESS_LOG").or_else(|| lookup("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = lookup("IPROCESS_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }
        if let Some(format) = lookup("IPROCESS_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }
        if let Some(path) = lookup("IPROCESS_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{filter}', using default");
                default()
            }),
            None => default(),
        }
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Pretty => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Parse a log level name.
fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber: stderr, plus the log file when configured.
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("iprocess.log");
        let appender = RollingFileAppender::new(config.rotation.into(), dir, file_name);
        layers.push(config.layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("Never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level(" DEBUG "), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_iprocess_log_wins_over_rust_log() {
        let config = LogConfig::default().with_overrides(env(&[
            ("IPROCESS_LOG", "iprocess=trace"),
            ("RUST_LOG", "warn"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("iprocess=trace"));
    }

    #[test]
    fn test_explicit_filter_is_kept() {
        let config = LogConfig::default()
            .with_filter("debug")
            .with_overrides(env(&[("RUST_LOG", "warn"), ("IPROCESS_LOG_LEVEL", "error")]));
        assert_eq!(config.filter.as_deref(), Some("debug"));
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_level_format_and_file_overrides() {
        let config = LogConfig::default().with_overrides(env(&[
            ("IPROCESS_LOG_LEVEL", "trace"),
            ("IPROCESS_LOG_FORMAT", "json"),
            ("IPROCESS_LOG_FILE", "/tmp/iprocess-test.log"),
        ]));
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/iprocess-test.log")));
    }

    #[test]
    fn test_invalid_format_override_is_ignored() {
        let config = LogConfig::default()
            .with_format(LogFormat::Compact)
            .with_overrides(env(&[("IPROCESS_LOG_FORMAT", "yaml")]));
        assert_eq!(config.format, LogFormat::Compact);
    }
}
