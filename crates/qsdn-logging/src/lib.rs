//! Structured logging for the QSDN controller
//!
//! # Features
//!
//! - **JSONL Output**: structured JSON lines for log aggregation (default)
//! - **Pretty Output**: human-readable console lines for development
//! - **Site Fields**: agent and hop spans carry the site they act for
//! - **Request Correlation**: follow one key request across attempts and hops
//! - **File Rotation**: daily/hourly log files via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use qsdn_logging::{LogConfig, QsdnSubscriberBuilder};
//!
//! // JSONL to console
//! let _guard = QsdnSubscriberBuilder::new().init()?;
//!
//! // Pretty console output
//! let _guard = QsdnSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```
//!
//! # Correlation
//!
//! ```ignore
//! use qsdn_logging::{CorrelationExt, RelayCorrelation};
//!
//! let root = RelayCorrelation::for_request(&request.id);
//! let hop = root.attempt(1).hop(0);
//! tracing::Span::current().record_correlation(&hop);
//! ```

pub mod config;
pub mod correlation;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use correlation::{CorrelationExt, RelayCorrelation, fields, spans};
pub use layers::jsonl_file_layer;
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file: {0}")]
    File(#[from] std::io::Error),

    #[error("Invalid filter directives: {0}")]
    Filter(String),

    #[error("A global subscriber is already installed")]
    AlreadyInstalled,
}

/// Builder for the QSDN logging subscriber
///
/// Console output is JSONL unless the config asks for pretty output. File
/// output is always JSONL.
pub struct QsdnSubscriberBuilder {
    config: LogConfig,
}

impl QsdnSubscriberBuilder {
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self.config.console.ansi = pretty;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes file output on drop and must be kept
    /// alive for the life of the program.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.filter_directives())
                .map_err(|e| LoggingError::Filter(e.to_string()))?,
        };

        let (file_writer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config)?;
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let console = &self.config.console;
        let jsonl = &self.config.jsonl;

        let pretty_console = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });

        let json_console = (console.enabled && !console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_thread_ids(jsonl.include_thread_info)
        });

        let file_layer = file_writer.map(|writer| {
            layers::jsonl_file_layer(writer, jsonl.include_location, jsonl.include_thread_info)
        });

        Registry::default()
            .with(env_filter)
            .with(pretty_console)
            .with(json_console)
            .with(file_layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInstalled)?;

        Ok(guard)
    }
}

impl Default for QsdnSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the writer for file output; `Never` truncates a single file
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;
    let writer = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            tracing_appender::non_blocking(File::create(path)?)
        }
        RotationStrategy::Daily => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::DAILY,
            &config.directory,
            &config.prefix,
        )),
        RotationStrategy::Hourly => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::HOURLY,
            &config.directory,
            &config.prefix,
        )),
    };
    Ok(writer)
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Result<Option<WorkerGuard>, LoggingError> {
    QsdnSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for tests; a second call is a no-op
pub fn init_testing() {
    let _ = QsdnSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = QsdnSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
        assert!(!builder.config().console.pretty); // JSONL by default
    }

    #[test]
    fn test_builder_with_config() {
        let builder = QsdnSubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config().default_level, "debug");
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = QsdnSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false)
            .with_pretty(true)
            .with_file_output(FileConfig::new("/tmp/qsdn-logs"));
        let config = builder.config();
        assert_eq!(config.default_level, "trace");
        assert!(!config.console.enabled);
        assert!(config.console.ansi);
        assert!(config.file.is_some());
    }

    #[test]
    fn test_never_rotation_creates_single_file() {
        let dir = std::env::temp_dir().join(format!("qsdn-log-{}", uuid::Uuid::new_v4().simple()));
        let config = FileConfig::new(&dir).with_rotation(RotationStrategy::Never);
        let (_writer, _guard) = file_writer(&config).unwrap();
        assert!(dir.join("qsdn.log").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_init_testing_is_repeatable() {
        init_testing();
        init_testing();
    }
}
