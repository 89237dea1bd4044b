//! Configuration types for the logging system

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log level (overridden by RUST_LOG)
    pub default_level: String,

    pub console: ConsoleConfig,

    /// File output; `None` disables it
    pub file: Option<FileConfig>,

    pub jsonl: JsonlConfig,

    pub filters: FilterConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
            filters: FilterConfig::default(),
        }
    }
}

impl LogConfig {
    /// Verbose, human-readable console output
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Default::default()
        }
    }

    /// JSONL to daily-rotated files only
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig {
                enabled: false,
                pretty: false,
                ansi: false,
            },
            file: Some(FileConfig {
                directory: log_dir,
                prefix: "qsdn".to_string(),
                rotation: RotationStrategy::Daily,
            }),
            ..Default::default()
        }
    }

    /// Minimal output for tests
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: false,
                ansi: false,
            },
            ..Default::default()
        }
    }

    /// Filter directives in `EnvFilter` syntax
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.default_level.clone()];
        for (target, level) in &self.filters.targets {
            directives.push(format!("{}={}", target, level));
        }
        for target in &self.filters.silence {
            directives.push(format!("{}=off", target));
        }
        directives.join(",")
    }
}

/// Console output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Pretty (human-readable) instead of JSONL
    pub pretty: bool,
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false, // JSONL by default
            ansi: false,
        }
    }
}

/// File output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub rotation: RotationStrategy,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "qsdn".to_string(),
            rotation: RotationStrategy::Daily,
        }
    }
}

impl FileConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: RotationStrategy) -> Self {
        self.rotation = rotation;
        self
    }
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// Single file, truncated on startup
    Never,
}

/// JSONL formatting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Flatten event fields to root level
    pub flatten_events: bool,
    /// Include the span list in events
    pub include_spans: bool,
    pub include_thread_info: bool,
    /// Include file/line information
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_thread_info: false,
            include_location: true,
        }
    }
}

/// Per-target level overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Target -> level, e.g. `qsdn_routing::reservation = "trace"`
    pub targets: BTreeMap<String, String>,
    /// Targets to drop entirely
    pub silence: Vec<String>,
}
