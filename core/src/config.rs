use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WrapError};
use crate::platform;

/// Chart.yaml annotation listing the images a chart uses.
pub const DEFAULT_ANNOTATIONS_KEY: &str = "images";

/// Default number of attempts per transfer unit.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between transfer attempts.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Top-level configuration, built once per command and passed down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapConfig {
    /// Lock generation settings
    pub lock: LockConfig,

    /// Pull/push retry settings
    pub transfer: TransferConfig,

    /// Registry connection settings
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,

    /// Leave the scratch directory behind after the command exits
    pub keep_artifacts: bool,
}

impl WrapConfig {
    /// Load configuration from a YAML file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WrapError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            WrapError::ConfigError(format!("Invalid config {}: {}", path.display(), e))
        })
    }
}

/// Lock generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Chart.yaml annotation holding the image list
    pub annotations_key: String,

    /// Platforms to keep (empty keeps every published platform)
    pub platforms: Vec<String>,

    /// Manifest-list entries carrying any of these annotations are not
    /// deployable images and are never locked
    pub skip_annotations: Vec<AnnotationMatch>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            annotations_key: DEFAULT_ANNOTATIONS_KEY.to_string(),
            platforms: Vec::new(),
            skip_annotations: vec![AnnotationMatch {
                key: "vnd.docker.reference.type".to_string(),
                value: "attestation-manifest".to_string(),
            }],
        }
    }
}

impl LockConfig {
    /// Normalized platform filter. Empty means "keep everything".
    pub fn platform_filter(&self) -> Result<HashSet<String>> {
        self.platforms
            .iter()
            .map(|p| platform::normalize(p).map_err(|e| WrapError::ConfigError(e.to_string())))
            .collect()
    }

    /// Whether a manifest-list entry with these annotations must be skipped.
    pub fn is_skipped(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.skip_annotations
            .iter()
            .any(|m| annotations.get(&m.key).is_some_and(|v| *v == m.value))
    }
}

/// Annotation key/value pair marking a non-deployable manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationMatch {
    pub key: String,
    pub value: String,
}

/// Transfer retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Attempts per transfer unit (values below 1 mean a single attempt)
    pub max_retries: u32,

    /// Base delay in milliseconds; attempt `n` waits `n * retry_backoff_ms`
    pub retry_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl TransferConfig {
    /// Number of attempts a unit gets before it is declared failed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Registry connection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Skip TLS certificate verification
    pub insecure: bool,

    /// Talk plain HTTP instead of HTTPS
    pub plain_http: bool,
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = WrapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "fatal" | "panic" => Ok(LogLevel::Error),
            other => Err(WrapError::ConfigError(format!("Unknown log level '{}'", other))),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
