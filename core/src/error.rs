use thiserror::Error;

use crate::imagelock::LockDiff;

/// chartwrap error types
#[derive(Error, Debug)]
pub enum WrapError {
    /// Images.lock document is malformed
    #[error("Lock parse error: {0}")]
    ParseError(String),

    /// Every platform of an image was filtered out or none were published
    #[error("No platforms resolved for image {name} ({image})")]
    NoPlatformsResolved { name: String, image: String },

    /// Persisted lock disagrees with the chart's current declarations
    #[error("Images.lock does not match the chart: {0}")]
    DriftError(LockDiff),

    /// A transfer unit could not be completed
    ///
    /// `cancelled` is set when the cancellation token stopped the retry loop,
    /// even if the last attempt itself failed for another reason.
    #[error("Failed to transfer {image} after {attempts} attempt(s): {cause}")]
    TransferFailed {
        image: String,
        digest: Option<String>,
        platform: Option<String>,
        attempts: u32,
        cancelled: bool,
        cause: Box<WrapError>,
    },

    /// Input is not a recognized bundle archive
    #[error("Unrecognized package format: {0}")]
    PackageFormatError(String),

    /// Operation aborted through the cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Chart could not be loaded or declares malformed images
    #[error("Chart error: {0}")]
    ChartError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl WrapError {
    /// Whether cancellation caused this error, directly or as a transfer cause.
    pub fn is_cancelled(&self) -> bool {
        match self {
            WrapError::Cancelled => true,
            WrapError::TransferFailed {
                cancelled, cause, ..
            } => *cancelled || cause.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for WrapError {
    fn from(err: serde_json::Error) -> Self {
        WrapError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for WrapError {
    fn from(err: serde_yaml::Error) -> Self {
        WrapError::SerializationError(err.to_string())
    }
}

/// Result type alias for chartwrap operations
pub type Result<T> = std::result::Result<T, WrapError>;
