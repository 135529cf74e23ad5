//! Images.lock model and YAML codec.
//!
//! The lock pins every image a chart declares to one manifest digest per
//! platform. It is written next to `Chart.yaml` and read back by the pull,
//! push and verify paths:
//!
//! ```yaml
//! apiVersion: v0
//! kind: ImagesLock
//! metadata:
//!   generatedAt: "2024-05-02T10:11:12Z"
//!   generatedBy: chartwrap 0.4.0
//! chart:
//!   name: wordpress
//!   version: 19.0.4
//! images:
//! - name: wordpress
//!   image: docker.io/bitnami/wordpress:6.5.2
//!   chart: wordpress
//!   digests:
//!   - digest: sha256:1f0c...
//!     arch: linux/amd64
//! ```
//!
//! Serialization follows struct field order, so writing an unchanged model
//! twice produces identical bytes.

mod diff;

use std::collections::HashSet;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WrapError};
use crate::platform;

pub use diff::{diff, DigestChange, LockDiff, LockedDigest};

/// Default file name of the lock inside a chart root.
pub const DEFAULT_IMAGES_LOCK_FILE_NAME: &str = "Images.lock";

/// Lock document API version.
pub const API_VERSION: &str = "v0";

/// Lock document kind.
pub const KIND: &str = "ImagesLock";

/// Value written to `metadata.generatedBy`.
pub const GENERATED_BY: &str = concat!("chartwrap ", env!("CARGO_PKG_VERSION"));

/// Root lock document, one per chart version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: LockMetadata,
    pub chart: ChartIdentity,
    #[serde(default)]
    pub images: Vec<ChartImage>,
}

/// Provenance of a generated lock. Ignored when comparing locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub generated_by: String,
}

/// Chart name and version the lock was generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIdentity {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// One logical image referenced by the chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartImage {
    /// Logical name of the image within the chart
    pub name: String,
    /// Registry reference without a digest
    pub image: String,
    /// Name of the (sub-)chart declaring the image
    pub chart: String,
    /// One entry per resolved platform
    #[serde(default)]
    pub digests: Vec<DigestInfo>,
}

/// Manifest digest of one platform variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInfo {
    pub digest: String,
    pub arch: String,
}

impl ImagesLock {
    /// Create an empty lock for a chart, stamped with the current time.
    pub fn new(
        chart_name: impl Into<String>,
        chart_version: impl Into<String>,
        app_version: Option<String>,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: LockMetadata {
                generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                generated_by: GENERATED_BY.to_string(),
            },
            chart: ChartIdentity {
                name: chart_name.into(),
                version: chart_version.into(),
                app_version,
            },
            images: Vec::new(),
        }
    }

    /// Parse and validate a lock document.
    ///
    /// Platform strings are normalized while parsing.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let mut lock: ImagesLock =
            serde_yaml::from_slice(data).map_err(|e| WrapError::ParseError(e.to_string()))?;
        lock.normalize_and_validate()?;
        Ok(lock)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Read a lock file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            WrapError::ParseError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    /// Write the lock to disk, replacing any existing file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        std::fs::write(path, yaml)?;
        tracing::debug!(path = %path.display(), images = self.images.len(), "Wrote Images.lock");
        Ok(())
    }

    /// Number of per-platform artifacts (one per digest entry).
    pub fn artifact_count(&self) -> usize {
        self.images.iter().map(|img| img.digests.len()).sum()
    }

    /// Flatten into comparable entries, in lock order.
    pub fn entries(&self) -> Vec<LockedDigest> {
        self.images
            .iter()
            .flat_map(|img| {
                img.digests.iter().map(move |d| LockedDigest {
                    chart: img.chart.clone(),
                    name: img.name.clone(),
                    image: img.image.clone(),
                    platform: d.arch.clone(),
                    digest: d.digest.clone(),
                })
            })
            .collect()
    }

    /// Whether both locks pin the same digests, ignoring order and metadata.
    pub fn is_equivalent(&self, other: &ImagesLock) -> bool {
        diff(self, other).is_empty()
    }

    fn normalize_and_validate(&mut self) -> Result<()> {
        if self.kind != KIND {
            return Err(WrapError::ParseError(format!(
                "Unexpected kind '{}', expected '{}'",
                self.kind, KIND
            )));
        }
        if self.chart.name.trim().is_empty() {
            return Err(WrapError::ParseError("Empty chart name".to_string()));
        }

        let mut seen_images = HashSet::new();
        for img in &mut self.images {
            if img.name.trim().is_empty() || img.image.trim().is_empty() {
                return Err(WrapError::ParseError(format!(
                    "Image entry in chart '{}' has an empty name or image",
                    img.chart
                )));
            }
            if img.image.contains('@') {
                return Err(WrapError::ParseError(format!(
                    "Image '{}' must not carry a digest; digests belong in `digests`",
                    img.image
                )));
            }
            if !seen_images.insert((img.chart.clone(), img.name.clone())) {
                return Err(WrapError::ParseError(format!(
                    "Duplicate image '{}' in chart '{}'",
                    img.name, img.chart
                )));
            }
            if img.digests.is_empty() {
                return Err(WrapError::ParseError(format!(
                    "Image '{}' has no digests",
                    img.name
                )));
            }

            let mut seen_platforms = HashSet::new();
            for d in &mut img.digests {
                validate_digest(&d.digest)?;
                d.arch = platform::normalize(&d.arch)?;
                if !seen_platforms.insert(d.arch.clone()) {
                    return Err(WrapError::ParseError(format!(
                        "Duplicate platform '{}' for image '{}'",
                        d.arch, img.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Validate an algorithm-prefixed digest such as `sha256:<64 hex>`.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        WrapError::ParseError(format!(
            "Invalid digest '{}': expected algorithm:hex",
            digest
        ))
    })?;

    let valid_hex = !encoded.is_empty()
        && encoded
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    let valid = match algorithm {
        "sha256" => valid_hex && encoded.len() == 64,
        "sha512" => valid_hex && encoded.len() == 128,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(WrapError::ParseError(format!("Invalid digest '{}'", digest)))
    }
}

/// Encoded (hex) part of a digest, used to name cache files.
pub fn digest_encoded(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}
