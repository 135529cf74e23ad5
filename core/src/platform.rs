//! Normalized `os/architecture[/variant]` platform strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WrapError};

/// A single image platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g., "linux")
    pub os: String,
    /// CPU architecture (e.g., "amd64", "arm64")
    pub architecture: String,
    /// Architecture variant (e.g., "v7")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a normalized platform from its components.
    ///
    /// Components are lowercased and trimmed, an empty variant is dropped and
    /// `arm64/v8` collapses to `arm64` the way registries report it.
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        let os = os.trim().to_lowercase();
        let architecture = architecture.trim().to_lowercase();
        let variant = variant
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .filter(|v| !(architecture == "arm64" && v == "v8"));

        Self {
            os,
            architecture,
            variant,
        }
    }

    /// Whether this is the placeholder platform buildx uses for attestations.
    pub fn is_unknown(&self) -> bool {
        self.os == "unknown" || self.architecture == "unknown"
    }
}

impl FromStr for Platform {
    type Err = WrapError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let platform = match parts.as_slice() {
            [os, arch] => Platform::new(os, arch, None),
            [os, arch, variant] => Platform::new(os, arch, Some(variant)),
            _ => {
                return Err(WrapError::ParseError(format!(
                    "Invalid platform '{}': expected os/architecture[/variant]",
                    s
                )))
            }
        };

        if platform.os.is_empty() || platform.architecture.is_empty() {
            return Err(WrapError::ParseError(format!(
                "Invalid platform '{}': empty os or architecture",
                s
            )));
        }
        Ok(platform)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Normalize a platform string, e.g. `Linux/ARM64/v8` → `linux/arm64`.
pub fn normalize(platform: &str) -> Result<String> {
    Ok(platform.parse::<Platform>()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_arch() {
        let p: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.variant, None);
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_parse_with_variant() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.variant, Some("v7".to_string()));
        assert_eq!(p.to_string(), "linux/arm/v7");
    }

    #[test]
    fn test_arm64_v8_collapses() {
        assert_eq!(normalize("linux/arm64/v8").unwrap(), "linux/arm64");
    }

    #[test]
    fn test_normalize_case_and_whitespace() {
        assert_eq!(normalize(" Linux/AMD64 ").unwrap(), "linux/amd64");
    }

    #[test]
    fn test_invalid_platforms() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
        assert!("".parse::<Platform>().is_err());
    }

    #[test]
    fn test_unknown_platform() {
        assert!(Platform::new("unknown", "unknown", None).is_unknown());
        assert!(!Platform::new("linux", "amd64", None).is_unknown());
    }
}
