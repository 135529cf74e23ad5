//! Manifest, index and config documents, kept as plain serde types so the
//! cache format does not depend on a particular registry client.

use std::collections::BTreeMap;
use std::io::Read;

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::Platform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Media types accepted when resolving a tag.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST_LIST,
    OCI_IMAGE_MANIFEST,
    DOCKER_MANIFEST_V2,
];

/// Media types of single-platform image manifests.
pub const IMAGE_MANIFEST_TYPES: &[&str] = &[OCI_IMAGE_MANIFEST, DOCKER_MANIFEST_V2];

/// Whether a media type names a single-platform image manifest.
pub fn is_image_manifest(media_type: &str) -> bool {
    IMAGE_MANIFEST_TYPES.contains(&media_type)
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<IndexPlatform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Normalized platform of an index entry, if it carries one.
    pub fn platform(&self) -> Option<Platform> {
        self.platform.as_ref().map(|p| {
            Platform::new(&p.os, &p.architecture, p.variant.as_deref())
        })
    }
}

/// Platform object as it appears inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&Platform> for IndexPlatform {
    fn from(p: &Platform) -> Self {
        Self {
            architecture: p.architecture.clone(),
            os: p.os.clone(),
            variant: p.variant.clone(),
        }
    }
}

/// Image index or Docker manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Build a platform-indexed list from single-platform manifests.
    ///
    /// A Docker manifest list is produced when every member is a Docker v2
    /// manifest, an OCI index otherwise.
    pub fn from_manifests(manifests: Vec<Descriptor>) -> Self {
        let all_docker = !manifests.is_empty()
            && manifests.iter().all(|m| m.media_type == DOCKER_MANIFEST_V2);
        let media_type = if all_docker {
            DOCKER_MANIFEST_LIST
        } else {
            OCI_IMAGE_INDEX
        };
        Self {
            schema_version: 2,
            media_type: Some(media_type.to_string()),
            manifests,
        }
    }

    /// Platform strings of every entry, in order.
    pub fn platforms(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|m| m.platform())
            .map(|p| p.to_string())
            .collect()
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// The part of an image config that identifies its platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl ImageConfig {
    /// Parse a config blob and derive its platform.
    pub fn platform_from_blob(data: &[u8]) -> Result<Platform> {
        let config: ImageConfig = serde_json::from_slice(data).map_err(|e| {
            WrapError::OciImageError(format!("Unreadable image configuration: {}", e))
        })?;
        if config.os.is_empty() || config.architecture.is_empty() {
            return Err(WrapError::OciImageError(
                "Image configuration does not declare os/architecture".to_string(),
            ));
        }
        Ok(Platform::new(
            &config.os,
            &config.architecture,
            config.variant.as_deref(),
        ))
    }
}

/// Top-level shape shared by manifests and indexes, used to tell them apart.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    pub config: Option<Descriptor>,
}

impl AnyManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| WrapError::OciImageError(format!("Invalid manifest: {}", e)))
    }

    /// Media type, inferred from the shape when the document omits it.
    pub fn resolved_media_type(&self) -> &str {
        match self.media_type.as_deref() {
            Some(media_type) => media_type,
            None if self.manifests.is_some() => OCI_IMAGE_INDEX,
            None => OCI_IMAGE_MANIFEST,
        }
    }
}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Check `data` hashes to `expected`. Only sha256 digests are recomputed.
pub fn verify_digest(data: &[u8], expected: &str) -> Result<()> {
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(WrapError::OciImageError(format!(
            "Digest mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Check a stream hashes to `expected` without buffering it.
pub fn verify_reader_digest<R: Read>(mut reader: R, expected: &str) -> Result<()> {
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
    if actual != expected {
        return Err(WrapError::OciImageError(format!(
            "Digest mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(media_type: &str, arch: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: sha256_digest(arch.as_bytes()),
            size: 10,
            platform: Some(IndexPlatform {
                architecture: arch.to_string(),
                os: "linux".to_string(),
                variant: None,
            }),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_digest() {
        let digest = sha256_digest(b"hello");
        assert!(verify_digest(b"hello", &digest).is_ok());
        assert!(verify_digest(b"world", &digest).is_err());
        assert!(verify_reader_digest(&b"hello"[..], &digest).is_ok());
        assert!(matches!(
            verify_reader_digest(&b"world"[..], &digest),
            Err(WrapError::OciImageError(_))
        ));
    }

    #[test]
    fn test_manifest_list_media_type() {
        let docker = ManifestList::from_manifests(vec![
            entry(DOCKER_MANIFEST_V2, "amd64"),
            entry(DOCKER_MANIFEST_V2, "arm64"),
        ]);
        assert_eq!(docker.media_type.as_deref(), Some(DOCKER_MANIFEST_LIST));

        let mixed = ManifestList::from_manifests(vec![
            entry(DOCKER_MANIFEST_V2, "amd64"),
            entry(OCI_IMAGE_MANIFEST, "arm64"),
        ]);
        assert_eq!(mixed.media_type.as_deref(), Some(OCI_IMAGE_INDEX));
        assert_eq!(mixed.platforms(), vec!["linux/amd64", "linux/arm64"]);
    }

    #[test]
    fn test_manifest_list_json_shape() {
        let list = ManifestList::from_manifests(vec![entry(OCI_IMAGE_MANIFEST, "amd64")]);
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["manifests"][0]["platform"]["os"], "linux");
        assert!(json["manifests"][0].get("annotations").is_none());
    }

    #[test]
    fn test_platform_from_config_blob() {
        let platform = ImageConfig::platform_from_blob(
            br#"{"architecture":"arm","os":"linux","variant":"v7","rootfs":{}}"#,
        )
        .unwrap();
        assert_eq!(platform.to_string(), "linux/arm/v7");
        assert!(ImageConfig::platform_from_blob(b"{}").is_err());
        assert!(ImageConfig::platform_from_blob(b"not json").is_err());
    }

    #[test]
    fn test_any_manifest_shape() {
        let index = AnyManifest::parse(br#"{"schemaVersion":2,"manifests":[]}"#).unwrap();
        assert_eq!(index.resolved_media_type(), OCI_IMAGE_INDEX);
        let image = AnyManifest::parse(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"x","digest":"sha256:00","size":1},"layers":[]}"#,
        )
        .unwrap();
        assert_eq!(image.resolved_media_type(), DOCKER_MANIFEST_V2);
        assert!(is_image_manifest(image.resolved_media_type()));
    }
}
