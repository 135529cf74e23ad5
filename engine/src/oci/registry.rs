//! Registry access for lock generation, pull and push.
//!
//! [`Registry`] is the seam the generator and the transfer engine talk to.
//! [`OciRegistry`] implements it over the `oci-distribution` client
//! (Docker Hub, GHCR, Harbor, plain `registry:2`, ...).

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::RegistryConfig;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciImageManifest;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tokio::io::AsyncWriteExt;

use super::archive::{ArchiveWriter, CachedImage};
use super::manifest::{
    is_image_manifest, sha256_digest, verify_digest, AnyManifest, Descriptor, ImageConfig,
    IndexPlatform, ManifestList, ACCEPTED_MANIFEST_TYPES, IMAGE_MANIFEST_TYPES, OCI_IMAGE_INDEX,
};
use super::reference::ImageReference;

/// Operations the engine needs from a container registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Platform entries published under `image`.
    ///
    /// A multi-platform tag yields its index entries unfiltered. A tag
    /// pointing straight at an image manifest yields one entry whose
    /// platform is read from the image config.
    async fn list_manifests(&self, image: &str) -> Result<Vec<Descriptor>>;

    /// Fetch the manifest `digest` of `image` with all of its blobs into the
    /// cache archive at `dest`.
    async fn pull_image(&self, image: &str, digest: &str, dest: &Path) -> Result<()>;

    /// Upload every cached image, then publish `index` under the tag of
    /// `image`.
    ///
    /// Returns the digest of the pushed index.
    async fn push_index(
        &self,
        image: &str,
        images: &[CachedImage],
        index: &ManifestList,
    ) -> Result<String>;

    /// Fetch the packaged chart (`.tgz`) stored under an OCI `reference`.
    async fn pull_chart(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Layer media type of a Helm chart stored in an OCI registry.
pub const HELM_CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`Registry`] backed by a real OCI distribution endpoint.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Create a registry client.
    pub fn new(config: &RegistryConfig, auth: RegistryAuth) -> Self {
        let client = Client::new(client_config(config));
        Self { client, auth }
    }

    /// Fetch one blob and check it against its digest.
    async fn pull_verified_blob(
        &self,
        oci_ref: &Reference,
        descriptor: &oci_distribution::manifest::OciDescriptor,
        registry: &str,
    ) -> Result<Vec<u8>> {
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(oci_ref, descriptor, &mut data)
            .await
            .map_err(|e| registry_error(registry, format!("Failed to pull blob {}: {}", descriptor.digest, e)))?;
        verify_digest(&data, &descriptor.digest)?;
        Ok(data)
    }

    /// Stream one blob into `writer`'s staging area and check it.
    async fn pull_blob_to_stage(
        &self,
        oci_ref: &Reference,
        descriptor: &oci_distribution::manifest::OciDescriptor,
        writer: &mut ArchiveWriter,
        registry: &str,
    ) -> Result<()> {
        let path = writer.blob_path(&descriptor.digest);
        let mut file = tokio::fs::File::create(&path).await?;
        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| registry_error(registry, format!("Failed to pull blob {}: {}", descriptor.digest, e)))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        writer.commit_blob(&descriptor.digest)
    }

    async fn push_manifest_bytes(
        &self,
        oci_ref: &Reference,
        body: Vec<u8>,
        media_type: &str,
        registry: &str,
    ) -> Result<String> {
        let content_type = http::HeaderValue::from_str(media_type).map_err(|e| {
            WrapError::OciImageError(format!("Invalid media type '{}': {}", media_type, e))
        })?;
        self.client
            .push_manifest_raw(oci_ref, body, content_type)
            .await
            .map_err(|e| registry_error(registry, format!("Failed to push manifest: {}", e)))
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn list_manifests(&self, image: &str) -> Result<Vec<Descriptor>> {
        let reference = ImageReference::parse(image)?;
        let oci_ref = to_oci_reference(&reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::debug!(reference = %reference, "Resolving manifest");
        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| registry_error(&reference.registry, format!("Failed to pull manifest: {}", e)))?;

        let parsed = AnyManifest::parse(&bytes)?;
        let media_type = parsed.resolved_media_type().to_string();
        if let Some(entries) = parsed.manifests {
            tracing::debug!(reference = %reference, entries = entries.len(), "Resolved manifest list");
            return Ok(entries);
        }

        let manifest: OciImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| WrapError::OciImageError(format!("Invalid image manifest: {}", e)))?;
        let config = self
            .pull_verified_blob(&oci_ref, &manifest.config, &reference.registry)
            .await?;
        let platform = ImageConfig::platform_from_blob(&config)?;

        Ok(vec![Descriptor {
            media_type,
            digest,
            size: bytes.len() as i64,
            platform: Some(IndexPlatform::from(&platform)),
            annotations: BTreeMap::new(),
        }])
    }

    async fn pull_image(&self, image: &str, digest: &str, dest: &Path) -> Result<()> {
        let reference = ImageReference::parse(image)?;
        let oci_ref = to_oci_reference(&reference.pinned(digest))?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(reference = %reference, digest = %digest, "Pulling image");
        let (bytes, _) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, IMAGE_MANIFEST_TYPES)
            .await
            .map_err(|e| registry_error(&reference.registry, format!("Failed to pull manifest: {}", e)))?;
        verify_digest(&bytes, digest)?;

        let media_type = AnyManifest::parse(&bytes)?.resolved_media_type().to_string();
        if !is_image_manifest(&media_type) {
            return Err(WrapError::OciImageError(format!(
                "{}@{} is a {}, not a single-platform image",
                reference, digest, media_type
            )));
        }
        let manifest: OciImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| WrapError::OciImageError(format!("Invalid image manifest: {}", e)))?;

        let mut writer = ArchiveWriter::new(dest)?;
        for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
            if writer.is_staged(&descriptor.digest) {
                continue;
            }
            tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");
            self.pull_blob_to_stage(&oci_ref, descriptor, &mut writer, &reference.registry)
                .await?;
        }

        writer.finish(image, digest, &media_type, &bytes)
    }

    async fn push_index(
        &self,
        image: &str,
        images: &[CachedImage],
        index: &ManifestList,
    ) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        let tag_ref = to_oci_reference(&reference)?;
        let auth = self.auth.to_oci_auth();

        self.client
            .auth(&tag_ref, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| registry_error(&reference.registry, format!("Authentication failed: {}", e)))?;

        for cached in images {
            for digest in cached.blob_digests() {
                // One blob in memory at a time.
                let data = cached.read_blob(digest)?;
                tracing::debug!(digest = %digest, size = data.len(), "Pushing blob");
                self.client
                    .push_blob(&tag_ref, &data, digest)
                    .await
                    .map_err(|e| {
                        registry_error(&reference.registry, format!("Failed to push blob {}: {}", digest, e))
                    })?;
            }
            let manifest_ref = to_oci_reference(&reference.pinned(&cached.manifest_digest))?;
            self.push_manifest_bytes(
                &manifest_ref,
                cached.manifest.clone(),
                &cached.media_type,
                &reference.registry,
            )
            .await?;
        }

        let body = serde_json::to_vec(index)?;
        let digest = sha256_digest(&body);
        let media_type = index.media_type.as_deref().unwrap_or(OCI_IMAGE_INDEX);
        let url = self
            .push_manifest_bytes(&tag_ref, body, media_type, &reference.registry)
            .await?;

        tracing::info!(
            reference = %reference,
            digest = %digest,
            manifest_url = %url,
            platforms = index.manifests.len(),
            "Pushed manifest list"
        );
        Ok(digest)
    }

    async fn pull_chart(&self, reference: &str) -> Result<Vec<u8>> {
        let parsed = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&parsed)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(reference = %parsed, "Pulling chart");
        let data = self
            .client
            .pull(&oci_ref, &auth, vec![HELM_CHART_CONTENT_MEDIA_TYPE])
            .await
            .map_err(|e| registry_error(&parsed.registry, format!("Failed to pull chart: {}", e)))?;
        let mut layers = data.layers.into_iter();
        match (layers.next(), layers.next()) {
            (Some(layer), None) => Ok(layer.data),
            _ => Err(WrapError::OciImageError(format!(
                "{} does not hold exactly one chart layer",
                parsed
            ))),
        }
    }
}

/// Client settings: `insecure` skips certificate checks, `plain_http` drops TLS.
fn client_config(config: &RegistryConfig) -> ClientConfig {
    let protocol = if config.plain_http {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    ClientConfig {
        protocol,
        accept_invalid_certificates: config.insecure,
        ..Default::default()
    }
}

fn registry_error(registry: &str, message: String) -> WrapError {
    WrapError::RegistryError {
        registry: registry.to_string(),
        message,
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };

    ref_str.parse::<Reference>().map_err(|e| {
        WrapError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}
