//! In-process [`Registry`] holding images in memory.
//!
//! Supports injected failures so retry and cancellation behavior can be
//! exercised without a network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chartwrap_core::error::{Result, WrapError};

use super::archive::{CachedImage, ImageArchive};
use super::manifest::{sha256_digest, Descriptor, ManifestList};
use super::reference::ImageReference;
use super::registry::Registry;

#[derive(Debug, Clone)]
enum TagTarget {
    Index(ManifestList),
    Image(String),
}

#[derive(Debug, Default)]
struct Repository {
    tags: HashMap<String, TagTarget>,
    manifests: HashMap<String, ImageArchive>,
}

#[derive(Debug, Default)]
struct State {
    repositories: HashMap<String, Repository>,
    charts: HashMap<String, Vec<u8>>,
    failures: HashMap<String, u32>,
    calls: HashMap<String, usize>,
}

/// Registry living entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a multi-platform image under the tag of `image`.
    pub fn publish(&self, image: &str, archives: Vec<ImageArchive>) -> Result<()> {
        let descriptors = archives
            .iter()
            .map(ImageArchive::descriptor)
            .collect::<Result<Vec<_>>>()?;
        let index = ManifestList::from_manifests(descriptors);
        let (repo_key, tag) = split_key(image)?;

        let mut state = self.lock();
        let repo = state.repositories.entry(repo_key).or_default();
        for archive in archives {
            repo.manifests.insert(archive.manifest_digest.clone(), archive);
        }
        repo.tags.insert(tag, TagTarget::Index(index));
        Ok(())
    }

    /// Publish a single-platform image whose tag points at the image manifest.
    pub fn publish_single(&self, image: &str, archive: ImageArchive) -> Result<()> {
        let (repo_key, tag) = split_key(image)?;
        let mut state = self.lock();
        let repo = state.repositories.entry(repo_key).or_default();
        repo.tags
            .insert(tag, TagTarget::Image(archive.manifest_digest.clone()));
        repo.manifests.insert(archive.manifest_digest.clone(), archive);
        Ok(())
    }

    /// Publish a packaged chart under `reference`.
    pub fn publish_chart(&self, reference: &str, chart: Vec<u8>) -> Result<()> {
        let (repo_key, tag) = split_key(reference)?;
        self.lock()
            .charts
            .insert(format!("{}:{}", repo_key, tag), chart);
        Ok(())
    }

    /// Append a raw entry to the manifest list published under `image`.
    pub fn add_index_entry(&self, image: &str, entry: Descriptor) -> Result<()> {
        let (repo_key, tag) = split_key(image)?;
        let mut state = self.lock();
        match state
            .repositories
            .get_mut(&repo_key)
            .and_then(|repo| repo.tags.get_mut(&tag))
        {
            Some(TagTarget::Index(index)) => {
                index.manifests.push(entry);
                Ok(())
            }
            _ => Err(WrapError::Other(format!(
                "No manifest list published under {}",
                image
            ))),
        }
    }

    /// Make the next `count` calls touching `image`'s repository fail.
    pub fn fail_next(&self, image: &str, count: u32) -> Result<()> {
        let (repo_key, _) = split_key(image)?;
        self.lock().failures.insert(repo_key, count);
        Ok(())
    }

    /// Number of calls made against `image`'s repository so far.
    pub fn calls(&self, image: &str) -> usize {
        match split_key(image) {
            Ok((repo_key, _)) => self.lock().calls.get(&repo_key).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Manifest list currently published under `image`, if any.
    pub fn manifest_list(&self, image: &str) -> Option<ManifestList> {
        let (repo_key, tag) = split_key(image).ok()?;
        let state = self.lock();
        match state.repositories.get(&repo_key)?.tags.get(&tag)? {
            TagTarget::Index(index) => Some(index.clone()),
            TagTarget::Image(_) => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call and consume one injected failure, if any is pending.
    fn enter(&self, repo_key: &str) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(repo_key.to_string()).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(repo_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WrapError::RegistryError {
                    registry: repo_key.to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_manifests(&self, image: &str) -> Result<Vec<Descriptor>> {
        let (repo_key, tag) = split_key(image)?;
        self.enter(&repo_key)?;

        let state = self.lock();
        let repo = state
            .repositories
            .get(&repo_key)
            .ok_or_else(|| not_found(image))?;
        match repo.tags.get(&tag).ok_or_else(|| not_found(image))? {
            TagTarget::Index(index) => Ok(index.manifests.clone()),
            TagTarget::Image(digest) => {
                let archive = repo.manifests.get(digest).ok_or_else(|| not_found(image))?;
                Ok(vec![archive.descriptor()?])
            }
        }
    }

    async fn pull_image(&self, image: &str, digest: &str, dest: &Path) -> Result<()> {
        let (repo_key, _) = split_key(image)?;
        self.enter(&repo_key)?;

        let archive = {
            let state = self.lock();
            let stored = state
                .repositories
                .get(&repo_key)
                .and_then(|repo| repo.manifests.get(digest))
                .ok_or_else(|| not_found(&format!("{}@{}", image, digest)))?;
            ImageArchive {
                image: image.to_string(),
                ..stored.clone()
            }
        };
        archive.write(dest)
    }

    async fn push_index(
        &self,
        image: &str,
        images: &[CachedImage],
        index: &ManifestList,
    ) -> Result<String> {
        let (repo_key, tag) = split_key(image)?;
        self.enter(&repo_key)?;

        let archives = images
            .iter()
            .map(CachedImage::load)
            .collect::<Result<Vec<_>>>()?;
        let body = serde_json::to_vec(index)?;
        let mut state = self.lock();
        let repo = state.repositories.entry(repo_key).or_default();
        for archive in archives {
            repo.manifests.insert(archive.manifest_digest.clone(), archive);
        }
        repo.tags.insert(tag, TagTarget::Index(index.clone()));
        Ok(sha256_digest(&body))
    }

    async fn pull_chart(&self, reference: &str) -> Result<Vec<u8>> {
        let (repo_key, tag) = split_key(reference)?;
        self.enter(&repo_key)?;
        self.lock()
            .charts
            .get(&format!("{}:{}", repo_key, tag))
            .cloned()
            .ok_or_else(|| not_found(reference))
    }
}

/// Repository key and tag of `image`.
fn split_key(image: &str) -> Result<(String, String)> {
    let reference = ImageReference::parse(image)?;
    let tag = reference.tag.unwrap_or_else(|| "latest".to_string());
    Ok((
        format!("{}/{}", reference.registry, reference.repository),
        tag,
    ))
}

fn not_found(what: &str) -> WrapError {
    WrapError::RegistryError {
        registry: "memory".to_string(),
        message: format!("{} not found", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::archive::tests::sample_archive;
    use crate::oci::archive::{archive_path, CachedImage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_and_list() {
        let registry = MemoryRegistry::new();
        registry
            .publish(
                "repo/app:1.0",
                vec![
                    sample_archive("repo/app:1.0", "amd64"),
                    sample_archive("repo/app:1.0", "arm64"),
                ],
            )
            .unwrap();

        let entries = registry.list_manifests("docker.io/repo/app:1.0").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(registry.calls("repo/app:1.0"), 1);
    }

    #[tokio::test]
    async fn test_single_manifest_listing() {
        let registry = MemoryRegistry::new();
        let archive = sample_archive("repo/tool:2", "arm64");
        registry.publish_single("repo/tool:2", archive.clone()).unwrap();

        let entries = registry.list_manifests("repo/tool:2").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, archive.manifest_digest);
        assert_eq!(entries[0].platform().unwrap().to_string(), "linux/arm64");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dir = TempDir::new().unwrap();
        let registry = MemoryRegistry::new();
        let archive = sample_archive("repo/app:1.0", "amd64");
        registry.publish("repo/app:1.0", vec![archive.clone()]).unwrap();
        registry.fail_next("repo/app:1.0", 1).unwrap();
        let dest = archive_path(dir.path(), &archive.manifest_digest);

        assert!(registry
            .pull_image("repo/app:1.0", &archive.manifest_digest, &dest)
            .await
            .is_err());
        assert!(!dest.exists());
        registry
            .pull_image("repo/app:1.0", &archive.manifest_digest, &dest)
            .await
            .unwrap();
        assert_eq!(CachedImage::open(&dest).unwrap().manifest, archive.manifest);
        assert_eq!(registry.calls("repo/app:1.0"), 2);
    }

    #[tokio::test]
    async fn test_unknown_image() {
        let registry = MemoryRegistry::new();
        assert!(matches!(
            registry.list_manifests("repo/missing:1").await,
            Err(WrapError::RegistryError { .. })
        ));
    }

    #[tokio::test]
    async fn test_push_publishes_index() {
        let dir = TempDir::new().unwrap();
        let registry = MemoryRegistry::new();
        let archive = sample_archive("repo/app:1.0", "amd64");
        let source = dir.path().join("source.tar");
        archive.write(&source).unwrap();
        let cached = CachedImage::open(&source).unwrap();

        let index = ManifestList::from_manifests(vec![cached.descriptor().unwrap()]);
        let digest = registry
            .push_index("mirror.local/app:1.0", &[cached], &index)
            .await
            .unwrap();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(registry.manifest_list("mirror.local/app:1.0"), Some(index));
        registry
            .pull_image(
                "mirror.local/app:1.0",
                &archive.manifest_digest,
                &dir.path().join("mirror.tar"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_and_pull_chart() {
        let registry = MemoryRegistry::new();
        registry
            .publish_chart("registry.local/charts/demo:1.0.0", b"chart bytes".to_vec())
            .unwrap();
        assert_eq!(
            registry
                .pull_chart("registry.local/charts/demo:1.0.0")
                .await
                .unwrap(),
            b"chart bytes"
        );
        assert!(registry
            .pull_chart("registry.local/charts/demo:2.0.0")
            .await
            .is_err());
    }
}
