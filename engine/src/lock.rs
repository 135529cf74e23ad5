//! Images.lock generation.

use std::collections::HashSet;
use std::path::Path;

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::{ChartImage, DigestInfo, ImagesLock};
use chartwrap_core::LockConfig;

use crate::chart::{Chart, DeclaredImage};
use crate::oci::manifest::is_image_manifest;
use crate::oci::Registry;

/// Resolve every image declared by `chart` into a fresh lock.
///
/// Registry errors abort the whole generation.
pub async fn generate_lock(
    chart: &Chart,
    registry: &dyn Registry,
    config: &LockConfig,
) -> Result<ImagesLock> {
    let filter = config.platform_filter()?;
    let declared = chart.declared_images(&config.annotations_key)?;

    let mut lock = ImagesLock::new(chart.name(), chart.version(), chart.app_version());
    for image in declared {
        let digests = resolve_digests(&image, registry, config, &filter).await?;
        tracing::info!(
            chart = %image.chart,
            name = %image.name,
            image = %image.image,
            platforms = digests.len(),
            "Resolved image"
        );
        lock.images.push(ChartImage {
            name: image.name,
            image: image.image,
            chart: image.chart,
            digests,
        });
    }

    tracing::debug!(
        chart = %chart.name(),
        images = lock.images.len(),
        artifacts = lock.artifact_count(),
        "Generated Images.lock"
    );
    Ok(lock)
}

/// Generate the lock for `chart` and write it to `lock_path`.
pub async fn create_lock_file(
    chart: &Chart,
    registry: &dyn Registry,
    config: &LockConfig,
    lock_path: &Path,
) -> Result<ImagesLock> {
    let lock = generate_lock(chart, registry, config).await?;
    lock.to_file(lock_path)?;
    tracing::info!(path = %lock_path.display(), "Images.lock written");
    Ok(lock)
}

async fn resolve_digests(
    image: &DeclaredImage,
    registry: &dyn Registry,
    config: &LockConfig,
    filter: &HashSet<String>,
) -> Result<Vec<DigestInfo>> {
    let entries = registry.list_manifests(&image.image).await?;

    let mut seen = HashSet::new();
    let mut digests = Vec::new();
    for entry in entries {
        if !is_image_manifest(&entry.media_type) || config.is_skipped(&entry.annotations) {
            continue;
        }
        let platform = match entry.platform() {
            Some(platform) if !platform.is_unknown() => platform.to_string(),
            _ => continue,
        };
        if !filter.is_empty() && !filter.contains(&platform) {
            continue;
        }
        if !seen.insert(platform.clone()) {
            tracing::warn!(image = %image.image, platform = %platform, "Duplicate platform in manifest list");
            continue;
        }
        digests.push(DigestInfo {
            digest: entry.digest,
            arch: platform,
        });
    }

    if digests.is_empty() {
        return Err(WrapError::NoPlatformsResolved {
            name: image.name.clone(),
            image: image.image.clone(),
        });
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::tests::write_chart;
    use crate::oci::archive::tests::sample_archive;
    use crate::oci::manifest::{Descriptor, IndexPlatform, DOCKER_MANIFEST_V2, OCI_IMAGE_INDEX};
    use crate::oci::MemoryRegistry;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn registry_with_app() -> MemoryRegistry {
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
        registry
    }

    fn extra_entry(arch: &str, os: &str, annotations: &[(&str, &str)]) -> Descriptor {
        Descriptor {
            media_type: DOCKER_MANIFEST_V2.to_string(),
            digest: format!("sha256:{}", "3".repeat(64)),
            size: 1,
            platform: Some(IndexPlatform {
                architecture: arch.to_string(),
                os: os.to_string(),
                variant: None,
            }),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn test_generate_all_platforms() {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), "demo", &[("app", "repo/app:1.0")]);
        let chart = Chart::load(dir.path()).unwrap();
        let registry = registry_with_app();

        let lock = generate_lock(&chart, &registry, &LockConfig::default())
            .await
            .unwrap();
        assert_eq!(lock.chart.name, "demo");
        assert_eq!(lock.images.len(), 1);
        let arches: Vec<_> = lock.images[0].digests.iter().map(|d| d.arch.as_str()).collect();
        assert_eq!(arches, vec!["linux/amd64", "linux/arm64"]);
        assert_eq!(lock.artifact_count(), 2);
    }

    #[tokio::test]
    async fn test_platform_filter() {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), "demo", &[("app", "repo/app:1.0")]);
        let chart = Chart::load(dir.path()).unwrap();
        let registry = registry_with_app();

        let config = LockConfig {
            platforms: vec!["Linux/ARM64/v8".to_string()],
            ..Default::default()
        };
        let lock = generate_lock(&chart, &registry, &config).await.unwrap();
        assert_eq!(lock.images[0].digests.len(), 1);
        assert_eq!(lock.images[0].digests[0].arch, "linux/arm64");

        let config = LockConfig {
            platforms: vec!["linux/s390x".to_string()],
            ..Default::default()
        };
        let err = generate_lock(&chart, &registry, &config).await.unwrap_err();
        assert!(matches!(err, WrapError::NoPlatformsResolved { ref name, .. } if name == "app"));
    }

    #[tokio::test]
    async fn test_skips_attestations_unknown_and_duplicates() {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), "demo", &[("app", "repo/app:1.0")]);
        let chart = Chart::load(dir.path()).unwrap();
        let registry = registry_with_app();
        registry
            .add_index_entry("repo/app:1.0", extra_entry("unknown", "unknown", &[]))
            .unwrap();
        registry
            .add_index_entry(
                "repo/app:1.0",
                extra_entry(
                    "s390x",
                    "linux",
                    &[("vnd.docker.reference.type", "attestation-manifest")],
                ),
            )
            .unwrap();
        registry
            .add_index_entry("repo/app:1.0", extra_entry("amd64", "linux", &[]))
            .unwrap();
        let mut nested = extra_entry("ppc64le", "linux", &[]);
        nested.media_type = OCI_IMAGE_INDEX.to_string();
        registry.add_index_entry("repo/app:1.0", nested).unwrap();

        let lock = generate_lock(&chart, &registry, &LockConfig::default())
            .await
            .unwrap();
        let digests = &lock.images[0].digests;
        assert_eq!(digests.len(), 2);
        assert_ne!(digests[0].digest, format!("sha256:{}", "3".repeat(64)));
    }

    #[tokio::test]
    async fn test_registry_error_aborts() {
        let dir = TempDir::new().unwrap();
        write_chart(
            dir.path(),
            "demo",
            &[("app", "repo/app:1.0"), ("missing", "repo/missing:1")],
        );
        let chart = Chart::load(dir.path()).unwrap();
        let registry = registry_with_app();

        assert!(matches!(
            generate_lock(&chart, &registry, &LockConfig::default()).await,
            Err(WrapError::RegistryError { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_lock_file() {
        let dir = TempDir::new().unwrap();
        write_chart(dir.path(), "demo", &[("app", "repo/app:1.0")]);
        let chart = Chart::load(dir.path()).unwrap();
        let registry = registry_with_app();

        let lock = create_lock_file(&chart, &registry, &LockConfig::default(), &chart.lock_file())
            .await
            .unwrap();
        let stored = ImagesLock::from_file(&chart.lock_file()).unwrap();
        assert!(stored.is_equivalent(&lock));
    }
}
