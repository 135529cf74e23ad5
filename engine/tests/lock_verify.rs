//! Lock generation and drift detection end to end.

mod common;

use chartwrap_core::error::WrapError;
use chartwrap_core::{ImagesLock, LockConfig};
use chartwrap_engine::{create_lock_file, verify_lock, Chart, MemoryRegistry};
use tempfile::TempDir;

use common::{image, write_chart};

const APP: &str = "registry.example.com/team/app:1.0";
const DB: &str = "registry.example.com/team/db:2.0";

fn registry() -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry
        .publish(APP, vec![image(APP, "amd64", "v1"), image(APP, "arm64", "v1")])
        .unwrap();
    registry.publish(DB, vec![image(DB, "amd64", "v1")]).unwrap();
    registry
}

async fn locked_chart(dir: &TempDir, images: &[(&str, &str)], registry: &MemoryRegistry) -> Chart {
    write_chart(dir.path(), "demo", images);
    let chart = Chart::load(dir.path()).unwrap();
    create_lock_file(&chart, registry, &LockConfig::default(), &chart.lock_file())
        .await
        .unwrap();
    chart
}

async fn drift(chart: &Chart, registry: &MemoryRegistry) -> chartwrap_core::LockDiff {
    match verify_lock(chart, &chart.lock_file(), registry, &LockConfig::default()).await {
        Err(WrapError::DriftError(diff)) => diff,
        other => panic!("expected drift, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fresh_lock_verifies() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    let chart = locked_chart(&dir, &[("app", APP), ("db", DB)], &registry).await;

    let lock = ImagesLock::from_file(&chart.lock_file()).unwrap();
    assert_eq!(lock.images.len(), 2);
    assert_eq!(lock.artifact_count(), 3);
    assert_eq!(lock.images[0].digests[0].arch, "linux/amd64");
    assert_eq!(lock.images[0].digests[1].arch, "linux/arm64");

    verify_lock(&chart, &chart.lock_file(), &registry, &LockConfig::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_verify_reports_added_image() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    locked_chart(&dir, &[("app", APP)], &registry).await;

    write_chart(dir.path(), "demo", &[("app", APP), ("db", DB)]);
    let chart = Chart::load(dir.path()).unwrap();
    let diff = drift(&chart, &registry).await;

    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].name, "db");
    assert!(diff.removed.is_empty());
    assert!(diff.changed.is_empty());
}

#[tokio::test]
async fn test_verify_reports_removed_image() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    locked_chart(&dir, &[("app", APP), ("db", DB)], &registry).await;

    write_chart(dir.path(), "demo", &[("app", APP)]);
    let chart = Chart::load(dir.path()).unwrap();
    let diff = drift(&chart, &registry).await;

    assert!(diff.added.is_empty());
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.removed[0].name, "db");
    assert_eq!(diff.removed[0].platform, "linux/amd64");
}

#[tokio::test]
async fn test_verify_reports_retagged_digest() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    let chart = locked_chart(&dir, &[("app", APP)], &registry).await;
    let before = ImagesLock::from_file(&chart.lock_file()).unwrap();

    // Same tag, new arm64 build.
    registry
        .publish(APP, vec![image(APP, "amd64", "v1"), image(APP, "arm64", "v2")])
        .unwrap();
    let diff = drift(&chart, &registry).await;

    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.changed.len(), 1);
    let change = &diff.changed[0];
    assert_eq!(change.locked.platform, "linux/arm64");
    assert_eq!(change.locked.digest, before.images[0].digests[1].digest);
    assert_ne!(change.current.digest, change.locked.digest);
}

#[tokio::test]
async fn test_platform_filter_limits_lock() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    write_chart(dir.path(), "demo", &[("app", APP)]);
    let chart = Chart::load(dir.path()).unwrap();
    let config = LockConfig {
        platforms: vec!["linux/arm64".to_string()],
        ..Default::default()
    };

    let lock = create_lock_file(&chart, &registry, &config, &chart.lock_file())
        .await
        .unwrap();
    assert_eq!(lock.artifact_count(), 1);
    assert_eq!(lock.images[0].digests[0].arch, "linux/arm64");
}

#[tokio::test]
async fn test_filter_matching_nothing_fails() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    write_chart(dir.path(), "demo", &[("db", DB)]);
    let chart = Chart::load(dir.path()).unwrap();
    let config = LockConfig {
        platforms: vec!["linux/s390x".to_string()],
        ..Default::default()
    };

    let err = create_lock_file(&chart, &registry, &config, &chart.lock_file())
        .await
        .unwrap_err();
    assert!(matches!(err, WrapError::NoPlatformsResolved { ref name, .. } if name == "db"));
    assert!(!chart.lock_file().exists());
}

#[tokio::test]
async fn test_registry_error_aborts_generation() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    registry.fail_next(DB, 1).unwrap();
    write_chart(dir.path(), "demo", &[("app", APP), ("db", DB)]);
    let chart = Chart::load(dir.path()).unwrap();

    let err = create_lock_file(&chart, &registry, &LockConfig::default(), &chart.lock_file())
        .await
        .unwrap_err();
    assert!(matches!(err, WrapError::RegistryError { .. }));
}
