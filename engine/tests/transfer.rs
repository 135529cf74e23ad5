//! Pull/push behavior against an in-memory registry: retries, cancellation,
//! cache idempotence and manifest list assembly.

mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::{EventEmitter, TransferEvent};
use chartwrap_engine::oci::{archive_path, Descriptor, ManifestList};
use chartwrap_engine::{CachedImage, MemoryRegistry, Registry, TransferEngine};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{drain, engine, fast_transfer, image, lock_for};

const APP: &str = "registry.example.com/team/app:1.0";
const DB: &str = "registry.example.com/team/db:2.0";

fn retries(events: &[TransferEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Retrying { .. }))
        .count()
}

#[tokio::test]
async fn test_pull_recovers_from_transient_failures() {
    let dir = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a")];
    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(APP, archives.clone()).unwrap();
    registry.fail_next(APP, 2).unwrap();

    let events = EventEmitter::default();
    let mut rx = events.subscribe();
    let engine = TransferEngine::new(
        registry.clone(),
        fast_transfer(3),
        CancellationToken::new(),
        events,
    );

    let summary = engine
        .pull_images(&lock_for("demo", &[("app", APP, &archives[..])]), dir.path())
        .await
        .unwrap();
    assert_eq!(summary.transferred, 1);
    assert_eq!(registry.calls(APP), 3);
    assert_eq!(retries(&drain(&mut rx)), 2);
}

#[tokio::test]
async fn test_pull_gives_up_after_max_retries() {
    let dir = TempDir::new().unwrap();
    let app = vec![image(APP, "amd64", "a")];
    let db = vec![image(DB, "amd64", "d")];
    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(APP, app.clone()).unwrap();
    registry.publish(DB, db.clone()).unwrap();
    registry.fail_next(APP, 10).unwrap();

    let lock = lock_for("demo", &[("app", APP, &app[..]), ("db", DB, &db[..])]);
    let err = engine(registry.clone(), 3)
        .pull_images(&lock, dir.path())
        .await
        .unwrap_err();

    let err_is_cancelled = err.is_cancelled();
    match err {
        WrapError::TransferFailed {
            image,
            digest,
            attempts,
            ..
        } => {
            assert_eq!(image, APP);
            assert_eq!(digest.as_deref(), Some(app[0].manifest_digest.as_str()));
            assert_eq!(attempts, 3);
            assert!(!err_is_cancelled);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(registry.calls(APP), 3);
    assert_eq!(registry.calls(DB), 0);
}

#[tokio::test]
async fn test_zero_retries_still_attempts_once() {
    let dir = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a")];
    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(APP, archives.clone()).unwrap();
    registry.fail_next(APP, 1).unwrap();

    let err = engine(registry.clone(), 0)
        .pull_images(&lock_for("demo", &[("app", APP, &archives[..])]), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WrapError::TransferFailed {
            attempts: 1,
            cancelled: true,
            ..
        }
    ));
    assert!(err.is_cancelled());
    assert_eq!(registry.calls(APP), 1);
}

#[tokio::test]
async fn test_pull_twice_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a"), image(APP, "arm64", "a")];
    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(APP, archives.clone()).unwrap();
    let lock = lock_for("demo", &[("app", APP, &archives[..])]);
    let engine = engine(registry.clone(), 3);

    engine.pull_images(&lock, dir.path()).await.unwrap();
    let paths: Vec<_> = archives
        .iter()
        .map(|a| archive_path(dir.path(), &a.manifest_digest))
        .collect();
    let first: Vec<_> = paths.iter().map(|p| std::fs::read(p).unwrap()).collect();

    // Remove one entry so the second pull has real work to do.
    std::fs::remove_file(&paths[1]).unwrap();
    let summary = engine.pull_images(&lock, dir.path()).await.unwrap();
    assert_eq!(summary.cached, 1);
    assert_eq!(summary.transferred, 1);

    let second: Vec<_> = paths.iter().map(|p| std::fs::read(p).unwrap()).collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_pull_then_push_publishes_one_manifest_list() {
    let cache = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a"), image(APP, "arm64", "a")];
    let source = Arc::new(MemoryRegistry::new());
    source.publish(APP, archives.clone()).unwrap();
    let lock = lock_for("demo", &[("app", APP, &archives[..])]);

    let pulled = engine(source, 3)
        .pull_images(&lock, cache.path())
        .await
        .unwrap();
    assert_eq!(pulled.total, 2);
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 2);

    let target = Arc::new(MemoryRegistry::new());
    let pushed = engine(target.clone(), 3)
        .push_images(&lock, cache.path())
        .await
        .unwrap();
    assert_eq!(pushed.transferred, 1);
    assert_eq!(target.calls(APP), 1);

    let index = target.manifest_list(APP).unwrap();
    assert_eq!(index.platforms(), vec!["linux/amd64", "linux/arm64"]);
    let digests: Vec<_> = index.manifests.iter().map(|m| m.digest.clone()).collect();
    assert_eq!(
        digests,
        vec![
            archives[0].manifest_digest.clone(),
            archives[1].manifest_digest.clone()
        ]
    );
}

#[tokio::test]
async fn test_push_retries_then_succeeds() {
    let cache = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a")];
    for archive in &archives {
        archive
            .write(&archive_path(cache.path(), &archive.manifest_digest))
            .unwrap();
    }
    let target = Arc::new(MemoryRegistry::new());
    target.fail_next(APP, 1).unwrap();

    engine(target.clone(), 2)
        .push_images(&lock_for("demo", &[("app", APP, &archives[..])]), cache.path())
        .await
        .unwrap();
    assert_eq!(target.calls(APP), 2);
    assert!(target.manifest_list(APP).is_some());
}

/// Delegates to a [`MemoryRegistry`] and cancels `cancel` once the first
/// image has been pulled.
struct CancelAfterFirstPull {
    inner: MemoryRegistry,
    cancel: CancellationToken,
}

#[async_trait]
impl Registry for CancelAfterFirstPull {
    async fn list_manifests(&self, image: &str) -> Result<Vec<Descriptor>> {
        self.inner.list_manifests(image).await
    }

    async fn pull_image(&self, image: &str, digest: &str, dest: &Path) -> Result<()> {
        self.inner.pull_image(image, digest, dest).await?;
        self.cancel.cancel();
        Ok(())
    }

    async fn push_index(
        &self,
        image: &str,
        images: &[CachedImage],
        index: &ManifestList,
    ) -> Result<String> {
        self.inner.push_index(image, images, index).await
    }

    async fn pull_chart(&self, reference: &str) -> Result<Vec<u8>> {
        self.inner.pull_chart(reference).await
    }
}

#[tokio::test]
async fn test_cancel_between_units() {
    let dir = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a"), image(APP, "arm64", "a")];
    let inner = MemoryRegistry::new();
    inner.publish(APP, archives.clone()).unwrap();
    let cancel = CancellationToken::new();
    let registry = Arc::new(CancelAfterFirstPull {
        inner,
        cancel: cancel.clone(),
    });

    let engine = TransferEngine::new(
        registry.clone(),
        fast_transfer(3),
        cancel,
        EventEmitter::default(),
    );
    let err = engine
        .pull_images(&lock_for("demo", &[("app", APP, &archives[..])]), dir.path())
        .await
        .unwrap_err();

    assert!(matches!(err, WrapError::Cancelled));
    assert_eq!(registry.inner.calls(APP), 1);
    assert!(archive_path(dir.path(), &archives[0].manifest_digest).is_file());
    assert!(!archive_path(dir.path(), &archives[1].manifest_digest).exists());
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let dir = TempDir::new().unwrap();
    let archives = vec![image(APP, "amd64", "a")];
    let registry = Arc::new(MemoryRegistry::new());
    registry.publish(APP, archives.clone()).unwrap();
    registry.fail_next(APP, 10).unwrap();

    let events = EventEmitter::default();
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if matches!(event, TransferEvent::Retrying { .. }) {
                trigger.cancel();
                break;
            }
        }
    });

    // Long enough that only cancellation can end the wait.
    let config = chartwrap_core::TransferConfig {
        max_retries: 5,
        retry_backoff_ms: 60_000,
    };
    let engine = TransferEngine::new(registry.clone(), config, cancel, events);
    let err = engine
        .pull_images(&lock_for("demo", &[("app", APP, &archives[..])]), dir.path())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WrapError::TransferFailed {
            attempts: 1,
            cancelled: true,
            ..
        }
    ));
    assert!(err.is_cancelled());
    assert_eq!(registry.calls(APP), 1);
}
