//! Image transfer between registries and the local image cache.
//!
//! Pull walks every locked digest and stores it as `<images_dir>/<hex>.tar`.
//! Push opens the cached archives of each locked image and publishes them
//! under one manifest list, reading one blob at a time. Units run one at a time; each gets
//! `max(1, max_retries)` attempts with a linear, cancellable backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::{ChartImage, ImagesLock};
use chartwrap_core::{EventEmitter, Operation, TransferConfig, TransferEvent, TransferUnit};
use tokio_util::sync::CancellationToken;

use crate::oci::archive::{archive_path, read_manifest_digest, CachedImage};
use crate::oci::manifest::ManifestList;
use crate::oci::Registry;

/// Outcome of a successful pull or push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Units in the call
    pub total: usize,
    /// Units fetched from or sent to the registry
    pub transferred: usize,
    /// Units already present in the local cache
    pub cached: usize,
}

/// Work performed by a single attempt.
enum Work<'a> {
    Pull {
        digest: &'a str,
        path: PathBuf,
    },
    Push {
        images: Vec<CachedImage>,
        index: ManifestList,
    },
}

/// Moves locked images between a registry and the local cache.
pub struct TransferEngine {
    registry: Arc<dyn Registry>,
    config: TransferConfig,
    cancel: CancellationToken,
    events: EventEmitter,
}

impl TransferEngine {
    pub fn new(
        registry: Arc<dyn Registry>,
        config: TransferConfig,
        cancel: CancellationToken,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            config,
            cancel,
            events,
        }
    }

    /// Pull every digest of `lock` into `images_dir`.
    ///
    /// Digests whose archive is already cached are skipped.
    pub async fn pull_images(&self, lock: &ImagesLock, images_dir: &Path) -> Result<TransferSummary> {
        std::fs::create_dir_all(images_dir)?;

        let total = lock.artifact_count();
        let mut summary = TransferSummary {
            total,
            ..Default::default()
        };
        self.events.emit(TransferEvent::Started {
            operation: Operation::Pull,
            total,
        });
        tracing::info!(images_dir = %images_dir.display(), total, "Pulling images");

        let mut completed = 0;
        for image in &lock.images {
            for entry in &image.digests {
                self.ensure_not_cancelled()?;

                let unit = TransferUnit {
                    name: image.name.clone(),
                    image: image.image.clone(),
                    platform: Some(entry.arch.clone()),
                    digest: Some(entry.digest.clone()),
                };
                self.events.emit(TransferEvent::UnitStarted {
                    unit: unit.clone(),
                    completed,
                    total,
                });

                let path = archive_path(images_dir, &entry.digest);
                let cached = is_cached(&path, &entry.digest);
                if cached {
                    tracing::debug!(unit = %unit, path = %path.display(), "Image already cached");
                    summary.cached += 1;
                } else {
                    let work = Work::Pull {
                        digest: &entry.digest,
                        path,
                    };
                    self.run_with_retry(&unit, &work).await?;
                    summary.transferred += 1;
                }

                completed += 1;
                self.events.emit(TransferEvent::UnitSucceeded {
                    unit,
                    completed,
                    total,
                    cached,
                });
            }
        }

        self.events.emit(TransferEvent::Finished {
            operation: Operation::Pull,
            completed,
            total,
        });
        tracing::info!(
            transferred = summary.transferred,
            cached = summary.cached,
            "All images pulled"
        );
        Ok(summary)
    }

    /// Push every image of `lock` from `images_dir`, one manifest list each.
    pub async fn push_images(&self, lock: &ImagesLock, images_dir: &Path) -> Result<TransferSummary> {
        let total = lock.images.len();
        let mut summary = TransferSummary {
            total,
            ..Default::default()
        };
        self.events.emit(TransferEvent::Started {
            operation: Operation::Push,
            total,
        });
        tracing::info!(images_dir = %images_dir.display(), total, "Pushing images");

        let mut completed = 0;
        for image in &lock.images {
            self.ensure_not_cancelled()?;

            let unit = TransferUnit {
                name: image.name.clone(),
                image: image.image.clone(),
                platform: None,
                digest: None,
            };
            self.events.emit(TransferEvent::UnitStarted {
                unit: unit.clone(),
                completed,
                total,
            });

            let (images, index) = match assemble_index(image, images_dir) {
                Ok(assembled) => assembled,
                Err(e) => return Err(self.failed(&unit, 0, false, e)),
            };
            self.run_with_retry(&unit, &Work::Push { images, index })
                .await?;

            completed += 1;
            summary.transferred += 1;
            self.events.emit(TransferEvent::UnitSucceeded {
                unit,
                completed,
                total,
                cached: false,
            });
        }

        self.events.emit(TransferEvent::Finished {
            operation: Operation::Push,
            completed,
            total,
        });
        tracing::info!(pushed = completed, "All images pushed");
        Ok(summary)
    }

    /// Run `work` until it succeeds, attempts run out or the call is cancelled.
    async fn run_with_retry(&self, unit: &TransferUnit, work: &Work<'_>) -> Result<()> {
        let max_attempts = self.config.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.events.emit(TransferEvent::Attempt {
                unit: unit.clone(),
                attempt,
            });

            let error = match self.attempt(unit, work).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return Err(self.failed(unit, attempt, true, error));
            }
            if attempt >= max_attempts {
                return Err(self.failed(unit, attempt, false, error));
            }

            let delay = self.config.backoff_for(attempt);
            tracing::warn!(
                unit = %unit,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transfer failed, retrying"
            );
            self.events.emit(TransferEvent::Retrying {
                unit: unit.clone(),
                attempt,
                max_attempts,
                error: error.to_string(),
            });

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(self.failed(unit, attempt, true, error));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, unit: &TransferUnit, work: &Work<'_>) -> Result<()> {
        match work {
            Work::Pull { digest, path } => {
                self.registry.pull_image(&unit.image, digest, path).await?;
                let pulled = read_manifest_digest(path)?;
                if pulled != *digest {
                    std::fs::remove_file(path)?;
                    return Err(WrapError::OciImageError(format!(
                        "Registry returned {} for {}@{}",
                        pulled, unit.image, digest
                    )));
                }
                Ok(())
            }
            Work::Push { images, index } => {
                let digest = self
                    .registry
                    .push_index(&unit.image, images, index)
                    .await?;
                tracing::debug!(unit = %unit, digest = %digest, "Manifest list published");
                Ok(())
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!("Transfer cancelled");
            return Err(WrapError::Cancelled);
        }
        Ok(())
    }

    /// Terminal failure of `unit`.
    fn failed(
        &self,
        unit: &TransferUnit,
        attempts: u32,
        cancelled: bool,
        cause: WrapError,
    ) -> WrapError {
        if cancelled {
            tracing::warn!(unit = %unit, attempts, error = %cause, "Transfer cancelled");
        } else {
            tracing::error!(unit = %unit, attempts, error = %cause, "Transfer failed");
        }
        self.events.emit(TransferEvent::UnitFailed {
            unit: unit.clone(),
            error: cause.to_string(),
        });
        WrapError::TransferFailed {
            image: unit.image.clone(),
            digest: unit.digest.clone(),
            platform: unit.platform.clone(),
            attempts,
            cancelled,
            cause: Box::new(cause),
        }
    }
}

/// Whether `path` already caches `digest`.
fn is_cached(path: &Path, digest: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    match read_manifest_digest(path) {
        Ok(cached) => cached == digest,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
            false
        }
    }
}

/// Open the cached archives of `image` and build its manifest list, in lock
/// order.
fn assemble_index(image: &ChartImage, images_dir: &Path) -> Result<(Vec<CachedImage>, ManifestList)> {
    let mut archives = Vec::with_capacity(image.digests.len());
    let mut descriptors = Vec::with_capacity(image.digests.len());

    for entry in &image.digests {
        let path = archive_path(images_dir, &entry.digest);
        let archive = CachedImage::open(&path)?;
        if archive.manifest_digest != entry.digest {
            return Err(WrapError::OciImageError(format!(
                "{} holds {}, but the lock pins {} for {}",
                path.display(),
                archive.manifest_digest,
                entry.digest,
                entry.arch
            )));
        }

        let descriptor = archive.descriptor()?;
        if let Some(platform) = descriptor.platform() {
            if platform.to_string() != entry.arch {
                tracing::warn!(
                    image = %image.image,
                    locked = %entry.arch,
                    config = %platform,
                    "Image config platform differs from the lock"
                );
            }
        }
        descriptors.push(descriptor);
        archives.push(archive);
    }

    Ok((archives, ManifestList::from_manifests(descriptors)))
}
