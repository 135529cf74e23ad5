//! Images.lock verification.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::{diff, ImagesLock};
use chartwrap_core::LockConfig;

use crate::chart::Chart;
use crate::lock::generate_lock;
use crate::oci::Registry;

/// Check the lock at `lock_path` against what `chart` declares today.
///
/// The lock is regenerated in memory and compared entry by entry. Any
/// difference is reported as a [`WrapError::DriftError`] carrying the full
/// diff. Registry errors are returned as-is, without retrying.
///
/// Without an explicit platform filter in `config`, each image is compared
/// only on the platforms its persisted entry pins, so a lock generated with
/// `--platforms` verifies against the chart it came from.
pub async fn verify_lock(
    chart: &Chart,
    lock_path: &Path,
    registry: &dyn Registry,
    config: &LockConfig,
) -> Result<()> {
    let persisted = ImagesLock::from_file(lock_path)?;
    let mut current = generate_lock(chart, registry, config).await?;
    if config.platforms.is_empty() {
        restrict_to_locked_platforms(&mut current, &persisted);
    }

    let drift = diff(&persisted, &current);
    if !drift.is_empty() {
        tracing::warn!(
            path = %lock_path.display(),
            added = drift.added.len(),
            removed = drift.removed.len(),
            changed = drift.changed.len(),
            "Images.lock is out of date"
        );
        return Err(WrapError::DriftError(drift));
    }

    tracing::info!(path = %lock_path.display(), "Images.lock is up to date");
    Ok(())
}

/// Drop regenerated digests on platforms the persisted lock never pinned.
///
/// Images the persisted lock does not know keep every platform and show up
/// as additions.
fn restrict_to_locked_platforms(current: &mut ImagesLock, persisted: &ImagesLock) {
    let locked: HashMap<(&str, &str), BTreeSet<&str>> = persisted
        .images
        .iter()
        .map(|image| {
            let platforms = image.digests.iter().map(|d| d.arch.as_str()).collect();
            ((image.chart.as_str(), image.name.as_str()), platforms)
        })
        .collect();

    for image in &mut current.images {
        let Some(platforms) = locked.get(&(image.chart.as_str(), image.name.as_str())) else {
            continue;
        };
        image
            .digests
            .retain(|d| platforms.contains(d.arch.as_str()));
    }
}
