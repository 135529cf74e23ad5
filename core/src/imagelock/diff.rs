use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::ImagesLock;

/// One (chart, name, platform) → digest pin, flattened out of a lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LockedDigest {
    pub chart: String,
    pub name: String,
    pub image: String,
    pub platform: String,
    pub digest: String,
}

/// Same (chart, name, platform) pinned to a different image or digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestChange {
    /// Entry in the persisted lock
    pub locked: LockedDigest,
    /// Entry resolved from the chart now
    pub current: LockedDigest,
}

/// Every discrepancy between two locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockDiff {
    pub added: Vec<LockedDigest>,
    pub removed: Vec<LockedDigest>,
    pub changed: Vec<DigestChange>,
}

impl LockDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Total number of discrepancies.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

type Key = (String, String, String);

fn keyed(lock: &ImagesLock) -> BTreeMap<Key, LockedDigest> {
    lock.entries()
        .into_iter()
        .map(|e| ((e.chart.clone(), e.name.clone(), e.platform.clone()), e))
        .collect()
}

/// Compare `a` (the persisted lock) against `b` (a freshly resolved one).
///
/// `added` holds pins only in `b`, `removed` pins only in `a`. Results are
/// sorted by (chart, name, platform) so reports are stable.
pub fn diff(a: &ImagesLock, b: &ImagesLock) -> LockDiff {
    let before = keyed(a);
    let mut after = keyed(b);
    let mut result = LockDiff::default();

    for (key, locked) in before {
        match after.remove(&key) {
            None => result.removed.push(locked),
            Some(current) => {
                if current.digest != locked.digest || current.image != locked.image {
                    result.changed.push(DigestChange { locked, current });
                }
            }
        }
    }
    result.added = after.into_values().collect();
    result
}

impl fmt::Display for LockedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} [{}] {}",
            self.chart, self.name, self.image, self.platform, self.digest
        )
    }
}

impl fmt::Display for LockDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} removed, {} changed",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )?;
        for entry in &self.added {
            write!(f, "\n  + {}", entry)?;
        }
        for entry in &self.removed {
            write!(f, "\n  - {}", entry)?;
        }
        for change in &self.changed {
            write!(
                f,
                "\n  ~ {}/{} [{}] {}@{} -> {}@{}",
                change.locked.chart,
                change.locked.name,
                change.locked.platform,
                change.locked.image,
                change.locked.digest,
                change.current.image,
                change.current.digest
            )?;
        }
        Ok(())
    }
}
