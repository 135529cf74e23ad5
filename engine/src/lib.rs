//! chartwrap engine - chart image locking, transfer and bundling.
//!
//! Resolves the images a Helm chart declares into an `Images.lock`, verifies
//! it, moves the locked images between registries and a local cache, and
//! packs the result into a distributable bundle.

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod chart;
pub mod lock;
pub mod oci;
pub mod transfer;
pub mod verify;
pub mod wrap;

// Re-export common types
pub use chart::{Chart, DeclaredImage};
pub use lock::{create_lock_file, generate_lock};
#[cfg(any(test, feature = "testing"))]
pub use oci::MemoryRegistry;
pub use oci::{CachedImage, ImageArchive, ImageReference, OciRegistry, Registry, RegistryAuth};
pub use transfer::{TransferEngine, TransferSummary};
pub use verify::verify_lock;
pub use wrap::{relocate_lock, unwrap_chart, wrap_chart, UnwrapOptions, Workflow, WrapOptions};

/// chartwrap engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
