//! OCI image handling: references, manifests, cached archives and registries.

pub mod archive;
pub mod manifest;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod reference;
pub mod registry;

pub use archive::{archive_path, read_manifest_digest, ArchiveWriter, CachedImage, ImageArchive};
pub use manifest::{Descriptor, ManifestList};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryRegistry;
pub use reference::ImageReference;
pub use registry::{OciRegistry, Registry, RegistryAuth, HELM_CHART_CONTENT_MEDIA_TYPE};
