//! Cached image archives.
//!
//! Every pulled manifest digest is stored as one uncompressed tar holding an
//! OCI image layout:
//!
//! ```text
//! oci-layout
//! index.json              one entry, annotated with the source reference
//! blobs/sha256/<hex>      manifest, config and layers
//! ```
//!
//! Archives are written with fixed headers and sorted entries so pulling the
//! same content twice yields identical bytes. Layers never have to fit in
//! memory: pulls stage blobs on disk through [`ArchiveWriter`], pushes read
//! them back one at a time through [`CachedImage`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::digest_encoded;
use chartwrap_core::Platform;
use serde::{Deserialize, Serialize};

use super::manifest::{
    is_image_manifest, verify_digest, verify_reader_digest, AnyManifest, Descriptor, ImageConfig,
    ImageManifest, IndexPlatform,
};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// File name extension of cached archives.
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Path of the archive caching `digest` inside `images_dir`.
pub fn archive_path(images_dir: &Path, digest: &str) -> PathBuf {
    images_dir.join(format!("{}.{}", digest_encoded(digest), ARCHIVE_EXTENSION))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u8,
    manifests: Vec<Descriptor>,
}

/// Builds one cache archive from blobs staged on disk.
///
/// Blobs land in a scratch directory next to the destination, are checked
/// against their digest, and are copied into the archive by
/// [`finish`](Self::finish), which replaces the destination atomically.
#[derive(Debug)]
pub struct ArchiveWriter {
    dest: PathBuf,
    staging: tempfile::TempDir,
    staged: BTreeSet<String>,
}

impl ArchiveWriter {
    pub fn new(dest: &Path) -> Result<Self> {
        let parent = parent_dir(dest)?;
        std::fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)?;
        Ok(Self {
            dest: dest.to_path_buf(),
            staging,
            staged: BTreeSet::new(),
        })
    }

    /// Scratch file the content of `digest` should be written to.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.staging.path().join(digest_encoded(digest))
    }

    /// Whether `digest` has already been staged and checked.
    pub fn is_staged(&self, digest: &str) -> bool {
        self.staged.contains(digest)
    }

    /// Check the file written at [`blob_path`](Self::blob_path) and record it.
    pub fn commit_blob(&mut self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        verify_reader_digest(File::open(&path)?, digest)?;
        self.staged.insert(digest.to_string());
        Ok(())
    }

    /// Stage an in-memory blob.
    pub fn add_blob(&mut self, digest: &str, data: &[u8]) -> Result<()> {
        verify_digest(data, digest)?;
        std::fs::write(self.blob_path(digest), data)?;
        self.staged.insert(digest.to_string());
        Ok(())
    }

    /// Write the archive for `manifest` once all of its blobs are staged.
    pub fn finish(self, image: &str, manifest_digest: &str, media_type: &str, manifest: &[u8]) -> Result<()> {
        verify_digest(manifest, manifest_digest)?;
        if !is_image_manifest(media_type) {
            return Err(WrapError::OciImageError(format!(
                "Cannot archive '{}': not a single-platform image manifest",
                media_type
            )));
        }
        let parsed: ImageManifest = serde_json::from_slice(manifest)
            .map_err(|e| WrapError::OciImageError(format!("Invalid image manifest: {}", e)))?;
        for descriptor in std::iter::once(&parsed.config).chain(&parsed.layers) {
            if !self.staged.contains(&descriptor.digest) {
                return Err(WrapError::OciImageError(format!(
                    "Blob {} of {} was never fetched",
                    descriptor.digest, image
                )));
            }
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), image.to_string());
        let index = LayoutIndex {
            schema_version: 2,
            manifests: vec![Descriptor {
                media_type: media_type.to_string(),
                digest: manifest_digest.to_string(),
                size: manifest.len() as i64,
                platform: None,
                annotations,
            }],
        };
        let index_json = serde_json::to_vec(&index)?;

        // The manifest sorts among the blobs by its own path.
        let mut entries: BTreeMap<String, Option<&str>> = BTreeMap::new();
        entries.insert(blob_path(manifest_digest), None);
        for digest in &self.staged {
            entries.insert(blob_path(digest), Some(digest));
        }

        let parent = parent_dir(&self.dest)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut builder = tar::Builder::new(tmp.as_file_mut());
            append_file(&mut builder, OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT)?;
            append_file(&mut builder, INDEX_FILE, &index_json)?;
            for (entry_path, source) in &entries {
                match source {
                    None => append_file(&mut builder, entry_path, manifest)?,
                    Some(digest) => {
                        let file = File::open(self.blob_path(digest))?;
                        let size = file.metadata()?.len();
                        append_reader(&mut builder, entry_path, size, file)?;
                    }
                }
            }
            builder.finish()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.dest).map_err(|e| WrapError::IoError(e.error))?;

        tracing::debug!(
            path = %self.dest.display(),
            digest = %manifest_digest,
            blobs = self.staged.len(),
            "Wrote image archive"
        );
        Ok(())
    }
}

/// A cache archive on disk, validated without loading its layers.
#[derive(Debug, Clone)]
pub struct CachedImage {
    path: PathBuf,
    /// Reference the image was pulled from
    pub image: String,
    /// Digest of `manifest`
    pub manifest_digest: String,
    /// Media type of `manifest`
    pub media_type: String,
    /// Raw manifest bytes, as served by the registry
    pub manifest: Vec<u8>,
    config_digest: String,
    config: Vec<u8>,
    layers: Vec<String>,
}

impl CachedImage {
    /// Open the archive at `path`, checking every blob against its digest.
    pub fn open(path: &Path) -> Result<Self> {
        let index_data =
            read_entry(path, INDEX_FILE)?.ok_or_else(|| invalid_archive(path, "missing index.json"))?;
        let (entry, image) = parse_index(path, &index_data)?;

        let manifest = read_entry(path, &blob_path(&entry.digest))?
            .ok_or_else(|| invalid_archive(path, "missing manifest blob"))?;
        verify_digest(&manifest, &entry.digest)?;
        let media_type = AnyManifest::parse(&manifest)?
            .resolved_media_type()
            .to_string();
        let parsed: ImageManifest = serde_json::from_slice(&manifest)
            .map_err(|e| invalid_archive(path, &format!("invalid manifest: {}", e)))?;

        let mut wanted: BTreeMap<String, String> = std::iter::once(&parsed.config)
            .chain(&parsed.layers)
            .map(|d| (blob_path(&d.digest), d.digest.clone()))
            .collect();
        let mut config = None;

        let mut archive = tar::Archive::new(File::open(path)?);
        for tar_entry in archive.entries_with_seek()? {
            let mut tar_entry = tar_entry?;
            let name = tar_entry.path()?.to_string_lossy().into_owned();
            let Some(digest) = wanted.remove(&name) else {
                continue;
            };
            if digest == parsed.config.digest {
                let mut data = Vec::new();
                tar_entry.read_to_end(&mut data)?;
                verify_digest(&data, &digest)?;
                config = Some(data);
            } else {
                verify_reader_digest(&mut tar_entry, &digest)?;
            }
        }
        if let Some(digest) = wanted.into_values().next() {
            return Err(invalid_archive(path, &format!("missing blob {}", digest)));
        }
        let config = config.ok_or_else(|| invalid_archive(path, "missing config blob"))?;

        let mut layers = Vec::with_capacity(parsed.layers.len());
        for layer in parsed.layers {
            if layer.digest != parsed.config.digest && !layers.contains(&layer.digest) {
                layers.push(layer.digest);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            image,
            manifest_digest: entry.digest,
            media_type,
            manifest,
            config_digest: parsed.config.digest,
            config,
            layers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Platform declared by the image config.
    pub fn platform(&self) -> Result<Platform> {
        ImageConfig::platform_from_blob(&self.config)
    }

    /// Index entry describing this image, with its platform filled in.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let platform = self.platform()?;
        Ok(Descriptor {
            media_type: self.media_type.clone(),
            digest: self.manifest_digest.clone(),
            size: self.manifest.len() as i64,
            platform: Some(IndexPlatform::from(&platform)),
            annotations: BTreeMap::new(),
        })
    }

    /// Config digest followed by each distinct layer digest.
    pub fn blob_digests(&self) -> Vec<&str> {
        std::iter::once(self.config_digest.as_str())
            .chain(self.layers.iter().map(String::as_str))
            .collect()
    }

    /// Load one blob from the archive.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        if digest == self.config_digest {
            return Ok(self.config.clone());
        }
        let data = read_entry(&self.path, &blob_path(digest))?.ok_or_else(|| {
            invalid_archive(&self.path, &format!("missing blob {}", digest))
        })?;
        verify_digest(&data, digest)?;
        Ok(data)
    }

    /// Load every blob into an [`ImageArchive`].
    pub fn load(&self) -> Result<ImageArchive> {
        let mut blobs = BTreeMap::new();
        for digest in self.blob_digests() {
            blobs.insert(digest.to_string(), self.read_blob(digest)?);
        }
        ImageArchive::new(
            self.image.clone(),
            self.manifest_digest.clone(),
            self.media_type.clone(),
            self.manifest.clone(),
            blobs,
        )
    }
}

/// One single-platform image held entirely in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArchive {
    /// Reference the image was pulled from
    pub image: String,
    /// Digest of `manifest`
    pub manifest_digest: String,
    /// Media type of `manifest`
    pub media_type: String,
    /// Raw manifest bytes, as served by the registry
    pub manifest: Vec<u8>,
    /// Config and layer blobs keyed by digest
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl ImageArchive {
    /// Assemble an archive, checking the manifest against its digest.
    pub fn new(
        image: impl Into<String>,
        manifest_digest: impl Into<String>,
        media_type: impl Into<String>,
        manifest: Vec<u8>,
        blobs: BTreeMap<String, Vec<u8>>,
    ) -> Result<Self> {
        let manifest_digest = manifest_digest.into();
        let media_type = media_type.into();
        verify_digest(&manifest, &manifest_digest)?;
        if !is_image_manifest(&media_type) {
            return Err(WrapError::OciImageError(format!(
                "Cannot archive '{}': not a single-platform image manifest",
                media_type
            )));
        }
        Ok(Self {
            image: image.into(),
            manifest_digest,
            media_type,
            manifest,
            blobs,
        })
    }

    /// Parsed image manifest.
    pub fn image_manifest(&self) -> Result<ImageManifest> {
        serde_json::from_slice(&self.manifest)
            .map_err(|e| WrapError::OciImageError(format!("Invalid image manifest: {}", e)))
    }

    /// Platform declared by the image config.
    pub fn platform(&self) -> Result<Platform> {
        let manifest = self.image_manifest()?;
        let config = self.blob(&manifest.config.digest)?;
        ImageConfig::platform_from_blob(config)
    }

    /// Blob bytes for `digest`.
    pub fn blob(&self, digest: &str) -> Result<&[u8]> {
        self.blobs.get(digest).map(Vec::as_slice).ok_or_else(|| {
            WrapError::OciImageError(format!(
                "Archive of {} is missing blob {}",
                self.image, digest
            ))
        })
    }

    /// Index entry describing this image, with its platform filled in.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let platform = self.platform()?;
        Ok(Descriptor {
            media_type: self.media_type.clone(),
            digest: self.manifest_digest.clone(),
            size: self.manifest.len() as i64,
            platform: Some(IndexPlatform::from(&platform)),
            annotations: BTreeMap::new(),
        })
    }

    /// Write the archive to `path`, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = ArchiveWriter::new(path)?;
        for (digest, data) in &self.blobs {
            writer.add_blob(digest, data)?;
        }
        writer.finish(
            &self.image,
            &self.manifest_digest,
            &self.media_type,
            &self.manifest,
        )
    }
}

/// Manifest digest recorded in an archive's index, without loading its blobs.
pub fn read_manifest_digest(path: &Path) -> Result<String> {
    let data =
        read_entry(path, INDEX_FILE)?.ok_or_else(|| invalid_archive(path, "missing index.json"))?;
    let (descriptor, _) = parse_index(path, &data)?;
    Ok(descriptor.digest)
}

fn parse_index(path: &Path, data: &[u8]) -> Result<(Descriptor, String)> {
    let index: LayoutIndex = serde_json::from_slice(data)
        .map_err(|e| invalid_archive(path, &format!("invalid index.json: {}", e)))?;
    let mut manifests = index.manifests.into_iter();
    match (manifests.next(), manifests.next()) {
        (Some(entry), None) => {
            let image = entry
                .annotations
                .get(REF_NAME_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            Ok((entry, image))
        }
        _ => Err(invalid_archive(
            path,
            "index.json must describe exactly one manifest",
        )),
    }
}

/// Content of the regular file `name` inside the tar at `path`, seeking past
/// everything else.
fn read_entry(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(File::open(path)?);
    for entry in archive.entries_with_seek()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() || entry.path()?.to_string_lossy() != name {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        return Ok(Some(data));
    }
    Ok(None)
}

fn blob_path(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algorithm, hex)) => format!("blobs/{}/{}", algorithm, hex),
        None => format!("blobs/sha256/{}", digest),
    }
}

fn parent_dir(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(WrapError::Other(format!(
            "Archive path has no parent: {}",
            path.display()
        ))),
    }
}

fn invalid_archive(path: &Path, message: &str) -> WrapError {
    WrapError::OciImageError(format!(
        "Invalid image archive {}: {}",
        path.display(),
        message
    ))
}

/// Append a regular file with a fixed header.
pub(crate) fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<()> {
    append_reader(builder, path, data.len() as u64, data)
}

fn append_reader<W: std::io::Write, R: Read>(
    builder: &mut tar::Builder<W>,
    path: &str,
    size: u64,
    data: R,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
