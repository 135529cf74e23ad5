//! Chart bundles: a chart root, its lock and cached images in one `.tgz`.
//!
//! Every entry lives under `<name>-<version>/`. Entries are sorted and
//! written with fixed ownership and timestamps so packing the same tree
//! twice yields identical bytes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chartwrap_core::error::{Result, WrapError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::chart::{Chart, CHART_FILE};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
// Matches both POSIX "ustar\0" and GNU "ustar " headers.
const TAR_MAGIC: &[u8] = b"ustar";
const HEADER_BLOCK: u64 = 512;

/// Detected bundle encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleFormat {
    TarGz,
    Tar,
}

/// Pack `chart_root` into `out_file`. Returns the written path.
pub fn pack(chart_root: &Path, out_file: &Path) -> Result<PathBuf> {
    let chart = Chart::load(chart_root)?;
    let prefix = format!("{}-{}", chart.name(), chart.version());
    let root = chart.root_dir().to_path_buf();

    let out_dir = match out_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&out_dir)?;
    let excluded = std::fs::canonicalize(&out_dir)
        .ok()
        .and_then(|dir| out_file.file_name().map(|name| dir.join(name)));

    let mut entries = Vec::new();
    collect_entries(&root, Path::new(""), excluded.as_deref(), &mut entries)?;
    entries.sort();

    let mut tmp = tempfile::NamedTempFile::new_in(&out_dir)?;
    {
        let encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = fixed_header(tar::EntryType::Directory, 0o755, 0);
        builder.append_data(&mut header, format!("{}/", prefix), std::io::empty())?;

        for relative in &entries {
            let source = root.join(relative);
            let name = format!("{}/{}", prefix, relative.to_string_lossy());
            if source.is_dir() {
                let mut header = fixed_header(tar::EntryType::Directory, 0o755, 0);
                builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
            } else {
                let metadata = std::fs::metadata(&source)?;
                let mode = if is_executable(&metadata) { 0o755 } else { 0o644 };
                let mut header = fixed_header(tar::EntryType::Regular, mode, metadata.len());
                builder.append_data(&mut header, name, File::open(&source)?)?;
            }
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;
    }
    tmp.persist(out_file).map_err(|e| WrapError::IoError(e.error))?;

    tracing::info!(
        chart = %chart.name(),
        output = %out_file.display(),
        entries = entries.len(),
        "Packed chart bundle"
    );
    Ok(out_file.to_path_buf())
}

/// Unpack a bundle into `dest_dir` and return the chart root inside it.
///
/// The bundle must hold exactly one top-level directory with a Chart.yaml;
/// that directory is the chart root, whatever else `dest_dir` contains.
pub fn unpack(archive: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let format = detect(archive)?.ok_or_else(|| {
        WrapError::PackageFormatError(format!(
            "{} is neither a tar nor a gzip-compressed tar archive",
            archive.display()
        ))
    })?;
    let top = top_level_entry(archive, format)?;

    std::fs::create_dir_all(dest_dir)?;
    let result = open_tar(archive, format)?.unpack(dest_dir);
    result.map_err(|e| {
        WrapError::PackageFormatError(format!(
            "Failed to extract {} to {}: {}",
            archive.display(),
            dest_dir.display(),
            e
        ))
    })?;

    let chart_root = dest_dir.join(&top);
    if !chart_root.join(CHART_FILE).is_file() {
        return Err(WrapError::PackageFormatError(format!(
            "{} has no {} under {}/",
            archive.display(),
            CHART_FILE,
            top
        )));
    }
    tracing::info!(
        archive = %archive.display(),
        chart_root = %chart_root.display(),
        "Unpacked chart bundle"
    );
    Ok(chart_root)
}

/// Whether `path` holds a bundle, judged by content rather than extension.
pub fn is_bundle(path: &Path) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    Ok(detect(path)?.is_some())
}

fn detect(path: &Path) -> Result<Option<BundleFormat>> {
    let mut head = Vec::new();
    File::open(path)?.take(HEADER_BLOCK).read_to_end(&mut head)?;

    if head.starts_with(&GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        let decoder = GzDecoder::new(File::open(path)?);
        // A truncated or corrupt stream simply isn't a bundle.
        if decoder.take(HEADER_BLOCK).read_to_end(&mut decompressed).is_err() {
            return Ok(None);
        }
        return Ok(has_tar_magic(&decompressed).then_some(BundleFormat::TarGz));
    }
    Ok(has_tar_magic(&head).then_some(BundleFormat::Tar))
}

fn has_tar_magic(block: &[u8]) -> bool {
    block
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
}

fn open_tar(archive: &Path, format: BundleFormat) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = match format {
        BundleFormat::TarGz => Box::new(GzDecoder::new(file)),
        BundleFormat::Tar => Box::new(file),
    };
    Ok(tar::Archive::new(reader))
}

/// Name of the single directory every entry of `archive` lives under.
fn top_level_entry(archive: &Path, format: BundleFormat) -> Result<String> {
    let unreadable = |e: std::io::Error| {
        WrapError::PackageFormatError(format!("Failed to read {}: {}", archive.display(), e))
    };

    let mut tops = BTreeSet::new();
    let mut tar = open_tar(archive, format)?;
    for entry in tar.entries().map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if entry.header().entry_type().is_pax_global_extensions() {
            continue;
        }
        let path = entry.path().map_err(unreadable)?;
        let first = path.components().find_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        });
        if let Some(first) = first {
            tops.insert(first);
        }
    }

    let mut tops = tops.into_iter();
    match (tops.next(), tops.next()) {
        (Some(top), None) => Ok(top),
        (None, _) => Err(WrapError::PackageFormatError(format!(
            "{} is empty",
            archive.display()
        ))),
        (Some(first), Some(second)) => Err(WrapError::PackageFormatError(format!(
            "{} holds more than one top-level entry ({}, {}, ...)",
            archive.display(),
            first,
            second
        ))),
    }
}

/// Collect paths under `root`, relative to it, skipping `excluded`.
fn collect_entries(
    root: &Path,
    relative: &Path,
    excluded: Option<&Path>,
    entries: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        let file_type = entry.file_type()?;

        if let Some(excluded) = excluded {
            if std::fs::canonicalize(entry.path()).ok().as_deref() == Some(excluded) {
                tracing::debug!(path = %child.display(), "Skipping bundle output");
                continue;
            }
        }

        if file_type.is_dir() {
            entries.push(child.clone());
            collect_entries(root, &child, excluded, entries)?;
        } else if file_type.is_file() {
            entries.push(child);
        } else {
            tracing::warn!(path = %child.display(), "Skipping non-regular file");
        }
    }
    Ok(())
}

fn fixed_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
