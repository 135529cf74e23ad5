//! End-to-end workflows built from the lock, transfer and bundle steps.
//!
//! `wrap` turns a chart (directory, bundle or `oci://` reference) into a
//! self-contained bundle: verify or create the lock, pull every locked
//! image, pack. `unwrap` is the
//! inverse: unpack, optionally verify, optionally relocate, push.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::ImagesLock;
use chartwrap_core::{EventEmitter, WrapConfig};
use tokio_util::sync::CancellationToken;

use crate::bundle;
use crate::chart::Chart;
use crate::lock::create_lock_file;
use crate::oci::{ImageReference, Registry};
use crate::transfer::TransferEngine;
use crate::verify::verify_lock;

/// Suffix of bundles produced by [`wrap_chart`].
pub const WRAP_EXTENSION: &str = "wrap.tgz";

/// Scheme marking a chart stored in an OCI registry.
pub const OCI_SCHEME: &str = "oci://";

/// Everything a workflow needs, built once per command.
#[derive(Clone)]
pub struct Workflow {
    pub config: WrapConfig,
    pub registry: Arc<dyn Registry>,
    pub cancel: CancellationToken,
    pub events: EventEmitter,
    /// Scratch directory for downloaded and unpacked inputs
    pub work_dir: PathBuf,
}

impl Workflow {
    pub fn transfer_engine(&self) -> TransferEngine {
        TransferEngine::new(
            self.registry.clone(),
            self.config.transfer.clone(),
            self.cancel.clone(),
            self.events.clone(),
        )
    }
}

/// Options of [`wrap_chart`].
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    /// Bundle to write
    pub output: Option<PathBuf>,
    /// Chart version to fetch for an `oci://` input
    pub version: Option<String>,
}

/// Options of [`unwrap_chart`].
#[derive(Debug, Clone, Default)]
pub struct UnwrapOptions {
    /// Registry prefix (`host[:port][/namespace]`) to push the images to
    pub registry: Option<String>,
    /// Verify the bundled lock before pushing
    pub verify: bool,
}

/// Wrap the chart at `input` (directory, bundle or `oci://` reference) into
/// a bundle.
///
/// Without an output path, the bundle is written next to `input` as
/// `<name>-<version>.wrap.tgz`, or into the current directory for a remote
/// chart. Returns the bundle path.
pub async fn wrap_chart(input: &Path, options: &WrapOptions, workflow: &Workflow) -> Result<PathBuf> {
    let remote = remote_reference(input);
    let chart_root = if let Some(reference) = remote {
        let archive = fetch_chart(reference, options.version.as_deref(), workflow).await?;
        bundle::unpack(&archive, &workflow.work_dir.join("wrap"))?
    } else if bundle::is_bundle(input)? {
        tracing::info!(input = %input.display(), "Uncompressing chart bundle");
        bundle::unpack(input, &workflow.work_dir.join("wrap"))?
    } else {
        input.to_path_buf()
    };
    let chart = Chart::load(&chart_root)?;
    let lock_file = chart.lock_file();
    let registry = workflow.registry.as_ref();

    if lock_file.is_file() {
        verify_lock(&chart, &lock_file, registry, &workflow.config.lock).await?;
        tracing::info!(chart = %chart.name(), "Images.lock is valid");
    } else {
        tracing::info!(chart = %chart.name(), "Images.lock does not exist, generating it");
        create_lock_file(&chart, registry, &workflow.config.lock, &lock_file).await?;
    }

    let lock = ImagesLock::from_file(&lock_file)?;
    workflow
        .transfer_engine()
        .pull_images(&lock, &chart.images_dir())
        .await?;

    let output = match (&options.output, remote) {
        (Some(path), _) => path.clone(),
        (None, Some(_)) => PathBuf::from(bundle_name(&chart)),
        (None, None) => default_output(input, &chart),
    };
    bundle::pack(chart.root_dir(), &output)?;
    tracing::info!(chart = %chart.name(), output = %output.display(), "Chart wrapped");
    Ok(output)
}

/// Unwrap `bundle_path` into `dest_dir` and push its images.
///
/// Returns the unpacked chart root.
pub async fn unwrap_chart(
    bundle_path: &Path,
    dest_dir: &Path,
    options: &UnwrapOptions,
    workflow: &Workflow,
) -> Result<PathBuf> {
    if !bundle::is_bundle(bundle_path)? {
        return Err(WrapError::PackageFormatError(format!(
            "{} is not a chart bundle",
            bundle_path.display()
        )));
    }
    let chart_root = bundle::unpack(bundle_path, dest_dir)?;
    let chart = Chart::load(&chart_root)?;
    let lock_file = chart.lock_file();

    if options.verify {
        verify_lock(&chart, &lock_file, workflow.registry.as_ref(), &workflow.config.lock).await?;
    }

    let mut lock = ImagesLock::from_file(&lock_file)?;
    if let Some(ref prefix) = options.registry {
        lock = relocate_lock(&lock, prefix)?;
        lock.to_file(&lock_file)?;
        tracing::info!(prefix = %prefix, "Relocated Images.lock");
    }

    workflow
        .transfer_engine()
        .push_images(&lock, &chart.images_dir())
        .await?;
    tracing::info!(chart = %chart.name(), "Chart unwrapped");
    Ok(chart_root)
}

/// A copy of `lock` whose images all live under `prefix`.
///
/// Each image keeps its repository basename and tag; digests are unchanged.
pub fn relocate_lock(lock: &ImagesLock, prefix: &str) -> Result<ImagesLock> {
    let mut relocated = lock.clone();
    for image in &mut relocated.images {
        let reference = ImageReference::parse(&image.image)?.relocate(prefix)?;
        tracing::debug!(from = %image.image, to = %reference, "Relocating image");
        image.image = reference.full_reference();
    }
    Ok(relocated)
}

/// Chart reference of an `oci://` input.
fn remote_reference(input: &Path) -> Option<&str> {
    input.to_str()?.strip_prefix(OCI_SCHEME)
}

/// Download the chart at `reference` into the work directory.
///
/// `version` selects the tag; without it the reference must carry one.
async fn fetch_chart(reference: &str, version: Option<&str>, workflow: &Workflow) -> Result<PathBuf> {
    let mut parsed = ImageReference::parse(reference)?;
    if parsed.digest.is_some() {
        return Err(WrapError::ConfigError(format!(
            "Chart reference {}{} must name a version, not a digest",
            OCI_SCHEME, reference
        )));
    }
    // `parse` falls back to `latest`, which never names a chart release.
    let tagged = reference
        .rsplit('/')
        .next()
        .is_some_and(|last| last.contains(':'));
    match (version, tagged) {
        (Some(version), true) if parsed.tag.as_deref() != Some(version) => {
            tracing::warn!(reference = %reference, version = %version, "Version overrides the reference tag");
            parsed.tag = Some(version.to_string());
        }
        (Some(version), _) => parsed.tag = Some(version.to_string()),
        (None, true) => {}
        (None, false) => {
            return Err(WrapError::ConfigError(format!(
                "A chart version is required to wrap {}{}",
                OCI_SCHEME, reference
            )))
        }
    }

    tracing::info!(reference = %parsed, "Downloading remote chart");
    let data = workflow.registry.pull_chart(&parsed.full_reference()).await?;

    let name = parsed
        .repository
        .rsplit('/')
        .next()
        .unwrap_or(&parsed.repository);
    let dir = workflow.work_dir.join("remote");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "{}-{}.tgz",
        name,
        parsed.tag.as_deref().unwrap_or_default()
    ));
    std::fs::write(&path, data)?;
    tracing::debug!(path = %path.display(), "Remote chart downloaded");
    Ok(path)
}

fn bundle_name(chart: &Chart) -> String {
    format!("{}-{}.{}", chart.name(), chart.version(), WRAP_EXTENSION)
}

fn default_output(input: &Path, chart: &Chart) -> PathBuf {
    let file_name = bundle_name(chart);
    match input.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(file_name),
        _ => PathBuf::from(file_name),
    }
}
