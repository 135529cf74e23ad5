//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chartwrap_core::imagelock::{ChartImage, DigestInfo, ImagesLock};
use chartwrap_core::{EventEmitter, TransferConfig, TransferEvent, WrapConfig};
use chartwrap_engine::oci::manifest::{sha256_digest, OCI_IMAGE_MANIFEST};
use chartwrap_engine::{ImageArchive, MemoryRegistry, TransferEngine, Workflow};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Single-layer linux image for `arch`, tagged with `seed` so two builds of
/// the same platform get different digests.
pub fn image(reference: &str, arch: &str, seed: &str) -> ImageArchive {
    let config = format!(r#"{{"architecture":"{}","os":"linux"}}"#, arch).into_bytes();
    let layer = format!("layer-{}-{}", arch, seed).into_bytes();
    let config_digest = sha256_digest(&config);
    let layer_digest = sha256_digest(&layer);
    let manifest = format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{}","size":{}}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"{}","size":{}}}]}}"#,
        OCI_IMAGE_MANIFEST,
        config_digest,
        config.len(),
        layer_digest,
        layer.len()
    )
    .into_bytes();

    let mut blobs = BTreeMap::new();
    blobs.insert(config_digest, config);
    blobs.insert(layer_digest, layer);
    let digest = sha256_digest(&manifest);
    ImageArchive::new(reference, digest, OCI_IMAGE_MANIFEST, manifest, blobs).unwrap()
}

/// Chart at `root` declaring `images` as `(name, reference)` pairs.
pub fn write_chart(root: &Path, name: &str, images: &[(&str, &str)]) {
    std::fs::create_dir_all(root).unwrap();
    let mut content = format!("apiVersion: v2\nname: {}\nversion: 1.0.0\n", name);
    if !images.is_empty() {
        content.push_str("annotations:\n  images: |\n");
        for (image_name, reference) in images {
            content.push_str(&format!(
                "    - name: {}\n      image: {}\n",
                image_name, reference
            ));
        }
    }
    std::fs::write(root.join("Chart.yaml"), content).unwrap();
    std::fs::write(root.join("values.yaml"), "replicaCount: 1\n").unwrap();
}

/// Lock pinning `archives` under one image per `(name, reference)` group.
pub fn lock_for(chart: &str, images: &[(&str, &str, &[ImageArchive])]) -> ImagesLock {
    let mut lock = ImagesLock::new(chart, "1.0.0", None);
    for (name, reference, archives) in images {
        lock.images.push(ChartImage {
            name: name.to_string(),
            image: reference.to_string(),
            chart: chart.to_string(),
            digests: archives
                .iter()
                .map(|a| DigestInfo {
                    digest: a.manifest_digest.clone(),
                    arch: a.platform().unwrap().to_string(),
                })
                .collect(),
        });
    }
    lock
}

/// Transfer settings that keep retry tests fast.
pub fn fast_transfer(max_retries: u32) -> TransferConfig {
    TransferConfig {
        max_retries,
        retry_backoff_ms: 1,
    }
}

pub fn engine(registry: Arc<MemoryRegistry>, max_retries: u32) -> TransferEngine {
    TransferEngine::new(
        registry,
        fast_transfer(max_retries),
        CancellationToken::new(),
        EventEmitter::default(),
    )
}

pub fn workflow(registry: Arc<MemoryRegistry>, work_dir: &Path) -> Workflow {
    let mut config = WrapConfig::default();
    config.transfer = fast_transfer(3);
    Workflow {
        config,
        registry,
        cancel: CancellationToken::new(),
        events: EventEmitter::default(),
        work_dir: work_dir.to_path_buf(),
    }
}

/// Every event already sent on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
