//! Helm chart loading and declared-image extraction.
//!
//! Images are declared in a `Chart.yaml` annotation, by default `images`,
//! holding a YAML list of `{name, image}` entries:
//!
//! ```yaml
//! annotations:
//!   images: |
//!     - name: wordpress
//!       image: docker.io/bitnami/wordpress:6.5.2
//! ```
//!
//! Sub-charts under `charts/` are visited after their parent, in entry-name
//! order. Both unpacked directories and packed `<name>-<version>.tgz`
//! dependencies count; packed ones are read in memory, nested sub-charts
//! included.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chartwrap_core::error::{Result, WrapError};
use chartwrap_core::imagelock::DEFAULT_IMAGES_LOCK_FILE_NAME;
use flate2::read::GzDecoder;
use serde::Deserialize;

/// Chart metadata file name.
pub const CHART_FILE: &str = "Chart.yaml";

/// Directory holding sub-charts.
const SUBCHARTS_DIR: &str = "charts";

/// Extension of packed sub-charts.
const PACKED_EXTENSION: &str = "tgz";

/// Directory inside a chart root holding cached image archives.
pub const IMAGES_DIR: &str = "images";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMetadata {
    name: String,
    version: serde_yaml::Value,
    #[serde(default)]
    app_version: Option<serde_yaml::Value>,
    #[serde(default)]
    annotations: BTreeMap<String, serde_yaml::Value>,
}

impl ChartMetadata {
    fn parse(content: &[u8], origin: &str) -> Result<Self> {
        let metadata: ChartMetadata = serde_yaml::from_slice(content)
            .map_err(|e| WrapError::ChartError(format!("Invalid {}: {}", origin, e)))?;
        if metadata.name.trim().is_empty() {
            return Err(WrapError::ChartError(format!("{} has an empty name", origin)));
        }
        Ok(metadata)
    }

    /// Images listed under `annotations_key`, in declaration order.
    fn images(&self, annotations_key: &str) -> Result<Vec<DeclaredImage>> {
        let value = match self.annotations.get(annotations_key) {
            Some(value) => value,
            None => return Ok(Vec::new()),
        };

        // Helm annotations are strings; a literal list is accepted too.
        let entries: Vec<AnnotationEntry> = match value {
            serde_yaml::Value::String(text) => serde_yaml::from_str(text),
            other => serde_yaml::from_value(other.clone()),
        }
        .map_err(|e| {
            WrapError::ChartError(format!(
                "Chart '{}': invalid '{}' annotation: {}",
                self.name, annotations_key, e
            ))
        })?;

        let mut seen = HashSet::new();
        let mut images = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.name.unwrap_or_default().trim().to_string();
            let image = entry.image.unwrap_or_default().trim().to_string();
            if name.is_empty() || image.is_empty() {
                return Err(WrapError::ChartError(format!(
                    "Chart '{}': every image entry needs a name and an image",
                    self.name
                )));
            }
            if image.contains('@') {
                return Err(WrapError::ChartError(format!(
                    "Chart '{}': image '{}' must not carry a digest",
                    self.name, image
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(WrapError::ChartError(format!(
                    "Chart '{}': duplicate image name '{}'",
                    self.name, name
                )));
            }
            images.push(DeclaredImage {
                name,
                image,
                chart: self.name.clone(),
            });
        }
        Ok(images)
    }
}

/// One image reference declared by a chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredImage {
    /// Logical name of the image within the chart
    pub name: String,
    /// Registry reference, without a digest
    pub image: String,
    /// Name of the (sub-)chart declaring it
    pub chart: String,
}

#[derive(Debug, Deserialize)]
struct AnnotationEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

/// A chart loaded from an unpacked directory.
#[derive(Debug, Clone)]
pub struct Chart {
    root: PathBuf,
    metadata: ChartMetadata,
}

impl Chart {
    /// Load a chart from its root directory or from its `Chart.yaml`.
    pub fn load(path: &Path) -> Result<Self> {
        let root = if path.is_file() {
            path.parent().map(Path::to_path_buf).ok_or_else(|| {
                WrapError::ChartError(format!("Cannot resolve chart root of {}", path.display()))
            })?
        } else {
            path.to_path_buf()
        };

        let chart_file = root.join(CHART_FILE);
        let content = std::fs::read(&chart_file).map_err(|e| {
            WrapError::ChartError(format!("Failed to read {}: {}", chart_file.display(), e))
        })?;
        let metadata = ChartMetadata::parse(&content, &chart_file.display().to_string())?;

        tracing::debug!(root = %root.display(), name = %metadata.name, "Loaded chart");
        Ok(Self { root, metadata })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Chart version as a string, whatever its YAML scalar type.
    pub fn version(&self) -> String {
        scalar_to_string(&self.metadata.version)
    }

    pub fn app_version(&self) -> Option<String> {
        self.metadata
            .app_version
            .as_ref()
            .map(scalar_to_string)
            .filter(|v| !v.is_empty())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Local image cache directory.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Default lock file location.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(DEFAULT_IMAGES_LOCK_FILE_NAME)
    }

    /// Images declared under `annotations_key`, parent chart first, then
    /// every sub-chart, packed or not.
    pub fn declared_images(&self, annotations_key: &str) -> Result<Vec<DeclaredImage>> {
        let mut images = self.metadata.images(annotations_key)?;
        for subchart in self.subcharts()? {
            images.extend(subchart.declared_images(annotations_key)?);
        }
        Ok(images)
    }

    /// Sub-charts under `charts/`, sorted by entry name.
    fn subcharts(&self) -> Result<Vec<SubChart>> {
        let dir = self.root.join(SUBCHARTS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            paths.push(entry?.path());
        }
        paths.sort();

        let mut subcharts = Vec::new();
        for path in paths {
            if path.join(CHART_FILE).is_file() {
                subcharts.push(SubChart::Dir(Chart::load(&path)?));
            } else if path.is_file() && is_packed(&path.to_string_lossy()) {
                subcharts.push(SubChart::Packed(PackedChart::read(&path)?));
            } else {
                tracing::debug!(path = %path.display(), "Skipping non-chart entry");
            }
        }
        Ok(subcharts)
    }
}

/// A dependency found under a chart's `charts/` directory.
enum SubChart {
    Dir(Chart),
    Packed(PackedChart),
}

impl SubChart {
    fn declared_images(&self, annotations_key: &str) -> Result<Vec<DeclaredImage>> {
        match self {
            SubChart::Dir(chart) => chart.declared_images(annotations_key),
            SubChart::Packed(chart) => chart.declared_images(annotations_key),
        }
    }
}

/// A chart held in memory, keyed by `/`-separated paths relative to its root.
#[derive(Debug)]
struct PackedChart {
    origin: String,
    metadata: ChartMetadata,
    files: BTreeMap<String, Vec<u8>>,
}

impl PackedChart {
    /// Read a packed chart from disk.
    fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_archive(&data, &path.display().to_string())
    }

    /// Parse a gzip-compressed chart archive with a single top-level directory.
    fn from_archive(data: &[u8], origin: &str) -> Result<Self> {
        let broken = |e: std::io::Error| {
            WrapError::ChartError(format!("Unreadable packed chart {}: {}", origin, e))
        };

        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut tops = BTreeSet::new();
        let mut files = BTreeMap::new();
        for entry in archive.entries().map_err(broken)? {
            let mut entry = entry.map_err(broken)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(broken)?.into_owned();
            let mut parts = path.components().filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            });
            let Some(top) = parts.next() else {
                continue;
            };
            let relative: Vec<String> = parts.collect();
            if relative.is_empty() {
                continue;
            }
            tops.insert(top);

            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(broken)?;
            files.insert(relative.join("/"), content);
        }

        if tops.len() != 1 {
            return Err(WrapError::ChartError(format!(
                "Packed chart {} must hold exactly one top-level directory, found {}",
                origin,
                tops.len()
            )));
        }
        Self::from_files(origin.to_string(), files)
    }

    fn from_files(origin: String, files: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let content = files.get(CHART_FILE).ok_or_else(|| {
            WrapError::ChartError(format!("Packed chart {} has no {}", origin, CHART_FILE))
        })?;
        let metadata = ChartMetadata::parse(content, &format!("{} ({})", origin, CHART_FILE))?;
        tracing::debug!(origin = %origin, name = %metadata.name, "Loaded packed chart");
        Ok(Self {
            origin,
            metadata,
            files,
        })
    }

    fn declared_images(&self, annotations_key: &str) -> Result<Vec<DeclaredImage>> {
        let mut images = self.metadata.images(annotations_key)?;
        for subchart in self.subcharts()? {
            images.extend(subchart.declared_images(annotations_key)?);
        }
        Ok(images)
    }

    /// Nested sub-charts, packed or unpacked, sorted by entry name.
    fn subcharts(&self) -> Result<Vec<PackedChart>> {
        let prefix = format!("{}/", SUBCHARTS_DIR);
        let mut entries = BTreeSet::new();
        for path in self.files.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, CHART_FILE)) => {
                    entries.insert(dir.to_string());
                }
                None if is_packed(rest) => {
                    entries.insert(rest.to_string());
                }
                _ => {}
            }
        }

        let mut subcharts = Vec::with_capacity(entries.len());
        for entry in entries {
            let origin = format!("{}:{}{}", self.origin, prefix, entry);
            let key = format!("{}{}", prefix, entry);
            let subchart = match self.files.get(&key) {
                Some(data) => PackedChart::from_archive(data, &origin)?,
                None => {
                    let dir = format!("{}/", key);
                    let files = self
                        .files
                        .iter()
                        .filter_map(|(path, data)| {
                            path.strip_prefix(&dir)
                                .map(|relative| (relative.to_string(), data.clone()))
                        })
                        .collect();
                    PackedChart::from_files(origin, files)?
                }
            };
            subcharts.push(subchart);
        }
        Ok(subcharts)
    }
}

fn is_packed(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == PACKED_EXTENSION)
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
