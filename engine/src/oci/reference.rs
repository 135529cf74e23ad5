//! OCI image reference parsing.
//!
//! Parses chart image references like `bitnami/wordpress:6.5.2` into
//! structured components, pins them to lock digests and relocates them to
//! another registry.

use chartwrap_core::error::{Result, WrapError};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "bitnami/wordpress")
    pub repository: String,
    /// Tag (e.g., "latest", "6.5.2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `bitnami/wordpress` → docker.io/bitnami/wordpress:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(WrapError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(WrapError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = Self::split_tag(name_tag);
        let (registry, repository) = Self::split_registry_repository(name)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split `name[:tag]`, only looking for the colon after the last slash.
    fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
        match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => (
                        &name_tag[..slash_pos + 1 + colon_pos],
                        Some(&after_slash[colon_pos + 1..]),
                    ),
                    None => (name_tag, None),
                }
            }
            None => match name_tag.rfind(':') {
                // `host:5000` without a repository is a port, not a tag
                Some(colon_pos)
                    if !name_tag[colon_pos + 1..]
                        .chars()
                        .all(|c| c.is_ascii_digit()) =>
                {
                    (&name_tag[..colon_pos], Some(&name_tag[colon_pos + 1..]))
                }
                _ => (name_tag, None),
            },
        }
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // Check if the first component looks like a registry hostname
        // (contains a dot or colon, or is "localhost")
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(WrapError::OciImageError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), repo));
            }
        }

        // No registry component, use the default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Reference addressing exactly `digest`, dropping any tag.
    pub fn pinned(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Move the image under `prefix` (`registry[/namespace]`), keeping the
    /// last repository component and the tag.
    ///
    /// `docker.io/bitnami/wordpress:6.5.2` relocated to
    /// `registry.local:5000/mirror` becomes
    /// `registry.local:5000/mirror/wordpress:6.5.2`.
    pub fn relocate(&self, prefix: &str) -> Result<Self> {
        let prefix = prefix.trim().trim_end_matches('/');
        if prefix.is_empty() {
            return Err(WrapError::OciImageError(
                "Empty relocation prefix".to_string(),
            ));
        }
        let basename = self
            .repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository);

        let (registry, namespace) = match prefix.split_once('/') {
            Some((registry, namespace)) => (registry, Some(namespace)),
            None => (prefix, None),
        };
        let repository = match namespace {
            Some(ns) => format!("{}/{}", ns, basename),
            None => basename.to_string(),
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        })
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
