//! Image groups to mirror, enumerated before any digest is resolved.

use std::collections::BTreeMap;

use crate::meta::{validate_tag, ImageMeta, ReferenceError};

/// Full image reference to its resolved binding; `None` until resolved, or
/// when resolution was skipped under the allow-missing policy.
pub type ImageSet = BTreeMap<String, Option<ImageMeta>>;

/// A vulnerability database published alongside the platform images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityDatabase {
    pub name: &'static str,
    pub tag: &'static str,
}

/// Security databases mirrored by default. Tags are versioned per database
/// and must match what the registry serves.
pub const SECURITY_DATABASES: [SecurityDatabase; 4] = [
    SecurityDatabase {
        name: "trivy-db",
        tag: "2",
    },
    SecurityDatabase {
        name: "trivy-bdu",
        tag: "1",
    },
    SecurityDatabase {
        name: "trivy-java-db",
        tag: "1",
    },
    SecurityDatabase {
        name: "trivy-checks",
        tag: "0",
    },
];

/// References to pull for one image group under a registry root.
#[derive(Debug, Clone)]
pub struct ImageDownloadList {
    root_url: String,
    images: ImageSet,
}

impl ImageDownloadList {
    /// `root_url` is `host/root`, e.g. `registry.deckhouse.io/deckhouse/ee`.
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into().trim_end_matches('/').to_string(),
            images: ImageSet::new(),
        }
    }

    /// Add `<root>/installer:<tag>` for every tag.
    ///
    /// Nothing is added unless every tag is valid.
    pub fn fill_installer<I, S>(&mut self, tags: I) -> Result<(), ReferenceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: Vec<S> = tags.into_iter().collect();
        for tag in &tags {
            validate_tag(tag.as_ref())?;
        }
        for tag in tags {
            self.images
                .entry(format!("{}/installer:{}", self.root_url, tag.as_ref()))
                .or_insert(None);
        }
        Ok(())
    }

    /// Add `<root>/security/<name>:<tag>`.
    pub fn fill_security_database(&mut self, database: &SecurityDatabase) {
        self.images
            .entry(format!(
                "{}/security/{}:{}",
                self.root_url, database.name, database.tag
            ))
            .or_insert(None);
    }

    pub fn images(&self) -> &ImageSet {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageSet {
        &mut self.images
    }
}
