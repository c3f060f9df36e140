//! Per-repository access to a source registry.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::image::{parse_manifest, Image};
use crate::meta::Digest;
use crate::registry::{RegistryClient, RegistryError};

/// Read access to one repository of a source registry.
///
/// Every pull in a mirroring run goes through this seam, so tests can swap
/// the registry for an in-memory stub.
#[async_trait]
pub trait GetterService: Send + Sync {
    /// Resolve a tag to the digest of its manifest.
    async fn get_digest(&self, tag: &str) -> Result<Digest, RegistryError>;

    /// Fetch a complete image. `reference` is `@sha256:...`, `:tag` or a bare
    /// tag; the pipeline only ever passes the digest form.
    async fn get_image(&self, reference: &str) -> Result<Image, RegistryError>;
}

/// [`GetterService`] backed by a [`RegistryClient`].
#[derive(Clone)]
pub struct RegistryGetter {
    client: Arc<RegistryClient>,
    repository: String,
}

impl RegistryGetter {
    pub fn new(client: Arc<RegistryClient>, repository: impl Into<String>) -> Self {
        Self {
            client,
            repository: repository.into(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }
}

fn strip_reference(reference: &str) -> &str {
    reference
        .strip_prefix('@')
        .or_else(|| reference.strip_prefix(':'))
        .unwrap_or(reference)
}

#[async_trait]
impl GetterService for RegistryGetter {
    async fn get_digest(&self, tag: &str) -> Result<Digest, RegistryError> {
        self.client
            .manifest_digest(&self.repository, strip_reference(tag))
            .await
    }

    async fn get_image(&self, reference: &str) -> Result<Image, RegistryError> {
        let reference = strip_reference(reference);
        let (manifest_bytes, digest) = self.client.pull_manifest(&self.repository, reference).await?;
        let (manifest, _) = parse_manifest(&manifest_bytes)?;

        debug!(
            repository = %self.repository,
            digest = %digest,
            layers = manifest.layers.len(),
            size = manifest.total_layer_size(),
            "Fetching image blobs"
        );

        let mut seen = HashSet::new();
        let mut blobs = Vec::new();
        for desc in manifest.blobs() {
            if seen.insert(desc.digest.clone()) {
                blobs.push(self.client.pull_blob(&self.repository, &desc.digest).await?);
            }
        }

        Ok(Image::from_parts(manifest_bytes, blobs)?)
    }
}
