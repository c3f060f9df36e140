//! In-memory image: a manifest plus the blobs it references.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;

use crate::meta::{Digest, ImageMeta};
use crate::oci::{is_index_media_type, Manifest, MEDIA_TYPE_OCI_MANIFEST};

/// Errors from assembling an image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported manifest media type {0}")]
    UnsupportedMediaType(String),

    #[error("blob {0} referenced by the manifest is missing")]
    MissingBlob(Digest),

    #[error("blob {digest} has size {actual}, manifest says {expected}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeProbe {
    media_type: Option<String>,
}

/// Parse a single-platform manifest, returning it with its effective media type.
///
/// Indexes are rejected before the full parse so the error names the media
/// type rather than a missing `config` field.
pub fn parse_manifest(raw: &[u8]) -> Result<(Manifest, String), ImageError> {
    let probe: MediaTypeProbe = serde_json::from_slice(raw)?;
    let media_type = probe
        .media_type
        .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
    if is_index_media_type(&media_type) {
        return Err(ImageError::UnsupportedMediaType(media_type));
    }
    Ok((serde_json::from_slice(raw)?, media_type))
}

/// A single-platform image held in memory.
#[derive(Debug, Clone)]
pub struct Image {
    manifest_bytes: Bytes,
    manifest: Manifest,
    digest: Digest,
    media_type: String,
    blobs: HashMap<Digest, Bytes>,
    meta: Option<ImageMeta>,
}

impl Image {
    /// Assemble an image from its raw manifest and candidate blobs.
    ///
    /// Blobs are keyed by their computed sha256; every config and layer
    /// descriptor of the manifest must be satisfied. Extra blobs are dropped.
    pub fn from_parts(
        manifest_bytes: Bytes,
        blobs: impl IntoIterator<Item = Bytes>,
    ) -> Result<Self, ImageError> {
        let (manifest, media_type) = parse_manifest(&manifest_bytes)?;

        let mut available: HashMap<Digest, Bytes> = blobs
            .into_iter()
            .map(|blob| (Digest::sha256_of(&blob), blob))
            .collect();

        let mut referenced = HashMap::new();
        for desc in manifest.blobs() {
            let blob = available
                .remove(&desc.digest)
                .or_else(|| referenced.get(&desc.digest).cloned())
                .ok_or_else(|| ImageError::MissingBlob(desc.digest.clone()))?;
            if blob.len() as u64 != desc.size {
                return Err(ImageError::SizeMismatch {
                    digest: desc.digest.clone(),
                    expected: desc.size,
                    actual: blob.len() as u64,
                });
            }
            referenced.insert(desc.digest.clone(), blob);
        }

        Ok(Self {
            digest: Digest::sha256_of(&manifest_bytes),
            manifest_bytes,
            manifest,
            media_type,
            blobs: referenced,
            meta: None,
        })
    }

    /// Attach the tag/digest binding this image was pulled under.
    pub fn with_meta(mut self, meta: ImageMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn meta(&self) -> Option<&ImageMeta> {
        self.meta.as_ref()
    }

    /// Digest of the manifest bytes.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &Bytes {
        &self.manifest_bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn blob(&self, digest: &Digest) -> Option<&Bytes> {
        self.blobs.get(digest)
    }

    /// Config and layer blobs, in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = (&Digest, &Bytes)> {
        self.manifest
            .blobs()
            .filter_map(|desc| self.blobs.get_key_value(&desc.digest))
    }
}
