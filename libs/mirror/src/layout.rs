//! On-disk OCI image layout with a tag-to-digest side index.
//!
//! The layout directory holds `oci-layout`, `index.json` and content-addressed
//! blobs under `blobs/<alg>/<hex>`. Every index descriptor carries the full
//! tag reference (`org.opencontainers.image.ref.name`) and the short tag
//! (`io.deckhouse.image.short_tag`). Those annotations are the only persisted
//! metadata: opening a layout rebuilds the tag lookup from them.
//!
//! Reference: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::image::{Image, ImageError};
use crate::meta::{short_tag, validate_tag, Digest, ImageMeta, ImageReference, ReferenceError};
use crate::oci::{
    Descriptor, ImageIndex, LayoutMarker, ANNOTATION_REF_NAME, ANNOTATION_SHORT_TAG, LAYOUT_FILE,
};

const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";

/// Errors from layout operations.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("image meta not found for tag {tag}")]
    ImageMetaNotFound { tag: String },

    #[error("image {digest} not found in layout")]
    ImageNotFound { digest: Digest },

    #[error("get image tag reference: image has no metadata attached")]
    MissingImageMeta,

    #[error("{} is not an OCI image layout", .path.display())]
    NotALayout { path: PathBuf },

    #[error("descriptor for {0} has no org.opencontainers.image.ref.name annotation")]
    MissingRefName(Digest),

    #[error("blob {digest} is corrupted: content hashes to {actual}")]
    Corrupted { digest: Digest, actual: Digest },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    InvalidTag(#[from] ReferenceError),
}

/// A single OCI image layout directory.
pub struct ImageLayout {
    path: PathBuf,
    /// Tag lookup. The lock also serialises index read-modify-write cycles.
    meta_by_tag: Mutex<HashMap<String, ImageMeta>>,
}

impl ImageLayout {
    /// Open the layout at `path`, initialising an empty one if needed.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, LayoutError> {
        let path = path.into();
        fs::create_dir_all(path.join(BLOBS_DIR))?;

        let marker = path.join(LAYOUT_FILE);
        if !marker.exists() {
            write_atomic(&marker, &serde_json::to_vec(&LayoutMarker::default())?)?;
        }
        let index = path.join(INDEX_FILE);
        if !index.exists() {
            write_atomic(&index, &serde_json::to_vec_pretty(&ImageIndex::default())?)?;
            info!(path = %path.display(), "Initialised image layout");
        }

        Self::open(path).await
    }

    /// Open an existing layout, rebuilding the tag lookup from its index.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LayoutError> {
        let path = path.into();
        if !path.join(LAYOUT_FILE).is_file() {
            return Err(LayoutError::NotALayout { path });
        }

        let layout = Self {
            path,
            meta_by_tag: Mutex::new(HashMap::new()),
        };

        let index = layout.read_index()?;
        let metas = metas_from_index(&index);
        debug!(
            path = %layout.path.display(),
            manifests = index.manifests.len(),
            tags = metas.len(),
            "Opened image layout"
        );
        *layout.meta_by_tag.lock().await = metas;

        Ok(layout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write an image into the layout and index it under `tag`.
    ///
    /// The image must carry its [`ImageMeta`]. Re-adding the same image under
    /// the same reference leaves the index unchanged.
    pub async fn add_image(&self, image: &Image, tag: &str) -> Result<(), LayoutError> {
        let meta = image.meta().ok_or(LayoutError::MissingImageMeta)?;
        validate_tag(tag)?;
        let mut metas = self.meta_by_tag.lock().await;

        for (digest, blob) in image.blobs() {
            self.write_blob(digest, blob)?;
        }
        self.write_blob(image.digest(), image.manifest_bytes())?;

        let mut descriptor = Descriptor {
            media_type: image.media_type().to_string(),
            digest: image.digest().clone(),
            size: image.manifest_bytes().len() as u64,
            annotations: None,
        };
        descriptor.set_annotation(ANNOTATION_REF_NAME, meta.tag_reference.as_str());
        descriptor.set_annotation(ANNOTATION_SHORT_TAG, short_tag(&meta.tag_reference, tag));

        self.append_descriptor(descriptor)?;
        metas.insert(tag.to_string(), meta.clone());

        debug!(tag, digest = %image.digest(), "Added image to layout");
        Ok(())
    }

    /// Load the image filed under `tag`, verifying every blob read from disk.
    pub async fn get_image(&self, tag: &str) -> Result<Image, LayoutError> {
        let meta = self.get_meta(tag).await?;

        let index = self.read_index()?;
        if !index.manifests.iter().any(|d| d.digest == meta.digest) {
            return Err(LayoutError::ImageNotFound {
                digest: meta.digest,
            });
        }

        let manifest_bytes = self.read_blob(&meta.digest)?;
        let (manifest, _) = crate::image::parse_manifest(&manifest_bytes)?;
        let blobs = manifest
            .blobs()
            .map(|desc| self.read_blob(&desc.digest).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Image::from_parts(manifest_bytes.into(), blobs)?.with_meta(meta))
    }

    /// Point `new_tag` at the manifest with `digest`.
    ///
    /// The first matching descriptor is copied with its reference retagged and
    /// appended; the original stays. `new_tag` must be a valid OCI tag so the
    /// binding survives a reopen.
    pub async fn tag_image(&self, digest: &Digest, new_tag: &str) -> Result<(), LayoutError> {
        validate_tag(new_tag)?;
        let mut metas = self.meta_by_tag.lock().await;

        let index = self.read_index()?;
        let mut descriptor = index
            .manifests
            .iter()
            .find(|d| &d.digest == digest)
            .cloned()
            .ok_or_else(|| LayoutError::ImageNotFound {
                digest: digest.clone(),
            })?;

        let reference = descriptor
            .annotation(ANNOTATION_REF_NAME)
            .and_then(|r| ImageReference::parse(r).ok())
            .ok_or_else(|| LayoutError::MissingRefName(digest.clone()))?;
        let tag_reference = reference.with_tag(new_tag);

        descriptor.set_annotation(ANNOTATION_REF_NAME, tag_reference.as_str());
        descriptor.set_annotation(ANNOTATION_SHORT_TAG, short_tag(&tag_reference, new_tag));

        self.append_descriptor(descriptor)?;
        metas.insert(
            new_tag.to_string(),
            ImageMeta::new(new_tag, tag_reference, digest.clone()),
        );

        info!(digest = %digest, tag = new_tag, "Retagged image");
        Ok(())
    }

    pub async fn get_meta(&self, tag: &str) -> Result<ImageMeta, LayoutError> {
        self.meta_by_tag
            .lock()
            .await
            .get(tag)
            .cloned()
            .ok_or_else(|| LayoutError::ImageMetaNotFound {
                tag: tag.to_string(),
            })
    }

    /// Every known tag binding, ordered by tag.
    pub async fn images(&self) -> Vec<ImageMeta> {
        let mut metas: Vec<_> = self.meta_by_tag.lock().await.values().cloned().collect();
        metas.sort_by(|a, b| a.tag.cmp(&b.tag));
        metas
    }

    /// Index descriptors as stored.
    pub async fn manifests(&self) -> Result<Vec<Descriptor>, LayoutError> {
        let _guard = self.meta_by_tag.lock().await;
        Ok(self.read_index()?.manifests)
    }

    /// Order index descriptors by short tag, then by reference.
    pub async fn sort_index_manifests(&self) -> Result<(), LayoutError> {
        let _guard = self.meta_by_tag.lock().await;

        let mut index = self.read_index()?;
        index.manifests.sort_by(|a, b| {
            let key = |d: &Descriptor| {
                (
                    d.annotation(ANNOTATION_SHORT_TAG).unwrap_or_default().to_string(),
                    d.annotation(ANNOTATION_REF_NAME).unwrap_or_default().to_string(),
                )
            };
            key(a).cmp(&key(b))
        });
        self.write_index(&index)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.path
            .join(BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    fn write_blob(&self, digest: &Digest, content: &[u8]) -> Result<(), LayoutError> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, content)?;
        Ok(())
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, LayoutError> {
        let content = fs::read(self.blob_path(digest)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LayoutError::ImageNotFound {
                digest: digest.clone(),
            },
            _ => LayoutError::Io(e),
        })?;

        let actual = Digest::sha256_of(&content);
        if &actual != digest {
            return Err(LayoutError::Corrupted {
                digest: digest.clone(),
                actual,
            });
        }
        Ok(content)
    }

    fn read_index(&self) -> Result<ImageIndex, LayoutError> {
        let raw = fs::read(self.path.join(INDEX_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_index(&self, index: &ImageIndex) -> Result<(), LayoutError> {
        write_atomic(&self.path.join(INDEX_FILE), &serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }

    /// Append a descriptor, replacing any other one with the same reference.
    fn append_descriptor(&self, descriptor: Descriptor) -> Result<(), LayoutError> {
        let mut index = self.read_index()?;
        let ref_name = descriptor.annotation(ANNOTATION_REF_NAME).map(str::to_string);
        if ref_name.is_some() {
            index
                .manifests
                .retain(|d| d.annotation(ANNOTATION_REF_NAME) != ref_name.as_deref());
        }
        index.manifests.push(descriptor);
        self.write_index(&index)
    }
}

/// Rebuild the tag lookup from index annotations; later descriptors win.
fn metas_from_index(index: &ImageIndex) -> HashMap<String, ImageMeta> {
    let mut metas = HashMap::new();
    for desc in &index.manifests {
        let Some(ref_name) = desc.annotation(ANNOTATION_REF_NAME) else {
            continue;
        };
        match ImageReference::parse(ref_name) {
            Ok(reference) => {
                let tag = reference.tag_for_meta();
                metas.insert(
                    tag.clone(),
                    ImageMeta::new(tag, ref_name, desc.digest.clone()),
                );
            }
            Err(e) => debug!(ref_name, error = %e, "Skipping unparseable reference"),
        }
    }
    metas
}

/// Write via a sibling temp file and rename into place.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::oci::{Manifest, MEDIA_TYPE_OCI_MANIFEST};

    fn image(layer: &'static [u8], tag_reference: &str, tag: &str) -> Image {
        let config: &'static [u8] = b"{\"architecture\":\"amd64\"}";
        let descriptor = |blob: &[u8]| Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest: Digest::sha256_of(blob),
            size: blob.len() as u64,
            annotations: None,
        };
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: descriptor(config),
            layers: vec![descriptor(layer)],
            annotations: None,
        };
        let raw = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let image = Image::from_parts(raw, [Bytes::from_static(config), Bytes::from_static(layer)])
            .unwrap();
        let meta = ImageMeta::new(tag, tag_reference, image.digest().clone());
        image.with_meta(meta)
    }

    #[tokio::test]
    async fn test_create_writes_layout_files() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path().join("installer")).await.unwrap();

        let marker = fs::read_to_string(layout.path().join(LAYOUT_FILE)).unwrap();
        assert_eq!(marker, r#"{"imageLayoutVersion":"1.0.0"}"#);
        assert!(layout.manifests().await.unwrap().is_empty());
        assert!(layout.path().join(BLOBS_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_open_requires_marker() {
        let dir = TempDir::new().unwrap();
        let err = ImageLayout::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, LayoutError::NotALayout { .. }));
    }

    #[tokio::test]
    async fn test_add_and_get_image() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();
        let img = image(b"layer-1", "reg.io/repo:v1", "v1");

        layout.add_image(&img, "v1").await.unwrap();

        let blob = layout.blob_path(img.digest());
        assert!(blob.ends_with(format!("blobs/sha256/{}", img.digest().encoded())));
        assert!(blob.is_file());

        let loaded = layout.get_image("v1").await.unwrap();
        assert_eq!(loaded.digest(), img.digest());
        assert_eq!(loaded.meta(), img.meta());

        let manifests = layout.manifests().await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].annotation(ANNOTATION_REF_NAME), Some("reg.io/repo:v1"));
        assert_eq!(manifests[0].annotation(ANNOTATION_SHORT_TAG), Some("v1"));
    }

    #[tokio::test]
    async fn test_add_image_requires_meta() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();
        let img = image(b"layer-1", "reg.io/repo:v1", "v1");
        let bare = Image::from_parts(img.manifest_bytes().clone(), img.blobs().map(|(_, b)| b.clone()))
            .unwrap();

        let err = layout.add_image(&bare, "v1").await.unwrap_err();
        assert!(matches!(err, LayoutError::MissingImageMeta));
        assert!(layout.manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_tag() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();

        assert!(matches!(
            layout.get_image("nope").await,
            Err(LayoutError::ImageMetaNotFound { tag }) if tag == "nope"
        ));
        assert!(matches!(
            layout.get_meta("nope").await,
            Err(LayoutError::ImageMetaNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_blob_detected() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();
        let img = image(b"layer-1", "reg.io/repo:v1", "v1");
        layout.add_image(&img, "v1").await.unwrap();

        let layer = Digest::sha256_of(b"layer-1");
        fs::write(layout.blob_path(&layer), b"tampered").unwrap();

        assert!(matches!(
            layout.get_image("v1").await,
            Err(LayoutError::Corrupted { digest, .. }) if digest == layer
        ));
    }

    #[tokio::test]
    async fn test_moved_tag_replaces_descriptor() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();
        let old = image(b"old", "reg.io/repo:stable", "stable");
        let new = image(b"new", "reg.io/repo:stable", "stable");

        layout.add_image(&old, "stable").await.unwrap();
        layout.add_image(&new, "stable").await.unwrap();

        let manifests = layout.manifests().await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(&manifests[0].digest, new.digest());
        assert_eq!(&layout.get_meta("stable").await.unwrap().digest, new.digest());
    }

    #[tokio::test]
    async fn test_sort_index_manifests() {
        let dir = TempDir::new().unwrap();
        let layout = ImageLayout::create(dir.path()).await.unwrap();
        let entries: [(&'static [u8], &str); 3] = [(b"c", "v3"), (b"a", "v1"), (b"b", "v2")];
        for (layer, tag) in entries {
            let img = image(layer, &format!("reg.io/repo:{tag}"), tag);
            layout.add_image(&img, tag).await.unwrap();
        }

        layout.sort_index_manifests().await.unwrap();

        let tags: Vec<_> = layout
            .manifests()
            .await
            .unwrap()
            .iter()
            .map(|d| d.annotation(ANNOTATION_SHORT_TAG).unwrap_or_default().to_string())
            .collect();
        assert_eq!(tags, vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn test_metas_from_index() {
        let digest = Digest::sha256_of(b"m");
        let mut tagged = Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: digest.clone(),
            size: 1,
            annotations: None,
        };
        tagged.set_annotation(ANNOTATION_REF_NAME, "reg.io/repo:v1");
        let mut pinned = tagged.clone();
        pinned.set_annotation(ANNOTATION_REF_NAME, format!("reg.io/repo@{digest}"));
        let mut unannotated = tagged.clone();
        unannotated.annotations = None;

        let index = ImageIndex {
            manifests: vec![tagged, pinned, unannotated],
            ..Default::default()
        };
        let metas = metas_from_index(&index);

        assert_eq!(metas.len(), 2);
        assert_eq!(metas["v1"], ImageMeta::new("v1", "reg.io/repo:v1", digest.clone()));
        assert_eq!(metas[digest.encoded()].tag_reference, format!("reg.io/repo@{digest}"));
    }
}
