//! Shared helpers for mirror integration tests.
//!
//! Provides synthetic images, an in-memory `GetterService` that records every
//! call, and helpers to serve images from a wiremock registry.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use d8_mirror::oci::{Descriptor, Manifest, MEDIA_TYPE_OCI_MANIFEST};
use d8_mirror::{
    Digest, GetterService, Image, Progress, PullerService, RegistryError, RetryPolicy,
};

/// Raw parts of a synthetic single-layer image.
pub struct ImageParts {
    pub manifest: Bytes,
    pub config: Bytes,
    pub layer: Bytes,
}

impl ImageParts {
    pub fn digest(&self) -> Digest {
        Digest::sha256_of(&self.manifest)
    }

    pub fn image(&self) -> Image {
        Image::from_parts(
            self.manifest.clone(),
            [self.config.clone(), self.layer.clone()],
        )
        .unwrap()
    }
}

fn descriptor(blob: &[u8], media_type: &str) -> Descriptor {
    Descriptor {
        media_type: media_type.to_string(),
        digest: Digest::sha256_of(blob),
        size: blob.len() as u64,
        annotations: None,
    }
}

/// Build an image whose content (and therefore digest) depends on `seed`.
pub fn synthetic_image(seed: &str) -> ImageParts {
    let config = Bytes::from(format!(r#"{{"architecture":"amd64","seed":"{seed}"}}"#));
    let layer = Bytes::from(format!("layer contents for {seed}"));
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        config: descriptor(&config, "application/vnd.oci.image.config.v1+json"),
        layers: vec![descriptor(&layer, "application/vnd.oci.image.layer.v1.tar+gzip")],
        annotations: None,
    };

    ImageParts {
        manifest: Bytes::from(serde_json::to_vec(&manifest).unwrap()),
        config,
        layer,
    }
}

/// Puller with the production attempt budget and a negligible delay.
pub fn fast_puller() -> PullerService {
    PullerService::new(fast_retry(), Progress::silent())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(1))
}

/// In-memory getter serving a fixed tag table and image set.
#[derive(Default)]
pub struct StubGetter {
    tags: Mutex<HashMap<String, Digest>>,
    images: HashMap<Digest, Image>,
    /// Number of leading `get_image` calls that fail with a timeout.
    failing_pulls: AtomicU32,
    pub digest_calls: Mutex<Vec<String>>,
    pub image_calls: Mutex<Vec<String>>,
}

impl StubGetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `parts` under `tag`.
    pub fn with_image(mut self, tag: &str, parts: &ImageParts) -> Self {
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), parts.digest());
        self.images.insert(parts.digest(), parts.image());
        self
    }

    /// Answer fetches of `digest` with the unrelated image `parts`.
    pub fn with_substitute(mut self, digest: Digest, parts: &ImageParts) -> Self {
        self.images.insert(digest, parts.image());
        self
    }

    /// Make the first `count` image fetches fail.
    pub fn failing_pulls(self, count: u32) -> Self {
        self.failing_pulls.store(count, Ordering::SeqCst);
        self
    }

    /// Point `tag` at another served image, as an upstream push would.
    pub fn move_tag(&self, tag: &str, parts: &ImageParts) {
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), parts.digest());
    }

    pub fn digest_calls(&self) -> Vec<String> {
        self.digest_calls.lock().unwrap().clone()
    }

    pub fn image_calls(&self) -> Vec<String> {
        self.image_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GetterService for StubGetter {
    async fn get_digest(&self, tag: &str) -> Result<Digest, RegistryError> {
        self.digest_calls.lock().unwrap().push(tag.to_string());
        self.tags
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tag.to_string()))
    }

    async fn get_image(&self, reference: &str) -> Result<Image, RegistryError> {
        self.image_calls.lock().unwrap().push(reference.to_string());

        let remaining = self.failing_pulls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pulls.store(remaining - 1, Ordering::SeqCst);
            return Err(RegistryError::Timeout);
        }

        let image = match reference.strip_prefix('@') {
            Some(digest) => self.images.get(&Digest::parse(digest)?).cloned(),
            None => {
                let tag = reference.trim_start_matches(':');
                let digest = self.tags.lock().unwrap().get(tag).cloned();
                digest.and_then(|d| self.images.get(&d).cloned())
            }
        };
        image.ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }
}

/// Serve `parts` from `server` as `<repo>:<tag>`.
pub async fn mount_image(server: &MockServer, repo: &str, tag: &str, parts: &ImageParts) {
    let digest = parts.digest();

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{repo}/manifests/{tag}")))
        .respond_with(ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest.as_str()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/manifests/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(parts.manifest.to_vec()))
        .mount(server)
        .await;

    for blob in [&parts.config, &parts.layer] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{repo}/blobs/{}", Digest::sha256_of(blob))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.to_vec()))
            .mount(server)
            .await;
    }
}

/// Answer the registry ping.
pub async fn mount_ping(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}
