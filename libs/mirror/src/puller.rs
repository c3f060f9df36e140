//! Pull orchestration: resolve every digest of a batch, then pull by digest.
//!
//! The two phases are strictly sequential. All tag-to-digest bindings of a
//! batch are captured before the first byte of content is fetched, so a tag
//! that moves mid-run cannot mix old and new content into one layout. The
//! pull phase only ever fetches by digest.

use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::CancelSignal;
use crate::download_list::ImageSet;
use crate::getter::GetterService;
use crate::layout::{ImageLayout, LayoutError};
use crate::meta::{Digest, ImageMeta, ImageReference, ReferenceError};
use crate::progress::Progress;
use crate::registry::RegistryError;
use crate::retry::{RetryError, RetryPolicy};

/// Failure of a single pull attempt.
#[derive(Debug, Error)]
pub enum PullStepError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("fetched image digest {actual} does not match pinned digest {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },
}

impl PullStepError {
    /// Whether another attempt could succeed. Content that does not match its
    /// pin or cannot be stored as an image fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DigestMismatch { .. } => false,
            Self::Registry(
                RegistryError::InvalidImage(_)
                | RegistryError::InvalidDigest(_)
                | RegistryError::TooLarge { .. },
            ) => false,
            Self::Layout(
                LayoutError::MissingImageMeta | LayoutError::InvalidTag(_) | LayoutError::Image(_),
            ) => false,
            _ => true,
        }
    }
}

/// Errors from [`PullerService::pull_images`].
#[derive(Debug, Error)]
pub enum PullError {
    #[error("get digest for {reference}: {source}")]
    GetDigest {
        reference: String,
        #[source]
        source: RegistryError,
    },

    #[error("parse reference {reference}: {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: ReferenceError,
    },

    #[error("pull {reference} failed after {attempts} attempts: {source}")]
    Pull {
        reference: String,
        attempts: u32,
        #[source]
        source: PullStepError,
    },

    #[error("pull cancelled")]
    Cancelled,
}

impl PullError {
    fn from_retry(reference: &str, err: RetryError<PullStepError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { attempts, source } => Self::Pull {
                reference: reference.to_string(),
                attempts,
                source,
            },
        }
    }
}

/// One pull request: which references, into which layout, from where.
pub struct PullConfig<'a> {
    /// Label used in progress output.
    pub name: &'a str,
    pub image_set: &'a mut ImageSet,
    pub layout: &'a ImageLayout,
    /// Leave unresolvable references unset instead of failing the batch.
    pub allow_missing_tags: bool,
    pub getter: &'a dyn GetterService,
}

/// Turns image sets into populated layouts.
#[derive(Debug, Clone, Default)]
pub struct PullerService {
    retry: RetryPolicy,
    progress: Progress,
}

impl PullerService {
    pub fn new(retry: RetryPolicy, progress: Progress) -> Self {
        Self { retry, progress }
    }

    /// Resolve all unresolved digests of `config.image_set`, then pull every
    /// resolved image into `config.layout`.
    ///
    /// Images written before a failure stay in the layout; rerunning is safe.
    pub async fn pull_images(
        &self,
        cancel: &CancelSignal,
        config: PullConfig<'_>,
    ) -> Result<(), PullError> {
        self.progress
            .debug(format!("Resolving {} digests", config.name));
        self.resolve_metas(cancel, config.image_set, config.getter, config.allow_missing_tags)
            .await?;

        self.progress.info(format!("Pulling {}", config.name));
        self.pull_image_set(cancel, config.image_set, config.layout, config.getter)
            .await
    }

    /// Resolve every `None` entry in place.
    ///
    /// Digest-pinned references are bound without a network call. Failed
    /// lookups are fatal unless `allow_missing_tags` is set, in which case the
    /// entry stays `None`.
    pub async fn resolve_metas(
        &self,
        cancel: &CancelSignal,
        image_set: &mut ImageSet,
        getter: &dyn GetterService,
        allow_missing_tags: bool,
    ) -> Result<(), PullError> {
        for (reference, slot) in image_set.iter_mut().filter(|(_, m)| m.is_none()) {
            if cancel.is_cancelled() {
                return Err(PullError::Cancelled);
            }

            let parsed = match ImageReference::parse(reference) {
                Ok(parsed) => parsed,
                Err(source) if allow_missing_tags => {
                    self.progress
                        .warn(format!("Skipping {reference}: {source}"));
                    continue;
                }
                Err(source) => {
                    return Err(PullError::InvalidReference {
                        reference: reference.clone(),
                        source,
                    })
                }
            };
            let tag = parsed.tag_for_meta();

            if let Some(digest) = parsed.digest {
                debug!(reference = %reference, digest = %digest, "Using pinned digest");
                *slot = Some(ImageMeta::new(tag, reference.as_str(), digest));
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PullError::Cancelled),
                result = getter.get_digest(&tag) => result,
            };

            match result {
                Ok(digest) => {
                    debug!(reference = %reference, digest = %digest, "Resolved digest");
                    *slot = Some(ImageMeta::new(tag, reference.as_str(), digest));
                }
                Err(e) if allow_missing_tags => {
                    self.progress
                        .warn(format!("Skipping {reference}: {e}"));
                }
                Err(source) => {
                    return Err(PullError::GetDigest {
                        reference: reference.clone(),
                        source,
                    })
                }
            }
        }

        Ok(())
    }

    /// Pull every resolved entry of `image_set` into `layout`, by digest and
    /// with retry. Unresolved entries are skipped with a warning. Failures
    /// that cannot clear up on their own end the batch without retrying.
    pub async fn pull_image_set(
        &self,
        cancel: &CancelSignal,
        image_set: &ImageSet,
        layout: &ImageLayout,
        getter: &dyn GetterService,
    ) -> Result<(), PullError> {
        let total = image_set.len();
        let mut pulled = 0;

        for (i, (reference, meta)) in image_set.iter().enumerate() {
            let Some(meta) = meta else {
                self.progress
                    .warn(format!("Skipping {reference}: digest was not resolved"));
                continue;
            };

            let label = format!("[{} / {}] Pulling {}", i + 1, total, reference);
            let attempt = self.retry.run_if(
                &label,
                cancel,
                PullStepError::is_retryable,
                || pull_image(getter, layout, meta),
            );
            self.progress
                .process(&label, attempt)
                .await
                .map_err(|e| PullError::from_retry(reference, e))?;
            pulled += 1;
        }

        info!(pulled, skipped = total - pulled, "Image set pulled");
        Ok(())
    }
}

/// Fetch one image by its pinned digest and write it into the layout.
async fn pull_image(
    getter: &dyn GetterService,
    layout: &ImageLayout,
    meta: &ImageMeta,
) -> Result<(), PullStepError> {
    debug!(reference = %meta.digest_reference(), "Fetching image");
    let image = getter.get_image(&format!("@{}", meta.digest)).await?;
    if image.digest() != &meta.digest {
        return Err(PullStepError::DigestMismatch {
            expected: meta.digest.clone(),
            actual: image.digest().clone(),
        });
    }

    let image = image.with_meta(meta.clone());
    layout.add_image(&image, &meta.tag).await?;
    Ok(())
}
