//! # d8-mirror
//!
//! Offline registry mirroring engine: pulls platform image groups from a
//! source registry into OCI image layouts on local disk.
//!
//! ## Design Principles
//!
//! - All digests of a batch are resolved before any content is pulled
//! - Content is always fetched by digest, never by tag
//! - Layout writes are content-addressed, so reruns after a failure are safe
//! - Index annotations are the durable record of which tag points where
//!
//! ## Flow
//!
//! A service validates registry reachability, fills an
//! [`ImageDownloadList`], and hands it to [`PullerService::pull_images`]
//! together with a target [`ImageLayout`], a [`GetterService`] and its
//! missing-tag policy. Network steps are retried under a [`RetryPolicy`] and
//! every suspension point observes a [`CancelSignal`].

pub mod cancel;
pub mod download_list;
pub mod getter;
pub mod image;
pub mod layout;
pub mod meta;
pub mod oci;
pub mod progress;
pub mod puller;
pub mod registry;
pub mod retry;
pub mod services;

pub use cancel::{CancelHandle, CancelSignal};
pub use download_list::{ImageDownloadList, ImageSet, SecurityDatabase, SECURITY_DATABASES};
pub use getter::{GetterService, RegistryGetter};
pub use image::{Image, ImageError};
pub use layout::{ImageLayout, LayoutError};
pub use meta::{short_tag, validate_tag, Digest, ImageMeta, ImageReference, ReferenceError};
pub use progress::Progress;
pub use puller::{PullConfig, PullError, PullStepError, PullerService};
pub use registry::{RegistryAuth, RegistryClient, RegistryConfig, RegistryError, SourceRegistry};
pub use retry::{RetryError, RetryPolicy};
pub use services::{InstallerService, MirrorOptions, SecurityService, ServiceError};
