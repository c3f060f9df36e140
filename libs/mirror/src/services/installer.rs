use std::sync::Arc;

use tracing::info;

use super::{validate_registry_access, MirrorOptions, ServiceError};
use crate::cancel::CancelSignal;
use crate::download_list::ImageDownloadList;
use crate::getter::RegistryGetter;
use crate::layout::ImageLayout;
use crate::meta::validate_tag;
use crate::progress::Progress;
use crate::puller::{PullConfig, PullerService};
use crate::registry::RegistryClient;

/// Tag mirrored when no installer tag is requested.
pub const DEFAULT_INSTALLER_TAG: &str = "latest";

const INSTALLER_PATH: &str = "installer";

/// Mirrors installer images into `<workdir>/installer`.
///
/// Every requested tag must exist; a missing one fails the run.
pub struct InstallerService {
    options: MirrorOptions,
    client: Arc<RegistryClient>,
    layout: ImageLayout,
    download_list: ImageDownloadList,
    puller: PullerService,
    progress: Progress,
    tags: Vec<String>,
}

impl InstallerService {
    /// Open (or create) the installer layout. An empty `tags` means
    /// [`DEFAULT_INSTALLER_TAG`]. Invalid tags are rejected before anything
    /// is written.
    pub async fn new(
        options: MirrorOptions,
        client: Arc<RegistryClient>,
        tags: Vec<String>,
        progress: Progress,
    ) -> Result<Self, ServiceError> {
        for tag in &tags {
            validate_tag(tag)?;
        }
        let layout = ImageLayout::create(options.workdir.join(INSTALLER_PATH)).await?;
        let download_list = ImageDownloadList::new(options.source.root_url());
        let puller = PullerService::new(options.retry.clone(), progress.clone());
        let tags = if tags.is_empty() {
            vec![DEFAULT_INSTALLER_TAG.to_string()]
        } else {
            tags
        };

        Ok(Self {
            options,
            client,
            layout,
            download_list,
            puller,
            progress,
            tags,
        })
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn download_list(&self) -> &ImageDownloadList {
        &self.download_list
    }

    /// Pull the installer images and sort the layout index.
    pub async fn pull(&mut self, cancel: &CancelSignal) -> Result<(), ServiceError> {
        validate_registry_access(
            &self.client,
            &self.options.retry,
            self.options.access_timeout,
            cancel,
        )
        .await?;

        self.download_list.fill_installer(&self.tags)?;
        self.progress.info(format!(
            "Mirroring installer {} into {}",
            self.tags.join(", "),
            self.layout.path().display()
        ));

        let getter = RegistryGetter::new(
            self.client.clone(),
            self.options.source.repository(INSTALLER_PATH),
        );
        self.puller
            .pull_images(
                cancel,
                PullConfig {
                    name: "installer",
                    image_set: self.download_list.images_mut(),
                    layout: &self.layout,
                    allow_missing_tags: false,
                    getter: &getter,
                },
            )
            .await?;

        self.layout.sort_index_manifests().await?;
        info!(images = self.download_list.images().len(), "Installer mirrored");
        Ok(())
    }
}
