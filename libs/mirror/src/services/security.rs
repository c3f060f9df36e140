use std::sync::Arc;

use tracing::info;

use super::{validate_registry_access, MirrorOptions, ServiceError};
use crate::cancel::CancelSignal;
use crate::download_list::{ImageDownloadList, SecurityDatabase, SECURITY_DATABASES};
use crate::getter::RegistryGetter;
use crate::layout::ImageLayout;
use crate::progress::Progress;
use crate::puller::{PullConfig, PullerService};
use crate::registry::RegistryClient;

const SECURITY_PATH: &str = "security";

/// One security database and the layout it is mirrored into.
pub struct SecurityDatabaseMirror {
    pub database: SecurityDatabase,
    pub layout: ImageLayout,
    pub download_list: ImageDownloadList,
}

/// Mirrors vulnerability databases into `<workdir>/security/<db>`.
///
/// Databases are optional: editions that do not publish one leave its entry
/// unresolved and its layout empty.
pub struct SecurityService {
    options: MirrorOptions,
    client: Arc<RegistryClient>,
    databases: Vec<SecurityDatabaseMirror>,
    puller: PullerService,
    progress: Progress,
}

impl SecurityService {
    /// Open (or create) one layout per entry of [`SECURITY_DATABASES`].
    pub async fn new(
        options: MirrorOptions,
        client: Arc<RegistryClient>,
        progress: Progress,
    ) -> Result<Self, ServiceError> {
        Self::with_databases(options, client, &SECURITY_DATABASES, progress).await
    }

    pub async fn with_databases(
        options: MirrorOptions,
        client: Arc<RegistryClient>,
        databases: &[SecurityDatabase],
        progress: Progress,
    ) -> Result<Self, ServiceError> {
        let mut mirrors = Vec::with_capacity(databases.len());
        for database in databases {
            let path = options.workdir.join(SECURITY_PATH).join(database.name);
            mirrors.push(SecurityDatabaseMirror {
                database: *database,
                layout: ImageLayout::create(path).await?,
                download_list: ImageDownloadList::new(options.source.root_url()),
            });
        }

        Ok(Self {
            puller: PullerService::new(options.retry.clone(), progress.clone()),
            options,
            client,
            databases: mirrors,
            progress,
        })
    }

    pub fn databases(&self) -> &[SecurityDatabaseMirror] {
        &self.databases
    }

    /// Pull every database that the source publishes.
    pub async fn pull(&mut self, cancel: &CancelSignal) -> Result<(), ServiceError> {
        validate_registry_access(
            &self.client,
            &self.options.retry,
            self.options.access_timeout,
            cancel,
        )
        .await?;

        for mirror in &mut self.databases {
            let name = mirror.database.name;
            mirror.download_list.fill_security_database(&mirror.database);

            let getter = RegistryGetter::new(
                self.client.clone(),
                self.options
                    .source
                    .repository(&format!("{SECURITY_PATH}/{name}")),
            );
            self.puller
                .pull_images(
                    cancel,
                    PullConfig {
                        name,
                        image_set: mirror.download_list.images_mut(),
                        layout: &mirror.layout,
                        allow_missing_tags: true,
                        getter: &getter,
                    },
                )
                .await?;

            mirror.layout.sort_index_manifests().await?;
        }

        let mirrored = self
            .databases
            .iter()
            .filter(|m| m.download_list.images().values().any(Option::is_some))
            .count();
        self.progress.info(format!(
            "Mirrored {mirrored} of {} security databases",
            self.databases.len()
        ));
        info!(mirrored, "Security databases mirrored");
        Ok(())
    }
}
