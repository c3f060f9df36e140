//! Mirroring services: one per image group, each owning its layouts.
//!
//! A service validates that the source registry answers, builds its download
//! list, hands it to the [`PullerService`](crate::puller::PullerService) with
//! the group's missing-tag policy and finally sorts the layout index.

mod installer;
mod security;

pub use installer::{InstallerService, DEFAULT_INSTALLER_TAG};
pub use security::{SecurityDatabaseMirror, SecurityService};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::cancel::CancelSignal;
use crate::layout::LayoutError;
use crate::meta::ReferenceError;
use crate::puller::PullError;
use crate::registry::{RegistryAuth, RegistryClient, RegistryConfig, RegistryError, SourceRegistry};
use crate::retry::{RetryError, RetryPolicy};

/// Errors from mirroring services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("registry {registry} is not reachable: {source}")]
    Unreachable {
        registry: String,
        #[source]
        source: RegistryError,
    },

    #[error(transparent)]
    Pull(#[from] PullError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    InvalidTag(#[from] ReferenceError),

    #[error("mirroring cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Pull(PullError::Cancelled))
    }
}

/// Settings shared by every mirroring service of a run.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub source: SourceRegistry,
    pub auth: RegistryAuth,
    pub insecure: bool,
    /// Directory under which every layout is created.
    pub workdir: PathBuf,
    pub retry: RetryPolicy,
    /// Deadline for each registry reachability probe.
    pub access_timeout: Duration,
}

impl MirrorOptions {
    pub fn new(source: SourceRegistry, workdir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            auth: RegistryAuth::Anonymous,
            insecure: false,
            workdir: workdir.into(),
            retry: RetryPolicy::default(),
            access_timeout: Duration::from_secs(15),
        }
    }

    /// Client for the source registry host. Plain HTTP is used when either
    /// `insecure` is set or the source was given as `http://`.
    pub fn registry_client(&self) -> Result<RegistryClient, RegistryError> {
        RegistryClient::new(RegistryConfig {
            registry: self.source.host.clone(),
            insecure: self.insecure || self.source.plain_http,
            auth: self.auth.clone(),
            ..Default::default()
        })
    }
}

/// Ping the registry under the retry policy, each attempt bounded by `timeout`.
pub async fn validate_registry_access(
    client: &RegistryClient,
    retry: &RetryPolicy,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<(), ServiceError> {
    let registry = client.base_url();

    let result = retry
        .run("Validating registry access", cancel, || async move {
            match tokio::time::timeout(timeout, client.ping()).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout),
            }
        })
        .await;

    match result {
        Ok(()) => {
            info!(registry = %registry, "Registry is reachable");
            Ok(())
        }
        Err(RetryError::Cancelled) => Err(ServiceError::Cancelled),
        Err(RetryError::Exhausted { source, .. }) => {
            Err(ServiceError::Unreachable { registry, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(uri: &str) -> RegistryClient {
        RegistryClient::new(RegistryConfig {
            registry: uri.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_mirror_options_defaults() {
        let options = MirrorOptions::new(SourceRegistry::parse("reg.io/deckhouse/ee"), "/tmp/mirror");
        assert_eq!(options.access_timeout, Duration::from_secs(15));
        assert_eq!(options.retry.attempts, 5);
        assert_eq!(options.retry.delay, Duration::from_secs(10));
        assert_eq!(
            options.registry_client().unwrap().base_url(),
            "https://reg.io"
        );
    }

    #[test]
    fn test_http_source_uses_plain_http() {
        let options = MirrorOptions::new(
            SourceRegistry::parse("http://reg.local:5000/deckhouse/ee"),
            "/tmp/mirror",
        );
        assert!(!options.insecure);
        assert_eq!(
            options.registry_client().unwrap().base_url(),
            "http://reg.local:5000"
        );
    }

    #[tokio::test]
    async fn test_validate_registry_access() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        validate_registry_access(
            &client_for(&server.uri()),
            &RetryPolicy::new(2, Duration::from_millis(1)),
            Duration::from_secs(5),
            &CancelSignal::never(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = validate_registry_access(
            &client_for(&server.uri()),
            &RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(5),
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::Unreachable {
                source: RegistryError::UnexpectedStatus { status: 503, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_probe_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = validate_registry_access(
            &client_for(&server.uri()),
            &RetryPolicy::new(1, Duration::from_millis(1)),
            Duration::from_millis(50),
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::Unreachable {
                source: RegistryError::Timeout,
                ..
            }
        ));
    }
}
