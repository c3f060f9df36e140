//! OCI distribution client for resolving tags and pulling content by digest.
//!
//! Implements the subset of the OCI distribution API the mirror needs: registry
//! ping, manifest digest lookup, manifest and blob fetches. Bearer token
//! challenges are answered transparently and tokens cached per repository.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::image::ImageError;
use crate::meta::{Digest, ReferenceError};
use crate::oci::MANIFEST_ACCEPT;

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// User name registries expect alongside a license token.
pub const LICENSE_TOKEN_USER: &str = "license-token";

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error(transparent)]
    InvalidDigest(#[from] ReferenceError),

    #[error(transparent)]
    InvalidImage(#[from] ImageError),
}

impl RegistryError {
    /// Whether the registry reported the content as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Credentials presented to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl RegistryAuth {
    /// Basic credentials for a platform license token.
    pub fn license(token: impl Into<String>) -> Self {
        Self::Basic {
            username: LICENSE_TOKEN_USER.to_string(),
            password: token.into(),
        }
    }
}

/// Registry client configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry host with optional port, or a full `http(s)://` base URL.
    pub registry: String,
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    pub auth: RegistryAuth,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Largest blob accepted.
    pub max_blob_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry: "registry.deckhouse.io".to_string(),
            insecure: false,
            auth: RegistryAuth::Anonymous,
            timeout: Duration::from_secs(600),
            max_blob_size: 10 * 1024 * 1024 * 1024, // 10 GiB
        }
    }
}

/// A source registry root such as `registry.deckhouse.io/deckhouse/ee`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRegistry {
    /// Host with optional port.
    pub host: String,
    /// Repository path under which all image groups live; may be empty.
    pub root: String,
    /// The source was written with an `http://` scheme.
    pub plain_http: bool,
}

impl SourceRegistry {
    /// Parse `[scheme://]host[:port][/root]`. An `http://` scheme selects
    /// plain HTTP.
    pub fn parse(source: &str) -> Self {
        let (plain_http, rest) = match source.strip_prefix("http://") {
            Some(rest) => (true, rest),
            None => (false, source.strip_prefix("https://").unwrap_or(source)),
        };
        let trimmed = rest.trim_end_matches('/');
        let (host, root) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        Self {
            host: host.to_string(),
            root: root.to_string(),
            plain_http,
        }
    }

    /// Repository path (without host) for an image group.
    pub fn repository(&self, path: &str) -> String {
        if self.root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    /// `host/root`, the prefix of every full reference under this source.
    pub fn root_url(&self) -> String {
        if self.root.is_empty() {
            self.host.clone()
        } else {
            format!("{}/{}", self.host, self.root)
        }
    }
}

/// OCI Distribution client.
pub struct RegistryClient {
    config: RegistryConfig,
    client: Client,
    /// Bearer tokens obtained through challenges, keyed by repository.
    tokens: RwLock<HashMap<String, String>>,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            client,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Base URL with scheme.
    pub fn base_url(&self) -> String {
        let registry = self.config.registry.trim_end_matches('/');
        if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.to_string()
        } else if self.config.insecure {
            format!("http://{registry}")
        } else {
            format!("https://{registry}")
        }
    }

    /// Check that the registry answers the distribution API and accepts the
    /// configured credentials.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        let url = format!("{}/v2/", self.base_url());
        debug!(url = %url, "Pinging registry");

        let response = self.send(Method::GET, &url, "", None).await?;
        check_status(response, &url).map(|_| ())
    }

    /// Resolve a tag (or digest) to the manifest digest.
    ///
    /// Uses the `Docker-Content-Digest` header of a HEAD request, falling
    /// back to hashing the body of a GET when the header is absent.
    pub async fn manifest_digest(&self, repo: &str, reference: &str) -> Result<Digest, RegistryError> {
        let url = self.manifest_url(repo, reference);
        debug!(url = %url, "Resolving manifest digest");

        let response = self
            .send(Method::HEAD, &url, repo, Some(MANIFEST_ACCEPT))
            .await?;
        let response = check_status(response, &url)?;
        if let Some(digest) = digest_header(&response)? {
            return Ok(digest);
        }

        debug!(url = %url, "No digest header on HEAD, hashing manifest body");
        let (_, digest) = self.pull_manifest(repo, reference).await?;
        Ok(digest)
    }

    /// Pull raw manifest bytes and their digest.
    ///
    /// When `reference` is a digest the body is verified against it.
    pub async fn pull_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Bytes, Digest), RegistryError> {
        let url = self.manifest_url(repo, reference);
        debug!(url = %url, "Pulling manifest");

        let response = self
            .send(Method::GET, &url, repo, Some(MANIFEST_ACCEPT))
            .await?;
        let response = check_status(response, &url)?;
        let body = response.bytes().await?;

        let computed = Digest::sha256_of(&body);
        if reference.contains(':') {
            let expected = Digest::parse(reference)?;
            if computed != expected {
                return Err(RegistryError::DigestMismatch {
                    expected,
                    actual: computed,
                });
            }
        }

        Ok((body, computed))
    }

    /// Pull a blob by digest, verifying size limit and content digest.
    pub async fn pull_blob(&self, repo: &str, digest: &Digest) -> Result<Bytes, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url(), repo, digest);
        debug!(url = %url, "Pulling blob");

        let response = self.send(Method::GET, &url, repo, None).await?;
        let response = check_status(response, &url)?;

        if let Some(size) = response.content_length() {
            if size > self.config.max_blob_size {
                return Err(RegistryError::TooLarge {
                    size,
                    limit: self.config.max_blob_size,
                });
            }
        }

        let body = response.bytes().await?;
        let computed = Digest::sha256_of(&body);
        if &computed != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.clone(),
                actual: computed,
            });
        }

        info!(digest = %digest, size = body.len(), "Blob downloaded");
        Ok(body)
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base_url(), repo, reference)
    }

    fn request(&self, method: Method, url: &str, accept: Option<&str>, token: Option<&str>) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        if let Some(token) = token {
            return request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        match &self.config.auth {
            RegistryAuth::Bearer(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            RegistryAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            RegistryAuth::Anonymous => request,
        }
    }

    /// Send a request, answering one bearer challenge if the registry issues it.
    async fn send(
        &self,
        method: Method,
        url: &str,
        repo: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let cached = self.tokens.read().await.get(repo).cloned();
        let response = self
            .request(method.clone(), url, accept, cached.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer "))
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Err(RegistryError::AuthRequired(url.to_string()));
        };

        let token = self.request_token(&challenge, url).await?;
        self.tokens
            .write()
            .await
            .insert(repo.to_string(), token.clone());

        let response = self
            .request(method, url, accept, Some(&token))
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::AuthRequired(url.to_string()));
        }
        Ok(response)
    }

    /// Exchange a bearer challenge for a token at the challenge realm.
    async fn request_token(&self, challenge: &str, url: &str) -> Result<String, RegistryError> {
        let params = parse_www_authenticate(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryError::AuthRequired(url.to_string()))?;

        let mut request = self.client.get(realm);
        for key in ["service", "scope"] {
            if let Some(value) = params.get(key) {
                request = request.query(&[(key, value)]);
            }
        }
        if let RegistryAuth::Basic { username, password } = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        debug!(realm = %realm, "Requesting registry token");
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthRequired(url.to_string()));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body = response.bytes().await?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::AuthRequired(url.to_string()))
    }
}

/// Map a response status onto the error taxonomy.
fn check_status(response: Response, url: &str) -> Result<Response, RegistryError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(url.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RegistryError::AuthRequired(url.to_string()))
        }
        status => Err(RegistryError::UnexpectedStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }),
    }
}

fn digest_header(response: &Response) -> Result<Option<Digest>, RegistryError> {
    match response.headers().get(DIGEST_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) => Ok(Some(Digest::parse(value.trim())?)),
        None => Ok(None),
    }
}

/// Parse the parameters of a `Bearer realm="...",service="...",scope="..."`
/// challenge. Quoted values may contain commas.
fn parse_www_authenticate(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let rest = header.get(7..).unwrap_or_default();

    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in rest.chars() {
        match c {
            '"' if in_value => in_quotes = !in_quotes,
            '=' if !in_value => in_value = true,
            ',' if !in_quotes => {
                if !key.trim().is_empty() {
                    params.insert(key.trim().to_string(), value.clone());
                }
                key.clear();
                value.clear();
                in_value = false;
            }
            c if in_value => value.push(c),
            c => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        params.insert(key.trim().to_string(), value);
    }

    params
}
