//! Configuration and credential storage.
//!
//! Handles:
//! - Default source registry and transport settings
//! - Registry credentials (license token or login/password)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use d8_mirror::RegistryAuth;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Configuration file name.
const CONFIG_FILE: &str = "config.json";

/// Credentials file name.
const CREDENTIALS_FILE: &str = "credentials.json";

/// Source registry used when neither flags nor config name one.
pub const DEFAULT_SOURCE: &str = "registry.deckhouse.io/deckhouse/ee";

/// Environment variable overriding the configured source registry.
pub const SOURCE_ENV: &str = "D8_MIRROR_SOURCE";

/// Get the config directory path.
fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("io", "deckhouse", "d8")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source registry root, e.g. `registry.deckhouse.io/deckhouse/ee`.
    #[serde(default = "default_source")]
    pub source: String,

    /// Talk plain HTTP to the source registry.
    #[serde(default)]
    pub insecure: bool,
}

fn default_source() -> String {
    std::env::var(SOURCE_ENV).unwrap_or_else(|_| DEFAULT_SOURCE.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source(),
            insecure: false,
        }
    }
}

impl Config {
    /// Load config from disk, or return default.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?.join(CONFIG_FILE))
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;
        if let Ok(source) = std::env::var(SOURCE_ENV) {
            config.source = source;
        }
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir()?;
        fs::create_dir_all(&dir)?;
        write_private(&dir.join(CONFIG_FILE), &serde_json::to_string_pretty(self)?)
    }
}

/// Stored registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Platform license token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn license(token: String) -> Self {
        Self {
            license_token: Some(token),
            ..Default::default()
        }
    }

    pub fn login(username: String, password: String) -> Self {
        Self {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        }
    }

    /// Registry auth for these credentials. A license token wins over a
    /// login/password pair.
    pub fn auth(&self) -> RegistryAuth {
        match (&self.license_token, &self.username, &self.password) {
            (Some(token), _, _) => RegistryAuth::license(token.clone()),
            (None, Some(username), Some(password)) => RegistryAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => RegistryAuth::Anonymous,
        }
    }

    /// Load credentials from disk.
    pub fn load() -> Result<Option<Self>> {
        Self::load_from(&config_dir()?.join(CREDENTIALS_FILE))
    }

    fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials from {:?}", path))?;

        let creds: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials from {:?}", path))?;

        Ok(Some(creds))
    }

    /// Save credentials to disk.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir()?;
        fs::create_dir_all(&dir)?;
        write_private(&dir.join(CREDENTIALS_FILE), &serde_json::to_string_pretty(self)?)
    }

    /// Delete credentials from disk.
    pub fn delete() -> Result<()> {
        let path = config_dir()?.join(CREDENTIALS_FILE);

        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete credentials at {:?}", path))?;
        }

        Ok(())
    }
}

/// Write a file readable only by the owner on Unix.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to write {:?}", path))?;
        file.write_all(contents.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;
    }

    Ok(())
}
