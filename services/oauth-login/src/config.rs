//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from OAUTH_CLIENT_SECRET or client_secret_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use oauth_client::{ClientConfig, STORE_NAMESPACE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub client: ClientSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
}

/// OAuth client registration plus the secret file location
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(flatten)]
    pub oauth: ClientConfig,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Credential store location and key source
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    /// Encryption key file; defaults to `.store.key` inside `dir`
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Keep the encryption key in the OS keychain instead of a file
    #[serde(default)]
    pub use_keyring: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            key_file: None,
            use_keyring: false,
        }
    }
}

/// Loopback redirect receiver
#[derive(Debug, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_callback_path")]
    pub path: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_callback_addr(),
            path: default_callback_path(),
        }
    }
}

/// `$XDG_DATA_HOME/oauth_session`, else `$HOME/.local/share/oauth_session`,
/// else `./oauth_session`.
fn default_store_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join(STORE_NAMESPACE);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local/share")
            .join(STORE_NAMESPACE);
    }
    PathBuf::from(STORE_NAMESPACE)
}

fn default_callback_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8765))
}

fn default_callback_path() -> String {
    "/callback".into()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let client = &mut config.client;
        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            client.oauth.client_secret = Secret::new(secret);
        } else if let Some(ref secret_file) = client.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            client.oauth.client_secret = Secret::new(secret.trim().to_owned());
        }

        if client.oauth.client_secret.is_empty() {
            return Err(common::Error::MissingSecret(
                "set OAUTH_CLIENT_SECRET or client.client_secret_file",
            ));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let oauth = &self.client.oauth;

        if oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        if !oauth.server_url.starts_with("http://") && !oauth.server_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "server_url must start with http:// or https://, got: {}",
                oauth.server_url
            )));
        }

        if oauth.callback_timeout_secs == 0 {
            return Err(common::Error::Config(
                "callback_timeout_secs must be greater than 0".into(),
            ));
        }

        if oauth.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.callback.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "callback.path must start with '/', got: {}",
                self.callback.path
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-login.toml")
    }

    /// Key file location for the file key provider.
    pub fn key_file(&self) -> PathBuf {
        self.storage
            .key_file
            .clone()
            .unwrap_or_else(|| self.storage.dir.join(".store.key"))
    }
}
