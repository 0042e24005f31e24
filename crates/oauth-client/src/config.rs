//! Client registration and transport settings
//!
//! `client_secret` is never read from a config file. Hosts set it from the
//! environment or a secret file after deserializing (see the `oauth-login`
//! service for the resolution order).

use std::time::Duration;

use common::Secret;
use serde::Deserialize;

use crate::constants::{DEFAULT_SCOPE_DELIMITER, DEFAULT_SERVER_URL};
use crate::error::{Error, Result};

/// OAuth client registration plus the server it talks to.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Secret<String>,
    /// Host-specific redirect URI registered with the authorization server
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_scope_delimiter")]
    pub scope_delimiter: String,
    /// How long a login waits for the redirect callback before failing
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_scope_delimiter() -> String {
    DEFAULT_SCOPE_DELIMITER.to_string()
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

impl ClientConfig {
    /// Build a config against the default server with default timeouts.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret.into()),
            redirect_uri: redirect_uri.into(),
            scopes,
            server_url: default_server_url(),
            scope_delimiter: default_scope_delimiter(),
            callback_timeout_secs: default_callback_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout_secs = timeout.as_secs();
        self
    }

    /// Absolute URL for a server path such as `TOKEN_PATH`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    /// Scopes joined with the configured delimiter.
    pub fn joined_scopes(&self) -> String {
        self.scopes.join(&self.scope_delimiter)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// HTTP client with the configured request timeout applied.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults_and_no_secret() {
        let toml = r#"
client_id = "mirim-app"
redirect_uri = "mirimapp://callback"
scopes = ["profile", "email"]
"#;
        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.client_id, "mirim-app");
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.scope_delimiter, ",");
        assert_eq!(config.callback_timeout_secs, 300);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.client_secret.is_empty());
    }

    #[test]
    fn endpoint_handles_trailing_slash() {
        let config = ClientConfig::new("id", "secret", "app://cb", vec![])
            .with_server_url("http://127.0.0.1:9000/");
        assert_eq!(
            config.endpoint("/api/v1/user"),
            "http://127.0.0.1:9000/api/v1/user"
        );
    }

    #[test]
    fn scopes_join_with_delimiter() {
        let mut config = ClientConfig::new(
            "id",
            "secret",
            "app://cb",
            vec!["profile".into(), "email".into()],
        );
        assert_eq!(config.joined_scopes(), "profile,email");

        config.scope_delimiter = " ".into();
        assert_eq!(config.joined_scopes(), "profile email");
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let config = ClientConfig::new("id", "super-secret", "app://cb", vec![]);
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"), "leaked secret: {debug}");
    }
}
