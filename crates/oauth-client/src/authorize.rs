//! Authorization request and redirect callback handling
//!
//! Every login gets a fresh random `state` nonce. The nonce goes out in the
//! authorization URL and must come back unchanged on the redirect callback;
//! a callback carrying any other value is rejected so a redirect from an
//! unrelated flow can never complete this one.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;

use crate::config::ClientConfig;
use crate::constants::AUTHORIZE_PATH;
use crate::error::{Error, Result};

/// Generate an unguessable state nonce.
///
/// 32 random bytes, URL-safe base64 without padding (43 characters).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the browser-navigated authorization URL.
pub fn build_authorization_url(config: &ClientConfig, state: &str) -> Result<String> {
    let mut url = Url::parse(&config.endpoint(AUTHORIZE_PATH)).map_err(|e| {
        Error::Http(format!(
            "invalid server_url {:?}: {e}",
            config.server_url
        ))
    })?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &config.joined_scopes())
        .append_pair("state", state);
    Ok(url.into())
}

/// Query parameters delivered on the redirect callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Extract the callback parameters from a redirect URI.
///
/// Accepts any absolute URI, including custom app schemes such as
/// `mirimapp://callback?code=...`.
pub fn parse_callback(uri: &str) -> Result<CallbackParams> {
    let url = Url::parse(uri)
        .map_err(|e| Error::AuthorizationDenied(format!("unparseable callback URI: {e}")))?;

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        let value = value.into_owned();
        match key.as_ref() {
            "code" if !value.is_empty() => params.code = Some(value),
            "state" => params.state = Some(value),
            "error" => params.error = Some(value),
            "error_description" => params.error_description = Some(value),
            _ => {}
        }
    }
    Ok(params)
}

/// Check a callback against the issued state and return the authorization code.
///
/// Order: an explicit `error` from the server, then a missing `code`
/// (both `AuthorizationDenied`), then a `state` mismatch.
pub fn validate_callback(params: &CallbackParams, expected_state: &str) -> Result<String> {
    if let Some(error) = &params.error {
        let reason = match &params.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        };
        return Err(Error::AuthorizationDenied(reason));
    }

    let code = params
        .code
        .clone()
        .ok_or_else(|| Error::AuthorizationDenied("authorization code not received".into()))?;

    let state = params.state.as_deref().unwrap_or_default();
    if !constant_time_eq(state.as_bytes(), expected_state.as_bytes()) {
        return Err(Error::StateMismatch);
    }

    Ok(code)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
