//! Token exchange, refresh, and user info
//!
//! All three endpoints wrap their payload in the same envelope:
//! `{"status": 200, "data": {...}}` on success, `{"status": <n>, "message": "..."}`
//! otherwise. Failures are reported at two levels: an HTTP non-2xx status,
//! or a 2xx response whose envelope status is not 200. Both map to the
//! endpoint's typed error carrying the code and the server's message.
//!
//! Payloads decode into typed structs. A missing required field is a
//! `MalformedServerResponse`, never a silent default. The refresh endpoint
//! is the exception: any unusable body is a `RefreshFailed` carrying the
//! HTTP status and the raw body.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ClientConfig;
use crate::constants::{DEFAULT_EXPIRES_IN_SECS, ENVELOPE_OK, REFRESH_PATH, TOKEN_PATH, USER_INFO_PATH};
use crate::error::{Error, Result};
use crate::types::{TokenPair, UserProfile};

/// `data` of a successful code exchange.
#[derive(Debug, Deserialize)]
struct ExchangeData {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Number>,
}

/// `data` of a successful refresh. The server uses camelCase here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    #[serde(alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expires_in")]
    expires_in: Option<serde_json::Number>,
}

/// Exchange an authorization code for a token pair.
///
/// `state` is echoed back to the server alongside the client credentials.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &ClientConfig,
    code: &str,
    state: &str,
) -> Result<TokenPair> {
    let body = serde_json::json!({
        "code": code,
        "state": state,
        "clientId": config.client_id,
        "clientSecret": config.client_secret.expose(),
        "redirectUri": config.redirect_uri,
        "scopes": config.joined_scopes(),
    });

    let response = client
        .post(config.endpoint(TOKEN_PATH))
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let data: ExchangeData = read_envelope(response, |code, body| Error::TokenExchangeFailed {
        code,
        body,
    })
    .await?;

    let access = non_empty(data.access_token, "access_token")?;
    let refresh = non_empty(data.refresh_token, "refresh_token")?;
    debug!("authorization code exchanged");
    Ok(TokenPair::new(access, refresh, seconds(data.expires_in)?))
}

/// Obtain a new access token with a refresh token.
///
/// The returned pair keeps `refresh_token` unless the server rotates it.
pub async fn refresh_tokens(
    client: &reqwest::Client,
    config: &ClientConfig,
    refresh_token: &str,
) -> Result<TokenPair> {
    let response = client
        .post(config.endpoint(REFRESH_PATH))
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let (status, text) = read_body(response).await?;
    let decoded = decode_envelope::<RefreshData, _>(status, &text, |code, body| {
        Error::RefreshFailed { code, body }
    })
    .and_then(|data| {
        let access = non_empty(data.access_token, "accessToken")?;
        Ok((access, data.refresh_token, seconds(data.expires_in)?))
    });

    let (access, rotated, expires_in) = decoded.map_err(|e| match e {
        Error::MalformedServerResponse(reason) => {
            debug!(%reason, "unusable refresh response");
            Error::RefreshFailed { code: status, body: text.clone() }
        }
        other => other,
    })?;

    let refresh = rotated
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| refresh_token.to_string());
    debug!("access token refreshed");
    Ok(TokenPair::new(access, refresh, expires_in))
}

/// Fetch the profile of the account that owns `access_token`.
pub async fn fetch_user_info(
    client: &reqwest::Client,
    config: &ClientConfig,
    access_token: &str,
) -> Result<UserProfile> {
    let response = client
        .get(config.endpoint(USER_INFO_PATH))
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::Http(format!("user info request failed: {e}")))?;

    let user: UserProfile =
        read_envelope(response, |code, body| Error::RequestFailed { code, body }).await?;
    debug!(user_id = %user.id, "fetched user profile");
    Ok(user)
}

/// Decode the response envelope and its `data` payload.
///
/// `failed` builds the endpoint-specific error from a status code and the
/// server's message (or raw body when no message is present).
async fn read_envelope<T, F>(response: reqwest::Response, failed: F) -> Result<T>
where
    T: DeserializeOwned,
    F: Fn(u16, String) -> Error,
{
    let (status, text) = read_body(response).await?;
    decode_envelope(status, &text, failed)
}

async fn read_body(response: reqwest::Response) -> Result<(u16, String)> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading response body: {e}")))?;
    Ok((status, text))
}

fn decode_envelope<T, F>(status: u16, text: &str, failed: F) -> Result<T>
where
    T: DeserializeOwned,
    F: Fn(u16, String) -> Error,
{
    if !(200..300).contains(&status) {
        return Err(failed(status, text.to_string()));
    }

    let envelope: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::MalformedServerResponse(format!("response is not JSON: {e}")))?;

    let app_status = envelope
        .get("status")
        .and_then(|s| s.as_f64())
        .map(|s| s as i64)
        .unwrap_or(0);
    if app_status != ENVELOPE_OK {
        let message = envelope
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| text.to_string());
        return Err(failed(u16::try_from(app_status).unwrap_or(0), message));
    }

    let data = envelope
        .get("data")
        .cloned()
        .ok_or_else(|| Error::MalformedServerResponse("response has no data field".into()))?;

    serde_json::from_value(data)
        .map_err(|e| Error::MalformedServerResponse(format!("unexpected data shape: {e}")))
}

fn non_empty(value: String, field: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::MalformedServerResponse(format!("{field} is empty")));
    }
    Ok(value)
}

/// Lifetime in whole seconds. Accepts integral or float JSON numbers.
fn seconds(value: Option<serde_json::Number>) -> Result<i64> {
    match value {
        None => Ok(DEFAULT_EXPIRES_IN_SECS),
        Some(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| Error::MalformedServerResponse(format!("invalid expires_in: {n}"))),
    }
}
