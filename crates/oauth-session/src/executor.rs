//! Bearer-authenticated API calls
//!
//! Each call obtains a valid token first (refreshing if expired). A 401 is
//! taken as the server revoking that token: it is invalidated, refreshed,
//! and the request is retried exactly once.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use oauth_client::{ClientConfig, Error, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, warn};

use crate::lifecycle::TokenLifecycle;

/// Decoded JSON object body.
pub type StructuredResponse = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Clone)]
pub struct AuthenticatedRequestExecutor {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    lifecycle: TokenLifecycle,
}

impl AuthenticatedRequestExecutor {
    pub fn new(client: reqwest::Client, config: Arc<ClientConfig>, lifecycle: TokenLifecycle) -> Self {
        Self {
            client,
            config,
            lifecycle,
        }
    }

    /// Call `endpoint` (a path under the server URL) with a bearer token.
    ///
    /// `method` is matched case-insensitively against GET/POST/PUT/DELETE
    /// before any token work. An `Authorization` entry in `headers` is
    /// ignored. An empty response body decodes as an empty object.
    pub async fn execute(
        &self,
        endpoint: &str,
        method: &str,
        body: Option<&Value>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<StructuredResponse> {
        let method: Method = method.parse()?;
        let tokens = self.lifecycle.get_valid().await?;

        match self
            .send(endpoint, method, body, headers, tokens.access_token())
            .await
        {
            Err(e) if e.is_unauthorized() => {
                warn!(endpoint, "request unauthorized, refreshing token and retrying once");
                crate::metrics::record_request_retry();
                let renewed = self.lifecycle.renew_rejected(&tokens).await?;
                self.send(endpoint, method, body, headers, renewed.access_token())
                    .await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
        headers: Option<&HashMap<String, String>>,
        access_token: &str,
    ) -> Result<StructuredResponse> {
        let mut request = self
            .client
            .request(method.into(), self.config.endpoint(endpoint))
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, "application/json");

        for (name, value) in headers.into_iter().flatten() {
            if name.eq_ignore_ascii_case(AUTHORIZATION.as_str()) {
                debug!("ignoring caller-supplied authorization header");
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("{method:?} {endpoint}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading response body: {e}")))?;

        if !status.is_success() {
            debug!(endpoint, status = status.as_u16(), "request failed");
            return Err(Error::RequestFailed {
                code: status.as_u16(),
                body: text,
            });
        }

        decode_object(&text)
    }
}

fn decode_object(text: &str) -> Result<StructuredResponse> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::MalformedServerResponse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(Error::MalformedServerResponse(format!(
            "response is not JSON: {e}"
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::test_support::MockServer;
    use oauth_client::{TokenPair, TokenStore};
    use std::sync::atomic::Ordering;
    use tokio::sync::RwLock;

    struct Harness {
        server: MockServer,
        executor: AuthenticatedRequestExecutor,
        _dir: tempfile::TempDir,
    }

    async fn harness(tokens: Option<TokenPair>) -> Harness {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(server.config());
        let store = Arc::new(TokenStore::with_file_key(dir.path()));
        if let Some(tokens) = &tokens {
            store.save_tokens(tokens).await.unwrap();
        }
        let session = Arc::new(RwLock::new(Session {
            tokens,
            ..Session::default()
        }));
        let client = reqwest::Client::new();
        let lifecycle = TokenLifecycle::new(client.clone(), config.clone(), store, session);
        Harness {
            server,
            executor: AuthenticatedRequestExecutor::new(client, config, lifecycle),
            _dir: dir,
        }
    }

    fn valid() -> Option<TokenPair> {
        Some(TokenPair::new("at_valid", "rt_valid", 3600))
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("Delete".parse::<Method>().unwrap(), Method::Delete);
        assert_eq!(
            "PATCH".parse::<Method>(),
            Err(Error::UnsupportedMethod("PATCH".into()))
        );
    }

    #[test]
    fn empty_body_decodes_as_empty_object() {
        assert!(decode_object("").unwrap().is_empty());
        assert!(decode_object("  \n").unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_attaches_bearer_and_content_type() {
        let h = harness(valid()).await;
        let response = h.executor.execute("/data", "GET", None, None).await.unwrap();

        assert_eq!(response["method"], "GET");
        assert_eq!(h.server.state.api_auths.lock().unwrap()[0], "Bearer at_valid");
        let headers = h.server.state.api_headers.lock().unwrap();
        assert_eq!(headers[0]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let h = harness(valid()).await;
        let body = serde_json::json!({"title": "hello", "count": 2});
        let response = h
            .executor
            .execute("/data", "post", Some(&body), None)
            .await
            .unwrap();

        assert_eq!(response["method"], "POST");
        assert_eq!(response["received"], body);
    }

    #[tokio::test]
    async fn custom_headers_pass_through_but_not_authorization() {
        let h = harness(valid()).await;
        let headers = HashMap::from([
            ("X-Request-Id".to_string(), "req-42".to_string()),
            ("authorization".to_string(), "Bearer forged".to_string()),
        ]);
        h.executor
            .execute("/data", "PUT", None, Some(&headers))
            .await
            .unwrap();

        assert_eq!(h.server.state.api_auths.lock().unwrap()[0], "Bearer at_valid");
        let seen = h.server.state.api_headers.lock().unwrap();
        assert_eq!(seen[0]["x-request-id"], "req-42");
        assert_eq!(seen[0].get_all("authorization").iter().count(), 1);
    }

    #[tokio::test]
    async fn unsupported_method_fails_before_any_io() {
        let h = harness(None).await;
        let err = h
            .executor
            .execute("/data", "PATCH", None, None)
            .await
            .unwrap_err();

        assert_eq!(err, Error::UnsupportedMethod("PATCH".into()));
        assert_eq!(h.server.state.api_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthenticated_call_fails() {
        let h = harness(None).await;
        let err = h.executor.execute("/data", "GET", None, None).await.unwrap_err();
        assert_eq!(err, Error::NotAuthenticated);
        assert_eq!(h.server.state.api_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_refreshes_and_retries_once() {
        let h = harness(valid()).await;
        h.server.state.push_api_status(401);

        let response = h.executor.execute("/data", "GET", None, None).await.unwrap();
        assert_eq!(response["method"], "GET");
        assert_eq!(h.server.state.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.server.state.api_auths.lock().unwrap(),
            vec!["Bearer at_valid", "Bearer at_refreshed_1"]
        );
    }

    #[tokio::test]
    async fn repeated_unauthorized_is_not_retried_again() {
        let h = harness(valid()).await;
        h.server.state.push_api_status(401);
        h.server.state.push_api_status(401);

        let err = h.executor.execute("/data", "GET", None, None).await.unwrap_err();
        assert!(err.is_unauthorized(), "got: {err:?}");
        assert_eq!(h.server.state.api_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.server.state.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_is_request_failed_without_refresh() {
        let h = harness(valid()).await;
        h.server.state.push_api_status(500);

        let err = h.executor.execute("/data", "GET", None, None).await.unwrap_err();
        assert_eq!(
            err,
            Error::RequestFailed {
                code: 500,
                body: "rejected".into()
            }
        );
        assert_eq!(h.server.state.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_response_is_empty_map() {
        let h = harness(valid()).await;
        h.server.state.set_api_reply("");
        let response = h.executor.execute("/data", "DELETE", None, None).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn non_object_response_is_malformed() {
        let h = harness(valid()).await;
        h.server.state.set_api_reply("[1, 2, 3]");
        let err = h.executor.execute("/data", "GET", None, None).await.unwrap_err();
        assert!(matches!(err, Error::MalformedServerResponse(ref m) if m.contains("array")));

        h.server.state.set_api_reply("<html>");
        let err = h.executor.execute("/data", "GET", None, None).await.unwrap_err();
        assert!(matches!(err, Error::MalformedServerResponse(_)));
    }
}
