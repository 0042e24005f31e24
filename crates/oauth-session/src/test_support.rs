//! Mock authorization server and browser shared by the session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use oauth_client::ClientConfig;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::flow::BrowserLauncher;

/// Knobs and counters for the mock server.
#[derive(Default)]
pub struct MockState {
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub api_calls: AtomicUsize,
    pub last_code: Mutex<Option<String>>,
    pub last_refresh_token: Mutex<Option<String>>,
    pub refresh_delay_ms: AtomicU64,
    pub exchange_delay_ms: AtomicU64,
    /// Refresh answers 401 with a revoked message.
    pub fail_refresh: AtomicBool,
    /// Envelope status returned by the token endpoint; 0 means 200.
    pub exchange_status: AtomicI64,
    /// Statuses for successive `/data` calls; empty means 200.
    pub api_statuses: Mutex<VecDeque<u16>>,
    /// Raw body for `/data`; `None` echoes the request.
    pub api_reply: Mutex<Option<String>>,
    pub api_auths: Mutex<Vec<String>>,
    pub api_headers: Mutex<Vec<HeaderMap>>,
}

impl MockState {
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_exchange_delay(&self, delay: Duration) {
        self.exchange_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn push_api_status(&self, status: u16) {
        self.api_statuses.lock().unwrap().push_back(status);
    }

    pub fn set_api_reply(&self, body: &str) {
        *self.api_reply.lock().unwrap() = Some(body.to_string());
    }
}

pub struct MockServer {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let app = axum::Router::new()
            .route("/api/v1/oauth/token", post(exchange))
            .route("/api/v1/auth/refresh", post(refresh))
            .route("/api/v1/user", get(user))
            .route("/data", any(data))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(
            "mirim-client",
            "mirim-secret",
            "mirimapp://callback",
            vec!["profile".into(), "email".into()],
        )
        .with_server_url(&self.url)
    }
}

type MockRef = axum::extract::State<Arc<MockState>>;

async fn exchange(state: MockRef, Json(req): Json<Value>) -> Json<Value> {
    state.exchange_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_code.lock().unwrap() = req["code"].as_str().map(str::to_string);

    let delay = state.exchange_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let status = match state.exchange_status.load(Ordering::SeqCst) {
        0 => 200,
        s => s,
    };
    if status != 200 {
        return Json(json!({"status": status, "message": "invalid authorization code"}));
    }
    Json(json!({
        "status": 200,
        "data": {"access_token": "at_exchanged", "refresh_token": "rt_exchanged", "expires_in": 3600}
    }))
}

async fn refresh(state: MockRef, Json(req): Json<Value>) -> Response {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_refresh_token.lock().unwrap() =
        req["refreshToken"].as_str().map(str::to_string);

    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if state.fail_refresh.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": 401, "message": "refresh token revoked"})),
        )
            .into_response();
    }
    Json(json!({"status": 200, "data": {"accessToken": format!("at_refreshed_{n}"), "expiresIn": 3600}}))
        .into_response()
}

async fn user(state: MockRef, headers: HeaderMap) -> Response {
    state.user_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers).is_empty() {
        return (StatusCode::UNAUTHORIZED, "missing bearer").into_response();
    }
    Json(json!({
        "status": 200,
        "data": {"id": "u-1", "email": "student@e-mirim.hs.kr", "nickname": "mirim"}
    }))
    .into_response()
}

async fn data(state: MockRef, method: axum::http::Method, headers: HeaderMap, body: Bytes) -> Response {
    state.api_calls.fetch_add(1, Ordering::SeqCst);
    state.api_auths.lock().unwrap().push(bearer(&headers));
    state.api_headers.lock().unwrap().push(headers);

    let status = state
        .api_statuses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(200);
    let status = StatusCode::from_u16(status).unwrap();
    if !status.is_success() {
        return (status, "rejected").into_response();
    }

    if let Some(reply) = state.api_reply.lock().unwrap().clone() {
        return (status, reply).into_response();
    }
    let received: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(json!({"method": method.as_str(), "received": received})).into_response()
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Browser that forwards every launched URL to the test.
pub struct RecordingBrowser {
    tx: mpsc::UnboundedSender<String>,
}

impl RecordingBrowser {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl BrowserLauncher for RecordingBrowser {
    fn launch(&self, url: &str) -> oauth_client::Result<()> {
        let _ = self.tx.send(url.to_string());
        Ok(())
    }
}

/// Browser that always fails to open.
pub struct BrokenBrowser;

impl BrowserLauncher for BrokenBrowser {
    fn launch(&self, _url: &str) -> oauth_client::Result<()> {
        Err(oauth_client::Error::BrowserLaunch("no display".into()))
    }
}

/// Pull the `state` query parameter from an authorization URL.
pub fn state_param(url: &str) -> String {
    reqwest::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}
