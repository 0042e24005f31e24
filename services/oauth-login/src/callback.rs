//! Loopback redirect receiver
//!
//! The authorization server redirects the browser to
//! `http://127.0.0.1:<port><path>?code=...&state=...`. The handler hands the
//! full URI to the waiting login and answers the browser with a short page.
//! Validation (state, code, error params) happens in the flow controller.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::Html;
use axum::routing::get;
use oauth_session::SessionFacade;
use tracing::{info, warn};

const RECEIVED_PAGE: &str = "<!doctype html><html><body>\
<h1>Authorization received</h1><p>You can close this window and return to the terminal.</p>\
</body></html>";

const NO_LOGIN_PAGE: &str = "<!doctype html><html><body>\
<h1>No login in progress</h1><p>This authorization response was not expected.</p>\
</body></html>";

pub fn router(facade: SessionFacade, path: &str) -> Router {
    Router::new()
        .route(path, get(receive))
        .with_state(facade)
}

async fn receive(State(facade): State<SessionFacade>, uri: Uri) -> (StatusCode, Html<&'static str>) {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let redirect = format!("http://localhost{path_and_query}");

    if facade.deliver_callback(&redirect) {
        info!(path = %uri.path(), "authorization callback delivered");
        (StatusCode::OK, Html(RECEIVED_PAGE))
    } else {
        warn!(path = %uri.path(), "authorization callback with no pending login");
        (StatusCode::CONFLICT, Html(NO_LOGIN_PAGE))
    }
}
