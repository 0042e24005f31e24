//! Token validity and single-flight refresh
//!
//! `get_valid()` always yields a non-expired `TokenPair` or a clear failure:
//! memory first, then the encrypted store, then a refresh. Refreshes are
//! single-flight: the first caller that needs one spawns the refresh task and
//! installs a shared handle to it in `in_flight`; every concurrent caller
//! clones and awaits that same handle, so the refresh endpoint sees exactly
//! one request and all callers observe the same pair (or the same error).
//! The refresh runs as its own task, so it completes even if every caller
//! gives up.
//!
//! Each refresh is tied to the session epoch it started under. A login or
//! logout in the meantime bumps the epoch, and the stale result is dropped
//! instead of being persisted or published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use oauth_client::{ClientConfig, Error, Result, TokenPair, TokenStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::sync::MutexExt;

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenPair>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    refresh: RefreshFuture,
}

/// Guarantees callers a non-expired token pair.
///
/// Cheap to clone; clones share the in-flight refresh and the session.
#[derive(Clone)]
pub struct TokenLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<TokenStore>,
    session: Arc<RwLock<Session>>,
    in_flight: Mutex<Option<InFlight>>,
    next_refresh_id: AtomicU64,
}

impl TokenLifecycle {
    pub fn new(
        client: reqwest::Client,
        config: Arc<ClientConfig>,
        store: Arc<TokenStore>,
        session: Arc<RwLock<Session>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                store,
                session,
                in_flight: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    /// A non-expired token pair.
    ///
    /// - In-memory pair still valid: returned as-is.
    /// - Nothing persisted: `NotAuthenticated`.
    /// - Persisted pair valid: cached and returned.
    /// - Persisted pair expired: refreshed (single-flight), persisted, cached.
    ///   A failed refresh is `SessionExpired`; stored credentials are left
    ///   untouched for the caller to inspect or clear.
    ///
    /// A logout while this runs yields `NotAuthenticated`.
    pub async fn get_valid(&self) -> Result<TokenPair> {
        let epoch = {
            let session = self.inner.session.read().await;
            if let Some(tokens) = session.tokens.as_ref().filter(|t| !t.is_expired()) {
                return Ok(tokens.clone());
            }
            session.epoch
        };

        let (stored, _) = self.inner.store.load().await;
        let stored = stored.ok_or(Error::NotAuthenticated)?;

        if !stored.is_expired() {
            let mut session = self.inner.session.write().await;
            if session.epoch != epoch {
                return live_tokens(&session);
            }
            session.tokens = Some(stored.clone());
            return Ok(stored);
        }

        // A refresh may have finished while the store was read
        if let Some(tokens) = self.cached().await {
            if !tokens.is_expired() {
                return Ok(tokens);
            }
        }

        debug!("stored token expired, refreshing");
        self.refresh_shared(stored.refresh_token().to_string(), epoch)
            .await
            .map_err(into_session_expired)
    }

    /// One POST to the refresh endpoint. No caching, no persistence.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        oauth_client::refresh_tokens(&self.inner.client, &self.inner.config, refresh_token).await
    }

    /// Replace a token the server rejected (401) with a fresh one.
    ///
    /// If another caller already replaced it, the newer pair is returned
    /// without a second refresh.
    pub async fn renew_rejected(&self, rejected: &TokenPair) -> Result<TokenPair> {
        let epoch = {
            let session = self.inner.session.read().await;
            if let Some(current) = &session.tokens {
                if !current.same_access_token(rejected) && !current.is_expired() {
                    debug!("rejected token already replaced");
                    return Ok(current.clone());
                }
            }
            session.epoch
        };

        self.invalidate(rejected).await;
        self.refresh_shared(rejected.refresh_token().to_string(), epoch)
            .await
            .map_err(into_session_expired)
    }

    /// Drop the cached pair if it is still the rejected one.
    pub async fn invalidate(&self, rejected: &TokenPair) {
        let mut session = self.inner.session.write().await;
        if session
            .tokens
            .as_ref()
            .is_some_and(|t| t.same_access_token(rejected))
        {
            session.tokens = None;
            debug!("invalidated cached token");
        }
    }

    /// Forget the in-flight refresh so later callers start a new one.
    ///
    /// The running task still finishes, but its result is only kept if the
    /// session epoch has not moved on.
    pub fn discard_in_flight(&self) {
        if self.inner.in_flight.lock_or_recover().take().is_some() {
            debug!("discarded in-flight refresh");
        }
    }

    async fn cached(&self) -> Option<TokenPair> {
        self.inner.session.read().await.tokens.clone()
    }

    /// Join the in-flight refresh for `epoch`, or start one.
    async fn refresh_shared(&self, refresh_token: String, epoch: u64) -> Result<TokenPair> {
        let refresh = {
            let mut slot = self.inner.in_flight.lock_or_recover();
            let joinable = slot
                .as_ref()
                .filter(|current| current.epoch == epoch)
                .map(|current| current.refresh.clone());
            match joinable {
                Some(refresh) => {
                    debug!("joining in-flight refresh");
                    refresh
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(run_refresh(
                        self.inner.clone(),
                        refresh_token,
                        epoch,
                        id,
                    ));
                    let refresh = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(Error::Http(format!("token refresh task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        id,
                        epoch,
                        refresh: refresh.clone(),
                    });
                    refresh
                }
            }
        };

        refresh.await
    }
}

/// Body of the spawned refresh task. Vacates `in_flight` when done.
async fn run_refresh(
    inner: Arc<Inner>,
    refresh_token: String,
    epoch: u64,
    id: u64,
) -> Result<TokenPair> {
    let result = refresh_and_publish(&inner, &refresh_token, epoch).await;

    let mut slot = inner.in_flight.lock_or_recover();
    if slot.as_ref().is_some_and(|current| current.id == id) {
        *slot = None;
    }
    result
}

/// Refresh, persist, then publish to the session.
///
/// Persisting and publishing happen under the session write lock and only
/// if the epoch is unchanged.
async fn refresh_and_publish(inner: &Inner, refresh_token: &str, epoch: u64) -> Result<TokenPair> {
    let result = oauth_client::refresh_tokens(&inner.client, &inner.config, refresh_token).await;
    crate::metrics::record_refresh(result.is_ok());

    let tokens = match result {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "token refresh failed");
            return Err(e);
        }
    };

    let mut session = inner.session.write().await;
    if session.epoch != epoch {
        info!("session changed during token refresh, discarding result");
        return Err(Error::NotAuthenticated);
    }
    if let Err(e) = inner.store.save_tokens(&tokens).await {
        warn!(error = %e, "failed to persist refreshed token");
    }
    session.tokens = Some(tokens.clone());
    info!(expires_in = tokens.expires_in(), "token refresh succeeded");
    Ok(tokens)
}

/// The session's pair if it is still usable.
fn live_tokens(session: &Session) -> Result<TokenPair> {
    session
        .tokens
        .clone()
        .filter(|t| !t.is_expired())
        .ok_or(Error::NotAuthenticated)
}

fn into_session_expired(e: Error) -> Error {
    match e {
        Error::NotAuthenticated => e,
        other => Error::SessionExpired(other.to_string()),
    }
}
