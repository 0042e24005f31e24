//! Session facade
//!
//! The host-facing surface: login, logout, status, profile refresh, and
//! authenticated calls. Owns the in-memory `Session`; the store holds only
//! its durable projection.

use std::collections::HashMap;
use std::sync::Arc;

use oauth_client::{ClientConfig, Error, Result, TokenPair, TokenStore, UserProfile};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::executor::{AuthenticatedRequestExecutor, StructuredResponse};
use crate::flow::{AuthorizationFlowController, BrowserLauncher, FlowState};
use crate::lifecycle::TokenLifecycle;

/// Current user and tokens held in memory.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub tokens: Option<TokenPair>,
    /// Bumped by every login and logout. Work started under an older epoch
    /// must not write its result.
    pub(crate) epoch: u64,
}

impl Session {
    /// Both present and the tokens not expired.
    pub fn is_valid(&self) -> bool {
        self.user.is_some() && self.tokens.as_ref().is_some_and(|t| !t.is_expired())
    }
}

/// Cheap to clone; clones share the session, flow, and refresh state.
#[derive(Clone)]
pub struct SessionFacade {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<TokenStore>,
    session: Arc<RwLock<Session>>,
    lifecycle: TokenLifecycle,
    flow: AuthorizationFlowController,
    executor: AuthenticatedRequestExecutor,
}

impl SessionFacade {
    pub fn new(
        config: ClientConfig,
        store: TokenStore,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let client = config.http_client()?;
        let config = Arc::new(config);
        let store = Arc::new(store);
        let session = Arc::new(RwLock::new(Session::default()));

        let lifecycle = TokenLifecycle::new(
            client.clone(),
            config.clone(),
            store.clone(),
            session.clone(),
        );
        let flow = AuthorizationFlowController::new(
            client.clone(),
            config.clone(),
            store.clone(),
            session.clone(),
            browser,
        );
        let executor =
            AuthenticatedRequestExecutor::new(client.clone(), config.clone(), lifecycle.clone());

        Ok(Self {
            client,
            config,
            store,
            session,
            lifecycle,
            flow,
            executor,
        })
    }

    /// Run the browser login. On success the new session is already
    /// published and persisted.
    pub async fn login(&self) -> Result<UserProfile> {
        let result = self.flow.login().await;
        crate::metrics::record_login(result.as_ref().err());
        Ok(result?.user)
    }

    /// Clear storage and memory.
    ///
    /// Memory is cleared even when the store fails; the store error is
    /// still returned. A refresh still in flight is discarded.
    pub async fn logout(&self) -> Result<()> {
        let cleared = {
            let mut session = self.session.write().await;
            self.lifecycle.discard_in_flight();
            let cleared = self.store.clear().await;
            let epoch = session.epoch + 1;
            *session = Session {
                epoch,
                ..Session::default()
            };
            cleared
        };
        match &cleared {
            Ok(()) => info!("logged out"),
            Err(e) => warn!(error = %e, "logged out, but stored credentials could not be removed"),
        }
        cleared
    }

    /// In-memory check only; no I/O.
    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.is_valid()
    }

    /// Recover a session from memory, then storage (refreshing if expired).
    ///
    /// Returns false when nothing is stored. A stored session that cannot be
    /// recovered is cleared from memory and storage.
    pub async fn ensure_authenticated(&self) -> bool {
        if self.is_authenticated().await {
            return true;
        }

        let epoch = self.session.read().await.epoch;
        let tokens = match self.lifecycle.get_valid().await {
            Ok(tokens) => tokens,
            Err(Error::NotAuthenticated) => return false,
            Err(e) => {
                warn!(error = %e, "stored session unrecoverable, clearing");
                let _ = self.logout().await;
                return false;
            }
        };

        let cached = self.session.read().await.user.clone();
        let (user, fetched) = match cached {
            Some(user) => (user, false),
            None => match self.store.load().await.1 {
                Some(user) => (user, false),
                None => match self.fetch_profile(&tokens).await {
                    Ok(user) => (user, true),
                    Err(e) => {
                        warn!(error = %e, "could not restore user profile");
                        let mut session = self.session.write().await;
                        if session.epoch == epoch {
                            session.user = None;
                            session.tokens = None;
                        }
                        return false;
                    }
                },
            },
        };

        if !self.adopt_profile(epoch, &user, fetched).await {
            return false;
        }
        info!(user_id = %user.id, "session restored");
        true
    }

    /// Fetch the profile again, cache it, and return it.
    pub async fn refresh_profile(&self) -> Result<UserProfile> {
        let epoch = self.session.read().await.epoch;
        let tokens = self.lifecycle.get_valid().await?;
        let user = self.fetch_profile(&tokens).await?;
        if !self.adopt_profile(epoch, &user, true).await {
            return Err(Error::NotAuthenticated);
        }
        Ok(user)
    }

    /// Bearer-authenticated call to `endpoint` under the server URL.
    pub async fn call(
        &self,
        endpoint: &str,
        method: &str,
        body: Option<&Value>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<StructuredResponse> {
        self.executor.execute(endpoint, method, body, headers).await
    }

    /// A valid access token, refreshing if needed.
    pub async fn access_token(&self) -> Result<String> {
        let tokens = self.lifecycle.get_valid().await?;
        Ok(tokens.access_token().to_string())
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.session.read().await.user.clone()
    }

    /// Abandon a running login. Returns false if none is running or its
    /// result is already being saved.
    pub fn cancel_login(&self) -> bool {
        self.flow.cancel()
    }

    /// Forward a redirect URI to the waiting login.
    pub fn deliver_callback(&self, uri: &str) -> bool {
        self.flow.deliver_callback(uri)
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow.state()
    }

    pub fn flow(&self) -> &AuthorizationFlowController {
        &self.flow
    }

    /// Cache `user` (and persist it when `persist`) unless a login or
    /// logout happened since `epoch`.
    async fn adopt_profile(&self, epoch: u64, user: &UserProfile, persist: bool) -> bool {
        let mut session = self.session.write().await;
        if session.epoch != epoch {
            debug!("session changed while fetching profile, discarding");
            return false;
        }
        if persist {
            if let Err(e) = self.store.save_user(user).await {
                warn!(error = %e, "failed to persist user profile");
            }
        }
        session.user = Some(user.clone());
        true
    }

    /// User info with one refresh-and-retry on 401.
    async fn fetch_profile(&self, tokens: &TokenPair) -> Result<UserProfile> {
        let user = match oauth_client::fetch_user_info(&self.client, &self.config, tokens.access_token())
            .await
        {
            Err(e) if e.is_unauthorized() => {
                crate::metrics::record_request_retry();
                let renewed = self.lifecycle.renew_rejected(tokens).await?;
                oauth_client::fetch_user_info(&self.client, &self.config, renewed.access_token())
                    .await?
            }
            other => other?,
        };
        Ok(user)
    }
}
