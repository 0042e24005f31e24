//! Authorization flow state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `AuthorizationFlowController` owns the I/O implied by each action:
//! opening the browser, waiting for the redirect, exchanging the code.
//!
//! ```text
//! Idle -> AwaitingCallback -> Exchanging -> Complete
//!              |                  |
//!              +------------------+--> Failed
//! ```
//!
//! Only one flow runs at a time. `Complete` and `Failed` are terminal for
//! their flow but accept a new `Start`. A cancelled flow stops at whatever
//! step it is in; once the exchange result is being saved, it can no longer
//! be cancelled.

use std::sync::{Arc, Mutex};

use oauth_client::{
    CallbackParams, ClientConfig, Error, Result, TokenPair, TokenStore, UserProfile,
    build_authorization_url, exchange_code, fetch_user_info, generate_state, parse_callback,
    validate_callback,
};
use tokio::sync::{Notify, RwLock, oneshot};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::sync::MutexExt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlowState {
    #[default]
    Idle,
    /// Browser opened, listener registered
    AwaitingCallback { expected_state: String },
    /// Code received and validated; exchange in progress
    Exchanging,
    Complete,
    Failed(Error),
}

impl FlowState {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            FlowState::AwaitingCallback { .. } | FlowState::Exchanging
        )
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Login requested with a freshly generated nonce
    Start { state_nonce: String },
    /// Redirect arrived at the listener
    CallbackReceived(CallbackParams),
    /// Callback wait exceeded the configured timeout
    TimedOut,
    /// Caller abandoned the flow
    Cancelled,
    /// Tokens and profile persisted
    ExchangeSucceeded,
    /// Exchange, profile fetch, or persistence failed
    ExchangeFailed(Error),
    /// The flow could not proceed (browser launch, unreadable callback)
    Aborted(Error),
}

/// Actions the controller should execute after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Open the authorization URL and wait for the callback
    LaunchBrowser,
    /// Event refused; state unchanged
    Reject(Error),
    /// Exchange the authorization code
    ExchangeCode { code: String, state: String },
    /// Flow moved to `Failed`
    Fail(Error),
    /// Flow moved to `Complete`
    Complete,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: FlowState, event: FlowEvent) -> (FlowState, FlowAction) {
    match (state, event) {
        // --- Start ---
        (
            FlowState::Idle | FlowState::Complete | FlowState::Failed(_),
            FlowEvent::Start { state_nonce },
        ) => (
            FlowState::AwaitingCallback {
                expected_state: state_nonce,
            },
            FlowAction::LaunchBrowser,
        ),
        (state, FlowEvent::Start { .. }) => {
            (state, FlowAction::Reject(Error::LoginAlreadyInProgress))
        }

        // --- AwaitingCallback ---
        (FlowState::AwaitingCallback { expected_state }, FlowEvent::CallbackReceived(params)) => {
            match validate_callback(&params, &expected_state) {
                Ok(code) => (
                    FlowState::Exchanging,
                    FlowAction::ExchangeCode {
                        code,
                        state: expected_state,
                    },
                ),
                Err(e) => fail(e),
            }
        }
        (FlowState::AwaitingCallback { .. }, FlowEvent::TimedOut) => {
            fail(Error::AuthorizationTimedOut)
        }

        // --- Exchanging ---
        (FlowState::Exchanging, FlowEvent::ExchangeSucceeded) => {
            (FlowState::Complete, FlowAction::Complete)
        }
        (FlowState::Exchanging, FlowEvent::ExchangeFailed(e)) => fail(e),

        // --- Any in-progress state ---
        (state, FlowEvent::Cancelled) if state.is_in_progress() => fail(Error::LoginCancelled),
        (state, FlowEvent::Aborted(e)) if state.is_in_progress() => fail(e),

        // Stale event for a flow that already ended
        (state, _) => (state, FlowAction::None),
    }
}

fn fail(error: Error) -> (FlowState, FlowAction) {
    (FlowState::Failed(error.clone()), FlowAction::Fail(error))
}

/// Opens the authorization URL in a user agent.
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self, url: &str) -> Result<()>;
}

/// Result of a completed login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: UserProfile,
}

struct FlowSlot {
    state: FlowState,
    /// Sender half of the registered callback listener
    listener: Option<oneshot::Sender<String>>,
    /// Incremented on every accepted start; guards against stale writes
    flow_id: u64,
    /// Wakes the running login when it is cancelled mid-exchange
    cancel_signal: Option<Arc<Notify>>,
    /// The exchange result is being saved; cancelling is no longer possible
    committing: bool,
}

/// Drives one login at a time through the state machine.
///
/// Cheap to clone; clones share the flow.
#[derive(Clone)]
pub struct AuthorizationFlowController {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<TokenStore>,
    session: Arc<RwLock<Session>>,
    browser: Arc<dyn BrowserLauncher>,
    slot: Arc<Mutex<FlowSlot>>,
}

impl AuthorizationFlowController {
    /// `session` receives the outcome of a successful login.
    pub fn new(
        client: reqwest::Client,
        config: Arc<ClientConfig>,
        store: Arc<TokenStore>,
        session: Arc<RwLock<Session>>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            client,
            config,
            store,
            session,
            browser,
            slot: Arc::new(Mutex::new(FlowSlot {
                state: FlowState::Idle,
                listener: None,
                flow_id: 0,
                cancel_signal: None,
                committing: false,
            })),
        }
    }

    /// Run a full login: open the browser, wait for the redirect, exchange
    /// the code, fetch the profile, persist both and publish them to the
    /// session.
    ///
    /// Fails fast with `LoginAlreadyInProgress` if another login is running.
    /// Dropping the returned future abandons the flow: the listener is
    /// released and the state moves to `Failed(LoginCancelled)`.
    pub async fn login(&self) -> Result<LoginOutcome> {
        let nonce = generate_state();
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(Notify::new());

        let flow_id = {
            let mut slot = self.slot.lock_or_recover();
            let state = std::mem::take(&mut slot.state);
            let (state, action) = handle_event(
                state,
                FlowEvent::Start {
                    state_nonce: nonce.clone(),
                },
            );
            slot.state = state;
            if let FlowAction::Reject(e) = action {
                debug!("login rejected, another flow is in progress");
                return Err(e);
            }
            slot.flow_id += 1;
            slot.listener = Some(tx);
            slot.cancel_signal = Some(cancelled.clone());
            slot.committing = false;
            slot.flow_id
        };
        let _guard = ListenerGuard {
            slot: self.slot.clone(),
            flow_id,
        };

        let url = match build_authorization_url(&self.config, &nonce) {
            Ok(url) => url,
            Err(e) => return Err(self.abort(flow_id, e)),
        };
        if let Err(e) = self.browser.launch(&url) {
            warn!(error = %e, "failed to open authorization URL");
            return Err(self.abort(flow_id, e));
        }
        info!(flow_id, "waiting for authorization callback");

        let uri = match tokio::time::timeout(self.config.callback_timeout(), rx).await {
            Ok(Ok(uri)) => uri,
            Ok(Err(_)) => {
                self.apply(flow_id, FlowEvent::Cancelled);
                return Err(Error::LoginCancelled);
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.callback_timeout_secs,
                    "authorization callback timed out"
                );
                self.apply(flow_id, FlowEvent::TimedOut);
                return Err(Error::AuthorizationTimedOut);
            }
        };

        let params = match parse_callback(&uri) {
            Ok(params) => params,
            Err(e) => return Err(self.abort(flow_id, e)),
        };

        let (code, state) = match self.apply(flow_id, FlowEvent::CallbackReceived(params)) {
            FlowAction::ExchangeCode { code, state } => (code, state),
            FlowAction::Fail(e) => {
                warn!(error = %e, "authorization callback rejected");
                return Err(e);
            }
            // Flow was cancelled between delivery and validation
            _ => return Err(Error::LoginCancelled),
        };

        // cancel() has already moved the state to Failed
        let exchanged = tokio::select! {
            result = self.exchange(&code, &state) => result,
            _ = cancelled.notified() => {
                info!(flow_id, "login cancelled during code exchange");
                return Err(Error::LoginCancelled);
            }
        };

        let outcome = match exchanged {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "authorization code exchange failed");
                self.apply(flow_id, FlowEvent::ExchangeFailed(e.clone()));
                return Err(e);
            }
        };

        self.commit(flow_id, &outcome).await?;
        info!(user_id = %outcome.user.id, "login complete");
        Ok(outcome)
    }

    async fn exchange(&self, code: &str, state: &str) -> Result<LoginOutcome> {
        let tokens = exchange_code(&self.client, &self.config, code, state).await?;
        let user = fetch_user_info(&self.client, &self.config, tokens.access_token()).await?;
        Ok(LoginOutcome { tokens, user })
    }

    /// Persist the outcome and publish it as a new session.
    ///
    /// Holds the session write lock throughout so no refresh of the previous
    /// session can land in between.
    async fn commit(&self, flow_id: u64, outcome: &LoginOutcome) -> Result<()> {
        if !self.begin_commit(flow_id) {
            debug!(flow_id, "login cancelled before its result was saved");
            return Err(Error::LoginCancelled);
        }

        let mut session = self.session.write().await;
        if let Err(e) = self.store.save(&outcome.tokens, Some(&outcome.user)).await {
            warn!(error = %e, "failed to persist login");
            self.apply(flow_id, FlowEvent::ExchangeFailed(e.clone()));
            return Err(e);
        }

        if self.apply(flow_id, FlowEvent::ExchangeSucceeded) != FlowAction::Complete {
            warn!(flow_id, "login superseded while saving, discarding");
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "failed to discard superseded login");
            }
            return Err(Error::LoginCancelled);
        }

        session.epoch += 1;
        session.user = Some(outcome.user.clone());
        session.tokens = Some(outcome.tokens.clone());
        Ok(())
    }

    /// Claim the current flow for saving unless it was cancelled.
    fn begin_commit(&self, flow_id: u64) -> bool {
        let mut slot = self.slot.lock_or_recover();
        if slot.flow_id != flow_id || slot.state != FlowState::Exchanging {
            return false;
        }
        slot.committing = true;
        slot.cancel_signal = None;
        true
    }

    /// Hand a redirect URI to the waiting login.
    ///
    /// Returns false when no login is waiting (none started, already
    /// delivered, or abandoned).
    pub fn deliver_callback(&self, uri: &str) -> bool {
        let listener = self.slot.lock_or_recover().listener.take();
        match listener {
            Some(tx) => tx.send(uri.to_string()).is_ok(),
            None => {
                debug!("callback received with no pending login");
                false
            }
        }
    }

    /// Abandon the running login.
    ///
    /// Returns false if none is running or its result is already being saved.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock_or_recover();
        if !slot.state.is_in_progress() || slot.committing {
            return false;
        }
        slot.listener = None;
        if let Some(signal) = slot.cancel_signal.take() {
            signal.notify_one();
        }
        let state = std::mem::take(&mut slot.state);
        slot.state = handle_event(state, FlowEvent::Cancelled).0;
        info!("login cancelled");
        true
    }

    pub fn state(&self) -> FlowState {
        self.slot.lock_or_recover().state.clone()
    }

    /// Whether a callback listener is registered.
    pub fn has_listener(&self) -> bool {
        self.slot.lock_or_recover().listener.is_some()
    }

    /// Apply `event` if `flow_id` is still the current flow.
    fn apply(&self, flow_id: u64, event: FlowEvent) -> FlowAction {
        let mut slot = self.slot.lock_or_recover();
        if slot.flow_id != flow_id {
            return FlowAction::None;
        }
        let state = std::mem::take(&mut slot.state);
        let (state, action) = handle_event(state, event);
        slot.state = state;
        action
    }

    fn abort(&self, flow_id: u64, error: Error) -> Error {
        self.apply(flow_id, FlowEvent::Aborted(error.clone()));
        error
    }
}

/// Deregisters the listener when a login exits by any path, including
/// the future being dropped.
struct ListenerGuard {
    slot: Arc<Mutex<FlowSlot>>,
    flow_id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock_or_recover();
        if slot.flow_id != self.flow_id {
            return;
        }
        slot.listener = None;
        slot.cancel_signal = None;
        slot.committing = false;
        if slot.state.is_in_progress() {
            let state = std::mem::take(&mut slot.state);
            slot.state = handle_event(state, FlowEvent::Cancelled).0;
            debug!(flow_id = self.flow_id, "login abandoned");
        }
    }
}
