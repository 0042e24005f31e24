//! Stateful OAuth session engine
//!
//! Builds on the stateless `oauth-client` protocol functions:
//! - `lifecycle::TokenLifecycle`: valid-token guarantee with single-flight refresh
//! - `flow::AuthorizationFlowController`: one-at-a-time login state machine
//!   with an owned, revocable callback listener
//! - `executor::AuthenticatedRequestExecutor`: bearer calls with one
//!   refresh-and-retry on 401
//! - `session::SessionFacade`: the login/logout/status/call surface for hosts
//!
//! Login lifecycle:
//! 1. Host calls `SessionFacade::login()`; the controller opens the browser
//! 2. Host forwards the redirect URI to `SessionFacade::deliver_callback()`
//! 3. Code is exchanged, profile fetched, both persisted encrypted
//! 4. `SessionFacade::call()` obtains a valid token, refreshing when expired
//! 5. `SessionFacade::logout()` clears memory and storage

pub mod executor;
pub mod flow;
pub mod lifecycle;
pub mod metrics;
pub mod session;
mod sync;

#[cfg(test)]
mod test_support;

pub use executor::{AuthenticatedRequestExecutor, Method, StructuredResponse};
pub use flow::{
    AuthorizationFlowController, BrowserLauncher, FlowAction, FlowEvent, FlowState, LoginOutcome,
    handle_event,
};
pub use lifecycle::TokenLifecycle;
pub use oauth_client::{Error, Result};
pub use session::{Session, SessionFacade};
