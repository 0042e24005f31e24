//! OAuth2 Authorization Code client
//!
//! Stateless protocol pieces for the authorization server: authorization URL
//! and state nonce generation, callback parsing, token exchange, token
//! refresh, user info, and the encrypted credential store. The stateful
//! session engine (single-flight refresh, login state machine) lives in the
//! `oauth-session` crate and composes these functions.
//!
//! Credential flow:
//! 1. `authorize::generate_state()` produces a fresh nonce per login
//! 2. User consents via `authorize::build_authorization_url()`
//! 3. The redirect callback is checked with `authorize::validate_callback()`
//! 4. `token::exchange_code()` trades the code for a `TokenPair`
//! 5. `token::fetch_user_info()` loads the `UserProfile`
//! 6. Both are persisted via `store::TokenStore::save()`
//! 7. Expired pairs are renewed with `token::refresh_tokens()`

pub mod authorize;
pub mod config;
pub mod constants;
pub mod error;
pub mod store;
pub mod token;
pub mod types;

pub use authorize::{
    CallbackParams, build_authorization_url, generate_state, parse_callback, validate_callback,
};
pub use config::ClientConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use store::{FileKeyProvider, KeyProvider, TokenStore};
pub use token::{exchange_code, fetch_user_info, refresh_tokens};
pub use types::{TokenPair, UserProfile};

#[cfg(feature = "keyring")]
pub use store::KeyringKeyProvider;
