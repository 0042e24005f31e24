//! Authorization server endpoints and storage identifiers
//!
//! Paths are relative to the configured `server_url`. The storage keys name
//! the two encrypted records inside the store namespace; changing them
//! orphans existing sessions.

/// Default authorization server
pub const DEFAULT_SERVER_URL: &str = "https://api-auth.mmhs.app";

/// Browser-navigated authorization endpoint
pub const AUTHORIZE_PATH: &str = "/api/v1/oauth/authorize";

/// Authorization code exchange endpoint
pub const TOKEN_PATH: &str = "/api/v1/oauth/token";

/// Refresh endpoint. Note the different prefix from the token endpoint.
pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Bearer-authenticated profile endpoint
pub const USER_INFO_PATH: &str = "/api/v1/user";

/// Delimiter used to join scopes in the authorization URL and exchange body
pub const DEFAULT_SCOPE_DELIMITER: &str = ",";

/// Lifetime assumed when the server omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Application-level success status inside response envelopes
pub const ENVELOPE_OK: i64 = 200;

/// Namespace directory for the encrypted records
pub const STORE_NAMESPACE: &str = "oauth_session";

/// Record key for the token pair
pub const TOKENS_KEY: &str = "oauth_tokens";

/// Record key for the cached user profile
pub const USER_KEY: &str = "oauth_user";
