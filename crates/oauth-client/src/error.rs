//! Error taxonomy for authentication and token lifecycle operations

/// Errors surfaced to the host application.
///
/// `Clone` so that every caller joined on a shared refresh observes the same
/// failure. Server-provided status codes and bodies are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("authorization callback state does not match the issued state")]
    StateMismatch,

    #[error("timed out waiting for the authorization callback")]
    AuthorizationTimedOut,

    #[error("login cancelled")]
    LoginCancelled,

    #[error("a login is already in progress")]
    LoginAlreadyInProgress,

    #[error("token exchange failed ({code}): {body}")]
    TokenExchangeFailed { code: u16, body: String },

    #[error("token refresh failed ({code}): {body}")]
    RefreshFailed { code: u16, body: String },

    #[error("request failed ({code}): {body}")]
    RequestFailed { code: u16, body: String },

    #[error("malformed server response: {0}")]
    MalformedServerResponse(String),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to open browser: {0}")]
    BrowserLaunch(String),
}

impl Error {
    /// Server-provided status code, if this error carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::TokenExchangeFailed { code, .. }
            | Error::RefreshFailed { code, .. }
            | Error::RequestFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for a 401 from a bearer-authenticated request.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::RequestFailed { code: 401, .. })
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_carry_code_and_body() {
        let err = Error::TokenExchangeFailed {
            code: 400,
            body: "invalid_grant".into(),
        };
        assert_eq!(err.status_code(), Some(400));
        assert_eq!(err.to_string(), "token exchange failed (400): invalid_grant");
    }

    #[test]
    fn only_request_401_is_unauthorized() {
        let unauthorized = Error::RequestFailed {
            code: 401,
            body: String::new(),
        };
        assert!(unauthorized.is_unauthorized());

        let refresh_401 = Error::RefreshFailed {
            code: 401,
            body: String::new(),
        };
        assert!(!refresh_401.is_unauthorized());
        assert!(!Error::NotAuthenticated.is_unauthorized());
    }

    #[test]
    fn local_errors_have_no_status_code() {
        assert_eq!(Error::StateMismatch.status_code(), None);
        assert_eq!(Error::Storage("disk full".into()).status_code(), None);
    }
}
