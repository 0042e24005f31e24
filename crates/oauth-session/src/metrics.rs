//! Session metrics
//!
//! Emitted through the `metrics` facade; a no-op unless the host installs a
//! recorder.
//!
//! - `oauth_refresh_total` (counter): label `outcome` = `success` | `failure`
//! - `oauth_login_total` (counter): label `outcome` = `success` | error kind
//! - `oauth_request_retries_total` (counter): 401-triggered retries

use oauth_client::Error;

pub fn record_refresh(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("oauth_refresh_total", "outcome" => outcome).increment(1);
}

/// `None` records a successful login.
pub fn record_login(error: Option<&Error>) {
    let outcome = error.map_or("success", error_kind);
    metrics::counter!("oauth_login_total", "outcome" => outcome).increment(1);
}

pub fn record_request_retry() {
    metrics::counter!("oauth_request_retries_total").increment(1);
}

/// Stable label for an error variant.
pub fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::NotAuthenticated => "not_authenticated",
        Error::SessionExpired(_) => "session_expired",
        Error::AuthorizationDenied(_) => "authorization_denied",
        Error::StateMismatch => "state_mismatch",
        Error::AuthorizationTimedOut => "timed_out",
        Error::LoginCancelled => "cancelled",
        Error::LoginAlreadyInProgress => "already_in_progress",
        Error::TokenExchangeFailed { .. } => "token_exchange_failed",
        Error::RefreshFailed { .. } => "refresh_failed",
        Error::RequestFailed { .. } => "request_failed",
        Error::MalformedServerResponse(_) => "malformed_response",
        Error::UnsupportedMethod(_) => "unsupported_method",
        Error::Storage(_) => "storage",
        Error::Http(_) => "http",
        Error::BrowserLaunch(_) => "browser_launch",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_refresh(true);
        record_login(Some(&Error::StateMismatch));
        record_request_retry();
    }

    #[test]
    fn counters_render_with_outcome_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        {
            let _guard = metrics::set_default_local_recorder(&recorder);
            record_refresh(true);
            record_refresh(false);
            record_login(None);
            record_login(Some(&Error::AuthorizationTimedOut));
            record_request_retry();
        }

        let output = handle.render();
        assert!(
            output.contains(r#"oauth_refresh_total{outcome="success"} 1"#),
            "output: {output}"
        );
        assert!(output.contains(r#"oauth_refresh_total{outcome="failure"} 1"#));
        assert!(output.contains(r#"oauth_login_total{outcome="timed_out"} 1"#));
        assert!(output.contains("oauth_request_retries_total 1"));
    }

    #[test]
    fn error_kinds_are_distinct_for_flow_failures() {
        assert_eq!(error_kind(&Error::StateMismatch), "state_mismatch");
        assert_eq!(error_kind(&Error::LoginCancelled), "cancelled");
        assert_ne!(
            error_kind(&Error::AuthorizationDenied("x".into())),
            error_kind(&Error::AuthorizationTimedOut)
        );
    }
}
