//! Token pair and user profile
//!
//! Both types are immutable snapshots. A refresh produces a new `TokenPair`;
//! a profile fetch produces a new `UserProfile`.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

/// Access/refresh token pair with its issue time.
///
/// `expires_in` is a delta in seconds from `issued_at`. Zero or negative
/// values mean the pair is already expired when issued.
#[derive(Clone)]
pub struct TokenPair {
    access_token: Secret<String>,
    refresh_token: Secret<String>,
    expires_in: i64,
    issued_at: SystemTime,
}

impl TokenPair {
    /// A pair issued now.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
    ) -> Self {
        Self::issued_at(access_token, refresh_token, expires_in, SystemTime::now())
    }

    /// A pair issued at an explicit instant (restored from storage, or tests).
    pub fn issued_at(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
        issued_at: SystemTime,
    ) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            expires_in,
            issued_at,
        }
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose()
    }

    pub fn refresh_token(&self) -> &str {
        self.refresh_token.expose()
    }

    pub fn expires_in(&self) -> i64 {
        self.expires_in
    }

    pub fn issue_time(&self) -> SystemTime {
        self.issued_at
    }

    /// Issue time as unix milliseconds, for persistence.
    pub fn issued_at_millis(&self) -> u64 {
        self.issued_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Absolute expiry instant: `issued_at + expires_in`.
    pub fn expires_at(&self) -> SystemTime {
        let delta = Duration::from_secs(self.expires_in.unsigned_abs());
        if self.expires_in >= 0 {
            self.issued_at.checked_add(delta).unwrap_or(self.issued_at)
        } else {
            self.issued_at.checked_sub(delta).unwrap_or(UNIX_EPOCH)
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// `now >= issued_at + expires_in`
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at()
    }

    /// A copy of this pair with a new access token, keeping the refresh token
    /// unless the server rotated it.
    pub fn renewed(
        &self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: i64,
    ) -> Self {
        let refresh = refresh_token
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.refresh_token().to_string());
        Self::new(access_token, refresh, expires_in)
    }

    /// Whether both pairs carry the same access token.
    pub fn same_access_token(&self, other: &TokenPair) -> bool {
        self.access_token() == other.access_token()
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &self.access_token)
            .field("refresh_token", &self.refresh_token)
            .field("expires_in", &self.expires_in)
            .field("issued_at_ms", &self.issued_at_millis())
            .finish()
    }
}

/// Account profile returned by the user info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_graduated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn non_positive_lifetime_is_expired_immediately() {
        for expires_in in [-1, 0] {
            let pair = TokenPair::new("at", "rt", expires_in);
            assert!(pair.is_expired(), "expires_in={expires_in} must be expired");
        }
    }

    #[test]
    fn positive_lifetime_is_valid_after_issue() {
        let pair = TokenPair::new("at", "rt", 3600);
        assert!(!pair.is_expired());
    }

    #[test]
    fn expiry_boundary() {
        let t = 1_700_000_000;
        let pair = TokenPair::issued_at("at", "rt", 3600, at(t));
        assert!(!pair.is_expired_at(at(t + 3599)));
        assert!(pair.is_expired_at(at(t + 3600)));
        assert!(pair.is_expired_at(at(t + 3601)));
    }

    #[test]
    fn renewed_keeps_refresh_token_unless_rotated() {
        let pair = TokenPair::new("at_old", "rt_keep", 0);

        let kept = pair.renewed("at_new", None, 3600);
        assert_eq!(kept.access_token(), "at_new");
        assert_eq!(kept.refresh_token(), "rt_keep");
        assert!(!kept.is_expired());

        let rotated = pair.renewed("at_new", Some("rt_new".into()), 3600);
        assert_eq!(rotated.refresh_token(), "rt_new");

        let blank = pair.renewed("at_new", Some(String::new()), 3600);
        assert_eq!(blank.refresh_token(), "rt_keep");
    }

    #[test]
    fn debug_redacts_tokens() {
        let pair = TokenPair::new("at_secret_value", "rt_secret_value", 3600);
        let debug = format!("{pair:?}");
        assert!(!debug.contains("at_secret_value"));
        assert!(!debug.contains("rt_secret_value"));
        assert!(debug.contains("expires_in: 3600"));
    }

    #[test]
    fn issued_at_millis_roundtrips_through_system_time() {
        let pair = TokenPair::issued_at("at", "rt", 10, at(1_700_000_000));
        assert_eq!(pair.issued_at_millis(), 1_700_000_000_000);
    }

    #[test]
    fn profile_uses_camel_case_fields() {
        let json = r#"{
            "id": "u-1",
            "email": "student@e-mirim.hs.kr",
            "nickname": "mirim",
            "major": "software",
            "isGraduated": false,
            "admission": "2024",
            "role": "student",
            "generation": 1
        }"#;
        let user: UserProfile = serde_json::from_str(json).unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(user.is_graduated, Some(false));
        assert_eq!(user.generation, Some(1));

        let back = serde_json::to_value(&user).unwrap();
        assert_eq!(back["isGraduated"], false);
    }

    #[test]
    fn profile_optional_fields_may_be_absent() {
        let user: UserProfile =
            serde_json::from_str(r#"{"id":"u-2","email":"a@b.c"}"#).unwrap();
        assert_eq!(user.nickname, None);
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, r#"{"id":"u-2","email":"a@b.c"}"#);
    }

    #[test]
    fn profile_requires_id_and_email() {
        let missing_email = serde_json::from_str::<UserProfile>(r#"{"id":"u-3"}"#);
        assert!(missing_email.is_err());
    }
}
