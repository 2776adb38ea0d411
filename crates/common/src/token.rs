//! OAuth token value shared by the store, providers and the bucket pool
//!
//! A token is immutable once issued. Refreshing never edits a token in place;
//! the refreshed token replaces the stored one wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default `token_type` for bearer tokens.
pub const BEARER: &str = "Bearer";

/// An issued OAuth access token and the material needed to renew it.
///
/// `expiry` is a unix timestamp in seconds (absolute, not a delta). An empty
/// `refresh_token` means the token cannot be refreshed and the bucket needs
/// interactive authentication once it expires.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expiry: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    BEARER.to_string()
}

impl OAuthToken {
    /// Bearer token with no scope.
    pub fn bearer(access_token: impl Into<String>, refresh_token: impl Into<String>, expiry: u64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry,
            token_type: default_token_type(),
            scope: None,
        }
    }

    /// Seconds of lifetime left at `now` (negative once expired).
    pub fn remaining_secs(&self, now: u64) -> i64 {
        let expiry = i64::try_from(self.expiry).unwrap_or(i64::MAX);
        expiry.saturating_sub(i64::try_from(now).unwrap_or(i64::MAX))
    }

    /// A token is expired when no lifetime remains.
    pub fn is_expired(&self, now: u64) -> bool {
        self.remaining_secs(now) <= 0
    }

    pub fn is_refreshable(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Replacement token from a refresh response.
    ///
    /// Token endpoints may omit the refresh token when they do not rotate it;
    /// the previous refresh token stays valid in that case.
    pub fn renewed(self, previous_refresh: &str) -> Self {
        if self.refresh_token.is_empty() {
            Self {
                refresh_token: previous_refresh.to_string(),
                ..self
            }
        } else {
            self
        }
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &if self.is_refreshable() { "[REDACTED]" } else { "" },
            )
            .field("expiry", &self.expiry)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_boundary_counts_as_expired() {
        let token = OAuthToken::bearer("at", "rt", 1_000);
        assert!(token.is_expired(1_000));
        assert!(token.is_expired(1_001));
        assert!(!token.is_expired(999));
        assert_eq!(token.remaining_secs(400), 600);
        assert_eq!(token.remaining_secs(1_100), -100);
    }

    #[test]
    fn empty_refresh_token_is_not_refreshable() {
        assert!(!OAuthToken::bearer("at", "", 10).is_refreshable());
        assert!(OAuthToken::bearer("at", "rt", 10).is_refreshable());
    }

    #[test]
    fn renewed_keeps_previous_refresh_token_when_missing() {
        let fresh = OAuthToken::bearer("at_new", "", 50);
        let renewed = fresh.renewed("rt_old");
        assert_eq!(renewed.refresh_token, "rt_old");
        assert_eq!(renewed.access_token, "at_new");

        let rotated = OAuthToken::bearer("at_new", "rt_new", 50).renewed("rt_old");
        assert_eq!(rotated.refresh_token, "rt_new");
    }

    #[test]
    fn debug_redacts_secrets() {
        let token = OAuthToken::bearer("at_secret", "rt_secret", 42);
        let debug = format!("{token:?}");
        assert!(!debug.contains("at_secret"), "got: {debug}");
        assert!(!debug.contains("rt_secret"), "got: {debug}");
        assert!(debug.contains("42"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"access_token":"at","expiry":99}"#;
        let token: OAuthToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert!(token.refresh_token.is_empty());
        assert!(token.scope.is_none());
    }

    #[test]
    fn clock_helpers_agree() {
        let secs = now_secs();
        let millis = now_millis();
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
