//! OAuth refresh grant (RFC 6749 section 6)
//!
//! POSTs `grant_type=refresh_token` to a token endpoint and converts the
//! response into an `OAuthToken`. Authorization-code exchange is vendor
//! specific and lives behind `OAuthProvider::initiate_auth`.

use common::OAuthToken;
use serde::{Deserialize, Serialize};

use crate::{ProviderError, Result};

/// Response from the token endpoint for a refresh.
///
/// `expires_in` is a delta in seconds from the response time. Endpoints that
/// do not rotate refresh tokens omit `refresh_token`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert to an absolute-expiry token issued at `now` (unix seconds).
    pub fn into_token(self, now: u64) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.unwrap_or_default(),
            expiry: now.saturating_add(self.expires_in),
            token_type: self.token_type.unwrap_or_else(|| common::BEARER.to_string()),
            scope: self.scope,
        }
    }
}

/// Refresh an access token using a refresh token.
///
/// 400/401/403 from the endpoint mean the refresh token is revoked, expired
/// or already consumed and are reported as `InvalidGrant`.
pub async fn refresh_grant(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| ProviderError::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(ProviderError::InvalidGrant(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(ProviderError::Refresh(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| ProviderError::Refresh(format!("invalid refresh response: {e}")))
}
