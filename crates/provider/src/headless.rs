//! Refresh-only OAuth provider for machines without a browser
//!
//! Buckets are seeded out of band (copied token files, CI secrets). The
//! provider keeps them alive through the refresh grant but cannot run an
//! interactive flow, so a bucket whose refresh token dies stays unusable
//! until it is re-seeded.

use common::OAuthToken;
use tracing::{debug, warn};

use crate::refresh_grant::refresh_grant;
use crate::{BoxFuture, OAuthProvider, ProviderError, Result};

/// Refresh-grant provider with no interactive flow.
pub struct HeadlessProvider {
    name: String,
    token_url: String,
    client_id: String,
    http: reqwest::Client,
}

impl HeadlessProvider {
    pub fn new(
        name: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            http,
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

impl OAuthProvider for HeadlessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initiate_auth<'a>(&'a self, bucket: &'a str) -> BoxFuture<'a, Result<OAuthToken>> {
        Box::pin(async move {
            warn!(provider = %self.name, bucket, "interactive authentication requested in headless mode");
            Err(ProviderError::InteractiveUnavailable(format!(
                "provider '{}' cannot authenticate bucket '{bucket}' without a browser",
                self.name
            )))
        })
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<Option<OAuthToken>>> {
        Box::pin(async move {
            match refresh_grant(&self.http, &self.token_url, &self.client_id, refresh_token).await
            {
                Ok(response) => {
                    debug!(provider = %self.name, expires_in = response.expires_in, "refresh grant succeeded");
                    Ok(Some(response.into_token(common::now_secs())))
                }
                Err(ProviderError::InvalidGrant(msg)) => {
                    warn!(provider = %self.name, error = %msg, "refresh token no longer accepted");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
    }
}
