//! OAuth provider abstraction for bucket credentials
//!
//! Defines the `OAuthProvider` capability set that decouples the bucket pool
//! from vendor authentication details. Each vendor implements the trait once
//! and is registered in a `ProviderRegistry`, where the pool looks it up by
//! name:
//! - `initiate_auth` runs the vendor's interactive flow for one bucket
//! - `get_token` exposes a token the vendor tooling already holds, if any
//! - `refresh_token` exchanges a refresh token for a replacement token
//!
//! `HeadlessProvider` is the built-in implementation for environments without
//! a browser: it refreshes through the standard refresh grant and refuses
//! interactive authentication.

pub mod headless;
pub mod refresh_grant;

pub use headless::HeadlessProvider;
pub use refresh_grant::{TokenResponse, refresh_grant};

use common::OAuthToken;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by provider methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from provider operations (interactive auth, token refresh)
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("interactive authentication unavailable: {0}")]
    InteractiveUnavailable(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Per-vendor OAuth capability set.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn OAuthProvider>`).
pub trait OAuthProvider: Send + Sync {
    /// Registry key and log label (e.g. "anthropic", "gemini")
    fn name(&self) -> &str;

    /// Run the interactive flow for `bucket` and return the issued token.
    ///
    /// The caller persists the token; providers never touch the store.
    fn initiate_auth<'a>(&'a self, bucket: &'a str) -> BoxFuture<'a, Result<OAuthToken>>;

    /// Token already available outside the store (e.g. vendor CLI cache).
    fn get_token<'a>(&'a self, bucket: &'a str) -> BoxFuture<'a, Result<Option<OAuthToken>>> {
        let _ = bucket;
        Box::pin(async { Ok(None) })
    }

    /// Exchange a refresh token for a new token.
    ///
    /// `Ok(None)` means the refresh token is no longer accepted and the bucket
    /// needs interactive authentication.
    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<Option<OAuthToken>>>;
}

/// Providers selected by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            tracing::debug!(provider = %name, "replaced registered provider");
        }
    }

    pub fn with(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
