//! Session-scoped OAuth manager
//!
//! One `OAuthManager` per CLI session owns the token store handle, the
//! provider registry, the renewal scheduler, the active profile and the
//! session-bucket map. The token store stays the source of truth for token
//! data; the manager only remembers which bucket each provider is using.

use std::collections::HashMap;
use std::sync::Arc;

use common::{OAuthToken, now_secs};
use provider::{OAuthProvider, ProviderError, ProviderRegistry};
use serde::Serialize;
use token_store::{BucketStats, DEFAULT_BUCKET, TokenStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::renewal::{RenewalPolicy, RenewalScheduler};

/// Per-bucket view for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub bucket: String,
    /// Whether this is the provider's session bucket
    pub session: bool,
    pub renewal_pending: bool,
    /// `None` when nothing is stored or the store could not be read
    pub stats: Option<BucketStats>,
}

pub struct OAuthManager {
    store: Arc<dyn TokenStore>,
    providers: Arc<ProviderRegistry>,
    scheduler: RenewalScheduler,
    active_profile: RwLock<Option<Profile>>,
    session_buckets: RwLock<HashMap<String, String>>,
}

fn store_error(e: token_store::Error) -> Error {
    Error::Store(e.to_string())
}

impl OAuthManager {
    pub fn new(store: Arc<dyn TokenStore>, providers: ProviderRegistry) -> Self {
        Self::with_policy(store, providers, RenewalPolicy::default())
    }

    pub fn with_policy(
        store: Arc<dyn TokenStore>,
        providers: ProviderRegistry,
        policy: RenewalPolicy,
    ) -> Self {
        let providers = Arc::new(providers);
        let scheduler = RenewalScheduler::new(store.clone(), providers.clone(), policy);
        info!(providers = ?providers.names(), "oauth manager initialized");
        Self {
            store,
            providers,
            scheduler,
            active_profile: RwLock::new(None),
            session_buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn OAuthProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    // --- profile ---

    pub async fn set_active_profile(&self, profile: Profile) {
        info!(
            profile = %profile.name,
            provider = %profile.provider,
            buckets = profile.buckets.len(),
            "active profile set"
        );
        *self.active_profile.write().await = Some(profile);
    }

    pub async fn active_profile(&self) -> Option<Profile> {
        self.active_profile.read().await.clone()
    }

    /// Ordered buckets for a provider: the active profile's list when the
    /// profile targets this provider, otherwise `[default]`.
    pub async fn buckets_for(&self, provider: &str) -> Vec<String> {
        match &*self.active_profile.read().await {
            Some(profile) if profile.provider == provider => profile.effective_buckets(),
            _ => vec![DEFAULT_BUCKET.to_string()],
        }
    }

    // --- session buckets ---

    pub async fn set_session_bucket(&self, provider: &str, bucket: &str) {
        let previous = self
            .session_buckets
            .write()
            .await
            .insert(provider.to_string(), bucket.to_string());
        if previous.as_deref() != Some(bucket) {
            debug!(provider, bucket, previous = ?previous, "session bucket set");
        }
    }

    pub async fn session_bucket(&self, provider: &str) -> Option<String> {
        self.session_buckets.read().await.get(provider).cloned()
    }

    pub async fn clear_session_buckets(&self) {
        self.session_buckets.write().await.clear();
        debug!("session buckets cleared");
    }

    /// Explicit bucket, else the session bucket while it is still configured,
    /// else the first configured bucket (which becomes the session bucket).
    async fn resolve_bucket(&self, provider: &str, explicit: Option<&str>) -> String {
        if let Some(bucket) = explicit {
            return bucket.to_string();
        }
        let buckets = self.buckets_for(provider).await;
        if let Some(session) = self.session_bucket(provider).await
            && buckets.contains(&session)
        {
            return session;
        }
        let first = buckets
            .into_iter()
            .next()
            .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        self.set_session_bucket(provider, &first).await;
        first
    }

    // --- token access ---

    /// Usable token for a bucket, refreshing an expired one when possible.
    ///
    /// Returns `Ok(None)` when nothing usable exists without interactive
    /// authentication. Refresh failures are logged, not returned.
    pub async fn get_oauth_token(
        &self,
        provider: &str,
        bucket: Option<&str>,
    ) -> Result<Option<OAuthToken>> {
        let oauth = self.provider(provider)?;
        let bucket = self.resolve_bucket(provider, bucket).await;
        let stored = self
            .store
            .get_token(provider, &bucket)
            .await
            .map_err(store_error)?;

        match stored {
            Some(token) if !token.is_expired(now_secs()) => Ok(Some(token)),
            Some(token) if token.is_refreshable() => {
                self.refresh_stored(oauth.as_ref(), provider, &bucket, token)
                    .await
            }
            Some(_) => {
                debug!(provider, bucket = %bucket, "token expired and has no refresh token");
                Ok(None)
            }
            None => self.adopt_external(oauth.as_ref(), provider, &bucket).await,
        }
    }

    async fn refresh_stored(
        &self,
        oauth: &dyn OAuthProvider,
        provider: &str,
        bucket: &str,
        expired: OAuthToken,
    ) -> Result<Option<OAuthToken>> {
        let lease = self
            .store
            .acquire_refresh_lock(provider, bucket)
            .await
            .map_err(store_error)?;
        let Some(lease) = lease else {
            debug!(provider, bucket, "refresh lock held elsewhere, re-reading store");
            let reread = self
                .store
                .get_token(provider, bucket)
                .await
                .map_err(store_error)?;
            return Ok(reread.filter(|t| !t.is_expired(now_secs())));
        };

        let outcome = match oauth.refresh_token(&expired.refresh_token).await {
            Ok(Some(new)) => {
                let new = new.renewed(&expired.refresh_token);
                self.store
                    .save_token(provider, bucket, new.clone())
                    .await
                    .map(|()| Some(new))
                    .map_err(store_error)
            }
            Ok(None) => {
                warn!(provider, bucket, "refresh token rejected");
                Ok(None)
            }
            Err(e) => {
                warn!(provider, bucket, error = %e, "token refresh failed");
                Ok(None)
            }
        };
        if let Err(e) = self.store.release_refresh_lock(provider, bucket, lease).await {
            warn!(provider, bucket, error = %e, "releasing refresh lock failed");
        }

        match outcome? {
            Some(token) if !token.is_expired(now_secs()) => {
                info!(provider, bucket, expiry = token.expiry, "token refreshed");
                self.scheduler
                    .schedule_proactive_renewal(provider, bucket, &token);
                Ok(Some(token))
            }
            Some(_) => {
                warn!(provider, bucket, "refresh returned an already expired token");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Adopt a credential the provider already holds outside the store.
    async fn adopt_external(
        &self,
        oauth: &dyn OAuthProvider,
        provider: &str,
        bucket: &str,
    ) -> Result<Option<OAuthToken>> {
        match oauth.get_token(bucket).await {
            Ok(Some(token)) if !token.is_expired(now_secs()) => {
                self.store
                    .save_token(provider, bucket, token.clone())
                    .await
                    .map_err(store_error)?;
                info!(provider, bucket, "adopted provider-held token");
                self.scheduler
                    .schedule_proactive_renewal(provider, bucket, &token);
                Ok(Some(token))
            }
            Ok(_) => {
                debug!(provider, bucket, "no stored token");
                Ok(None)
            }
            Err(e) => {
                warn!(provider, bucket, error = %e, "provider token lookup failed");
                Ok(None)
            }
        }
    }

    /// Store read without refresh. Unreadable and expired both yield `None`.
    async fn peek(&self, provider: &str, bucket: &str) -> Option<OAuthToken> {
        match self.store.get_token(provider, bucket).await {
            Ok(Some(token)) if !token.is_expired(now_secs()) => Some(token),
            Ok(_) => None,
            Err(e) => {
                debug!(provider, bucket, error = %e, "peek failed, skipping bucket");
                None
            }
        }
    }

    /// Peek every configured bucket other than `session`, in order, and make
    /// the first valid one the session bucket.
    async fn peek_others(&self, provider: &str, session: &str) -> Option<String> {
        for bucket in self.buckets_for(provider).await {
            if bucket == session {
                continue;
            }
            if let Some(token) = self.peek(provider, &bucket).await {
                info!(provider, from = session, to = %bucket, "session bucket switched by peek");
                self.set_session_bucket(provider, &bucket).await;
                return Some(token.access_token);
            }
        }
        None
    }

    /// Access token for the next request, without failover.
    ///
    /// Peeks the session bucket, then the other configured buckets. When none
    /// holds a valid token it tries one refreshing fetch of the session
    /// bucket, then interactive authentication, then peeks once more.
    /// A provider that cannot authenticate interactively yields `Ok(None)`;
    /// other authentication failures are returned once the final peek also
    /// comes up empty.
    pub async fn get_token(&self, provider: &str) -> Result<Option<String>> {
        self.provider(provider)?;
        let session = self.resolve_bucket(provider, None).await;

        if let Some(token) = self.peek(provider, &session).await {
            return Ok(Some(token.access_token));
        }
        if let Some(access) = self.peek_others(provider, &session).await {
            return Ok(Some(access));
        }

        match self.get_oauth_token(provider, Some(&session)).await {
            Ok(Some(token)) => return Ok(Some(token.access_token)),
            Ok(None) => {}
            Err(e) => warn!(provider, bucket = %session, error = %e, "refreshing fetch failed"),
        }

        let buckets = self.buckets_for(provider).await;
        let auth = if buckets.len() > 1 {
            self.authenticate_multiple_buckets(provider, &buckets).await
        } else {
            self.authenticate(provider, Some(&session)).await.map(|_| ())
        };

        let session = self.resolve_bucket(provider, None).await;
        if let Some(token) = self.peek(provider, &session).await {
            return Ok(Some(token.access_token));
        }
        if let Some(access) = self.peek_others(provider, &session).await {
            return Ok(Some(access));
        }
        match auth {
            Err(Error::InteractiveUnavailable(reason)) => {
                debug!(provider, reason = %reason, "no usable token and no interactive login");
                Ok(None)
            }
            Err(e) => Err(e),
            Ok(()) => Ok(None),
        }
    }

    // --- authentication ---

    /// Interactive authentication for one bucket. Persists the token and
    /// schedules its renewal.
    pub async fn authenticate(&self, provider: &str, bucket: Option<&str>) -> Result<OAuthToken> {
        let oauth = self.provider(provider)?;
        let bucket = self.resolve_bucket(provider, bucket).await;
        info!(provider, bucket = %bucket, "starting authentication");

        let token = oauth.initiate_auth(&bucket).await.map_err(|e| match e {
            ProviderError::InteractiveUnavailable(reason) => Error::InteractiveUnavailable(reason),
            other => Error::Auth(other.to_string()),
        })?;
        self.store
            .save_token(provider, &bucket, token.clone())
            .await
            .map_err(store_error)?;
        self.scheduler
            .schedule_proactive_renewal(provider, &bucket, &token);
        info!(provider, bucket = %bucket, expiry = token.expiry, "authentication complete");
        Ok(token)
    }

    /// Authenticate every bucket lacking a valid token, in order.
    ///
    /// A no-op for zero or one bucket. Stops at the first failure.
    pub async fn authenticate_multiple_buckets(
        &self,
        provider: &str,
        buckets: &[String],
    ) -> Result<()> {
        if buckets.len() <= 1 {
            return Ok(());
        }
        for bucket in buckets {
            if self.peek(provider, bucket).await.is_some() {
                debug!(provider, bucket = %bucket, "bucket already authenticated");
                continue;
            }
            self.authenticate(provider, Some(bucket)).await?;
        }
        Ok(())
    }

    // --- renewal and housekeeping ---

    /// Replace all renewal timers with one per profile bucket holding a
    /// valid, refreshable token. Returns how many were scheduled.
    pub async fn configure_proactive_renewals_for_profile(&self, profile: &Profile) -> usize {
        self.scheduler.cancel_all();
        let provider = profile.provider.as_str();
        let mut scheduled = 0;
        for bucket in profile.effective_buckets() {
            match self.store.get_token(provider, &bucket).await {
                Ok(Some(token)) if !token.is_expired(now_secs()) && token.is_refreshable() => {
                    if self
                        .scheduler
                        .schedule_proactive_renewal(provider, &bucket, &token)
                    {
                        scheduled += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(provider, bucket = %bucket, error = %e, "reading token failed"),
            }
        }
        info!(profile = %profile.name, provider, scheduled, "proactive renewals configured");
        scheduled
    }

    /// Cancel renewal and delete the stored token for a bucket.
    pub async fn logout(&self, provider: &str, bucket: Option<&str>) -> Result<()> {
        let bucket = self.resolve_bucket(provider, bucket).await;
        self.scheduler.cancel(provider, &bucket);
        self.store
            .remove_token(provider, &bucket)
            .await
            .map_err(store_error)?;
        info!(provider, bucket = %bucket, "logged out");
        Ok(())
    }

    pub async fn bucket_stats(&self, provider: &str) -> Vec<BucketStatus> {
        let session = self.session_bucket(provider).await;
        let mut statuses = Vec::new();
        for bucket in self.buckets_for(provider).await {
            let stats = match self.store.get_bucket_stats(provider, &bucket).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(provider, bucket = %bucket, error = %e, "reading bucket stats failed");
                    None
                }
            };
            statuses.push(BucketStatus {
                session: session.as_deref() == Some(bucket.as_str()),
                renewal_pending: self.scheduler.is_pending(provider, &bucket),
                stats,
                bucket,
            });
        }
        statuses
    }
}
