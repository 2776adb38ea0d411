//! Reactive bucket failover
//!
//! Called by the request layer after a 401/402/403/429. One call runs up to
//! three passes over the provider's buckets:
//!
//! 1. classify the current bucket (quota, missing, refreshable, rejected)
//! 2. scan the remaining buckets in order and switch to the first usable one
//! 3. make at most one foreground re-authentication attempt
//!
//! Every bucket examined gets a `BucketFailureReason` in the last-reasons
//! map, which feeds `AllBucketsExhaustedError` once the caller gives up.
//! Classifications are values; store and provider errors never escape.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{OAuthToken, now_secs};
use tracing::{debug, info, warn};

use crate::error::{AllBucketsExhaustedError, BoxError, Result};
use crate::manager::OAuthManager;
use crate::metrics;
use crate::reason::{
    BucketFailureReason, FailoverContext, is_auth_rejection_status, is_quota_status,
};

/// Failover state for one provider within a session.
///
/// `try_failover` takes `&mut self`, so one handler runs at most one failover
/// at a time. Share it behind a `tokio::sync::Mutex` when several request
/// tasks use the same provider.
pub struct BucketFailoverHandler {
    provider: String,
    buckets: Vec<String>,
    current_index: usize,
    tried: HashSet<String>,
    last_reasons: HashMap<String, BucketFailureReason>,
    manager: Arc<OAuthManager>,
}

impl BucketFailoverHandler {
    /// Handler over an explicit bucket list. Duplicates are dropped, keeping
    /// the first occurrence.
    pub fn new(provider: impl Into<String>, buckets: Vec<String>, manager: Arc<OAuthManager>) -> Self {
        let provider = provider.into();
        let mut seen = HashSet::new();
        let total = buckets.len();
        let buckets: Vec<String> = buckets
            .into_iter()
            .filter(|b| seen.insert(b.clone()))
            .collect();
        if buckets.len() != total {
            warn!(provider = %provider, "duplicate buckets dropped from failover list");
        }
        Self {
            provider,
            buckets,
            current_index: 0,
            tried: HashSet::new(),
            last_reasons: HashMap::new(),
            manager,
        }
    }

    /// Handler over the manager's bucket list for `provider`, starting at the
    /// current session bucket.
    pub async fn from_manager(manager: Arc<OAuthManager>, provider: &str) -> Self {
        let buckets = manager.buckets_for(provider).await;
        let mut handler = Self::new(provider, buckets, manager);
        handler.sync_with_session().await;
        handler
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn current_bucket(&self) -> Option<&str> {
        self.buckets.get(self.current_index).map(String::as_str)
    }

    pub fn buckets(&self) -> Vec<String> {
        self.buckets.clone()
    }

    /// Failover only does anything useful with more than one bucket.
    pub fn is_enabled(&self) -> bool {
        self.buckets.len() > 1
    }

    /// Back to the first bucket with a clean tried set.
    pub async fn reset(&mut self) {
        self.current_index = 0;
        self.tried.clear();
        if let Some(first) = self.buckets.first() {
            self.manager.set_session_bucket(&self.provider, first).await;
        }
        debug!(provider = %self.provider, "failover state reset");
    }

    /// Forget which buckets were tried; the current bucket is kept.
    pub fn reset_session(&mut self) {
        self.tried.clear();
    }

    /// Reasons recorded by the most recent `try_failover` call.
    pub fn last_failover_reasons(&self) -> HashMap<String, BucketFailureReason> {
        self.last_reasons.clone()
    }

    /// Authenticate every bucket lacking a valid token, when there are several.
    pub async fn ensure_buckets_authenticated(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.manager
            .authenticate_multiple_buckets(&self.provider, &self.buckets)
            .await
    }

    /// Terminal error for the caller to raise once failover returns false.
    pub fn exhausted_error(&self, last_error: impl Into<BoxError>) -> AllBucketsExhaustedError {
        AllBucketsExhaustedError::with_failure_reasons(
            self.provider.clone(),
            self.buckets(),
            last_error,
            self.last_failover_reasons(),
        )
    }

    /// Try to leave the current bucket for a usable one.
    ///
    /// Returns true when the caller should retry its request: the current
    /// bucket was refreshed in place, another bucket was switched to, or a
    /// re-authentication succeeded. Returns false once nothing usable is left.
    pub async fn try_failover(&mut self, context: FailoverContext) -> bool {
        self.last_reasons = HashMap::new();
        if self.buckets.is_empty() {
            metrics::record_failover(&self.provider, "exhausted");
            return false;
        }
        self.sync_with_session().await;

        let status = context.triggering_status;
        let current = self.buckets[self.current_index].clone();
        info!(
            provider = %self.provider,
            bucket = %current,
            status = ?status,
            "bucket failover triggered"
        );

        // Pass 1: classify the current bucket.
        let reason = if status.is_some_and(is_quota_status) {
            BucketFailureReason::QuotaExhausted
        } else {
            match self.read_stored(&current).await {
                None => BucketFailureReason::NoToken,
                Some(token) if token.is_expired(now_secs()) => {
                    if self.refresh(&current).await {
                        info!(provider = %self.provider, bucket = %current, "current bucket refreshed");
                        metrics::record_failover(&self.provider, "refreshed");
                        return true;
                    }
                    BucketFailureReason::ExpiredRefreshFailed
                }
                Some(_) if status.is_some_and(is_auth_rejection_status) => {
                    BucketFailureReason::ExpiredRefreshFailed
                }
                Some(_) => BucketFailureReason::Skipped,
            }
        };
        self.classify(&current, reason);
        self.tried.insert(current.clone());

        // Pass 2: the remaining buckets, in order.
        for index in 0..self.buckets.len() {
            if index == self.current_index {
                continue;
            }
            let bucket = self.buckets[index].clone();
            if self.tried.contains(&bucket) {
                if !self.last_reasons.contains_key(&bucket) {
                    self.classify(&bucket, BucketFailureReason::Skipped);
                }
                continue;
            }

            match self.read_stored(&bucket).await {
                None => self.classify(&bucket, BucketFailureReason::NoToken),
                Some(token) if token.is_expired(now_secs()) => {
                    if self.refresh(&bucket).await {
                        self.switch_to(index, "switched").await;
                        return true;
                    }
                    self.classify(&bucket, BucketFailureReason::ExpiredRefreshFailed);
                }
                Some(_) => {
                    if self.confirm(&bucket).await {
                        self.switch_to(index, "switched").await;
                        return true;
                    }
                    self.classify(&bucket, BucketFailureReason::NoToken);
                }
            }
        }

        // Pass 3: one foreground re-authentication.
        if let Some(candidate) = self.reauth_candidate(&current) {
            info!(provider = %self.provider, bucket = %candidate, "attempting re-authentication");
            match self
                .manager
                .authenticate(&self.provider, Some(&candidate))
                .await
            {
                Ok(_) => {
                    if self.confirm(&candidate).await {
                        if let Some(index) = self.buckets.iter().position(|b| *b == candidate) {
                            self.switch_to(index, "reauthenticated").await;
                        }
                        return true;
                    }
                    warn!(
                        provider = %self.provider,
                        bucket = %candidate,
                        "re-authentication produced no usable token"
                    );
                    self.classify(&candidate, BucketFailureReason::ReauthFailed);
                }
                Err(e) => {
                    warn!(provider = %self.provider, bucket = %candidate, error = %e, "re-authentication failed");
                    self.classify(&candidate, BucketFailureReason::ReauthFailed);
                }
            }
        }

        warn!(
            provider = %self.provider,
            buckets = self.buckets.len(),
            tried = self.tried.len(),
            "all buckets exhausted"
        );
        metrics::record_failover(&self.provider, "exhausted");
        false
    }

    /// Follow a session bucket moved elsewhere (e.g. by the peek path).
    async fn sync_with_session(&mut self) {
        if let Some(session) = self.manager.session_bucket(&self.provider).await
            && let Some(index) = self.buckets.iter().position(|b| *b == session)
        {
            self.current_index = index;
        }
    }

    /// Raw store read; unreadable counts as absent.
    async fn read_stored(&self, bucket: &str) -> Option<OAuthToken> {
        match self.manager.store().get_token(&self.provider, bucket).await {
            Ok(token) => token,
            Err(e) => {
                debug!(provider = %self.provider, bucket, error = %e, "bucket unreadable");
                None
            }
        }
    }

    /// Refresh through the manager. True when a token with a future expiry
    /// came back.
    async fn refresh(&self, bucket: &str) -> bool {
        match self.manager.get_oauth_token(&self.provider, Some(bucket)).await {
            Ok(Some(token)) => !token.is_expired(now_secs()),
            Ok(None) => false,
            Err(e) => {
                debug!(provider = %self.provider, bucket, error = %e, "refresh during failover failed");
                false
            }
        }
    }

    async fn confirm(&self, bucket: &str) -> bool {
        matches!(
            self.manager.get_oauth_token(&self.provider, Some(bucket)).await,
            Ok(Some(_))
        )
    }

    fn reauth_candidate(&self, current: &str) -> Option<String> {
        let eligible = |bucket: &String| {
            self.last_reasons
                .get(bucket)
                .is_some_and(BucketFailureReason::is_reauth_eligible)
        };
        self.buckets
            .iter()
            .find(|b| b.as_str() != current && !self.tried.contains(*b) && eligible(*b))
            .or_else(|| match self.buckets.as_slice() {
                [only] if eligible(only) => Some(only),
                _ => None,
            })
            .cloned()
    }

    fn classify(&mut self, bucket: &str, reason: BucketFailureReason) {
        debug!(provider = %self.provider, bucket, reason = %reason, "bucket classified");
        metrics::record_failure_reason(&self.provider, reason);
        self.last_reasons.insert(bucket.to_string(), reason);
    }

    async fn switch_to(&mut self, index: usize, outcome: &'static str) {
        let from = self.current_bucket().map(str::to_string);
        self.current_index = index;
        let bucket = self.buckets[index].clone();
        self.tried.insert(bucket.clone());
        self.manager.set_session_bucket(&self.provider, &bucket).await;
        info!(
            provider = %self.provider,
            from = ?from,
            to = %bucket,
            outcome,
            "bucket failover succeeded"
        );
        metrics::record_failover(&self.provider, outcome);
    }
}
