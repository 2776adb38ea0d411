//! In-memory token storage
//!
//! Same contract as `FileTokenStore` without persistence. Used when the
//! caller owns persistence elsewhere and by tests.

use std::collections::HashMap;

use common::OAuthToken;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::lock::{RefreshLease, RefreshLocks};
use crate::{BoxFuture, BucketStats, StoredToken, TokenStore};

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    state: RwLock<HashMap<(String, String), StoredToken>>,
    locks: RefreshLocks,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `(provider, bucket, token)` entries.
    pub fn with_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (String, String, OAuthToken)>,
    {
        let saved_at = common::now_secs();
        let state = tokens
            .into_iter()
            .map(|(provider, bucket, token)| ((provider, bucket), StoredToken { token, saved_at }))
            .collect();
        Self {
            state: RwLock::new(state),
            locks: RefreshLocks::default(),
        }
    }

    pub fn locks(&self) -> &RefreshLocks {
        &self.locks
    }
}

fn key(provider: &str, bucket: &str) -> (String, String) {
    (provider.to_string(), bucket.to_string())
}

impl TokenStore for MemoryTokenStore {
    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stored = StoredToken {
                token,
                saved_at: common::now_secs(),
            };
            self.state.write().await.insert(key(provider, bucket), stored);
            Ok(())
        })
    }

    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<OAuthToken>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.get(&key(provider, bucket)).map(|s| s.token.clone()))
        })
    }

    fn remove_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.write().await.remove(&key(provider, bucket));
            Ok(())
        })
    }

    fn list_providers(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut providers: Vec<String> = state.keys().map(|(p, _)| p.clone()).collect();
            providers.sort();
            providers.dedup();
            Ok(providers)
        })
    }

    fn list_buckets<'a>(&'a self, provider: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut buckets: Vec<String> = state
                .keys()
                .filter(|(p, _)| p == provider)
                .map(|(_, b)| b.clone())
                .collect();
            buckets.sort();
            Ok(buckets)
        })
    }

    fn get_bucket_stats<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<BucketStats>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .get(&key(provider, bucket))
                .map(|stored| BucketStats::from_stored(bucket, stored)))
        })
    }

    fn acquire_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<RefreshLease>>> {
        Box::pin(async move { Ok(self.locks.try_acquire(provider, bucket)) })
    }

    fn release_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        lease: RefreshLease,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.locks.release(provider, bucket, lease);
            Ok(())
        })
    }
}
