//! Per-(provider, bucket) OAuth token storage
//!
//! The store is the single source of truth for token data. The bucket pool
//! reads it on every request (peek path), during failover, and from the
//! proactive renewal timers. Besides durable storage it offers an advisory,
//! non-blocking refresh lock so two refreshers never spend the same
//! single-use refresh token.
//!
//! Implementations:
//! - `FileTokenStore`: JSON file shared between processes; every operation
//!   re-reads it, writes are atomic temp-file + rename, 0600, and refresh
//!   locks are lock files next to it
//! - `MemoryTokenStore`: process-local map for embedding and tests

pub mod error;
pub mod file;
pub mod lock;
pub mod memory;

pub use error::{Error, Result};
pub use file::FileTokenStore;
pub use lock::{DEFAULT_LOCK_TTL, LockFiles, RefreshLease, RefreshLocks};
pub use memory::MemoryTokenStore;

use common::OAuthToken;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Bucket name used when a provider has no configured bucket list.
pub const DEFAULT_BUCKET: &str = "default";

/// Boxed future returned by store methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stored token plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: OAuthToken,
    /// Unix seconds of the last save
    pub saved_at: u64,
}

/// Summary of one bucket for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub bucket: String,
    /// Absolute expiry (unix seconds)
    pub expiry: u64,
    pub refreshable: bool,
    /// Unix seconds of the last save
    pub saved_at: u64,
}

impl BucketStats {
    fn from_stored(bucket: &str, stored: &StoredToken) -> Self {
        Self {
            bucket: bucket.to_string(),
            expiry: stored.token.expiry,
            refreshable: stored.token.is_refreshable(),
            saved_at: stored.saved_at,
        }
    }

    /// Seconds of lifetime left at `now` (negative once expired).
    pub fn remaining_secs(&self, now: u64) -> i64 {
        let expiry = i64::try_from(self.expiry).unwrap_or(i64::MAX);
        expiry.saturating_sub(i64::try_from(now).unwrap_or(i64::MAX))
    }
}

/// Durable credential storage keyed by provider and bucket.
///
/// Every method may fail. Callers in the bucket pool treat a failed read the
/// same as a missing token.
pub trait TokenStore: Send + Sync {
    /// Insert or replace the token for a bucket.
    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> BoxFuture<'a, Result<()>>;

    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<OAuthToken>>>;

    /// Remove a bucket's token. Removing a missing token is not an error.
    fn remove_token<'a>(&'a self, provider: &'a str, bucket: &'a str)
    -> BoxFuture<'a, Result<()>>;

    /// Providers with at least one stored bucket, sorted.
    fn list_providers(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Stored bucket names for a provider, sorted.
    fn list_buckets<'a>(&'a self, provider: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    fn get_bucket_stats<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<BucketStats>>>;

    /// Try to take the advisory refresh lock. Never waits. `None` means
    /// another refresher holds it.
    fn acquire_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<RefreshLease>>>;

    /// Release a lock taken with `lease`. A no-op if the lease went stale
    /// and the lock now belongs to someone else.
    fn release_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        lease: RefreshLease,
    ) -> BoxFuture<'a, Result<()>>;
}
