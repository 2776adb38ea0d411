//! Scripted collaborators for unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::OAuthToken;
use provider::{BoxFuture, OAuthProvider, ProviderError, ProviderRegistry};
use token_store::{BucketStats, MemoryTokenStore, RefreshLease, TokenStore};
use tokio::sync::Notify;

use crate::manager::OAuthManager;
use crate::profile::Profile;
use crate::renewal::RenewalPolicy;

pub const PROVIDER: &str = "anthropic";

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// Issue a token valid for this many seconds
    Succeed(u64),
    /// `Ok(None)`: refresh token rejected / auth produced nothing usable
    Reject,
    /// Provider error
    Fail,
    /// `ProviderError::InteractiveUnavailable`
    Headless,
}

/// Provider whose refresh and auth results are set by the test.
pub struct ScriptedProvider {
    name: String,
    refresh: Mutex<Outcome>,
    auth: Mutex<Outcome>,
    refresh_calls: AtomicUsize,
    refresh_tokens_seen: Mutex<Vec<String>>,
    auth_buckets: Mutex<Vec<String>>,
    external: Mutex<Option<OAuthToken>>,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedProvider {
    pub fn new(refresh: Outcome, auth: Outcome) -> Arc<Self> {
        Arc::new(Self {
            name: PROVIDER.to_string(),
            refresh: Mutex::new(refresh),
            auth: Mutex::new(auth),
            refresh_calls: AtomicUsize::new(0),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            auth_buckets: Mutex::new(Vec::new()),
            external: Mutex::new(None),
            refresh_gate: Mutex::new(None),
        })
    }

    pub fn set_refresh(&self, outcome: Outcome) {
        *self.refresh.lock().unwrap() = outcome;
    }

    pub fn set_external_token(&self, token: OAuthToken) {
        *self.external.lock().unwrap() = Some(token);
    }

    /// Hold every refresh until `gate` is notified.
    pub fn hold_refreshes(&self, gate: Arc<Notify>) {
        *self.refresh_gate.lock().unwrap() = Some(gate);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }

    pub fn auth_buckets(&self) -> Vec<String> {
        self.auth_buckets.lock().unwrap().clone()
    }
}

impl OAuthProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initiate_auth<'a>(
        &'a self,
        bucket: &'a str,
    ) -> BoxFuture<'a, provider::Result<OAuthToken>> {
        Box::pin(async move {
            self.auth_buckets.lock().unwrap().push(bucket.to_string());
            let outcome = *self.auth.lock().unwrap();
            match outcome {
                Outcome::Succeed(lifetime) => Ok(valid_token(&format!("auth_{bucket}"), lifetime)),
                Outcome::Reject => Ok(expired_token(&format!("auth_{bucket}"))),
                Outcome::Fail => Err(ProviderError::Auth("user closed the browser".into())),
                Outcome::Headless => Err(ProviderError::InteractiveUnavailable("no browser".into())),
            }
        })
    }

    fn get_token<'a>(
        &'a self,
        _bucket: &'a str,
    ) -> BoxFuture<'a, provider::Result<Option<OAuthToken>>> {
        Box::pin(async move { Ok(self.external.lock().unwrap().clone()) })
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, provider::Result<Option<OAuthToken>>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_tokens_seen
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            let gate = self.refresh_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let outcome = *self.refresh.lock().unwrap();
            match outcome {
                Outcome::Succeed(lifetime) => Ok(Some(OAuthToken::bearer(
                    "at_refreshed",
                    "",
                    common::now_secs() + lifetime,
                ))),
                Outcome::Reject => Ok(None),
                Outcome::Fail | Outcome::Headless => {
                    Err(ProviderError::Http("connection reset".into()))
                }
            }
        })
    }
}

/// Memory store with injectable read failures and lock contention.
///
/// Failing reads cover `get_token` and `get_bucket_stats`; writes always
/// succeed. Lock attempts are counted, denied or not.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryTokenStore,
    failing_reads: Mutex<HashSet<String>>,
    deny_locks: AtomicBool,
    lock_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_reads_for(&self, bucket: &str) {
        self.failing_reads.lock().unwrap().insert(bucket.to_string());
    }

    pub fn deny_locks(&self, deny: bool) {
        self.deny_locks.store(deny, Ordering::SeqCst);
    }

    pub fn lock_attempts(&self) -> usize {
        self.lock_attempts.load(Ordering::SeqCst)
    }

    pub fn lock_is_held(&self, bucket: &str) -> bool {
        self.inner.locks().is_held(PROVIDER, bucket)
    }
}

impl TokenStore for FlakyStore {
    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> token_store::BoxFuture<'a, token_store::Result<()>> {
        self.inner.save_token(provider, bucket, token)
    }

    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> token_store::BoxFuture<'a, token_store::Result<Option<OAuthToken>>> {
        if self.failing_reads.lock().unwrap().contains(bucket) {
            return Box::pin(async {
                Err(token_store::Error::Io("keychain locked".into()))
            });
        }
        self.inner.get_token(provider, bucket)
    }

    fn remove_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> token_store::BoxFuture<'a, token_store::Result<()>> {
        self.inner.remove_token(provider, bucket)
    }

    fn list_providers(&self) -> token_store::BoxFuture<'_, token_store::Result<Vec<String>>> {
        self.inner.list_providers()
    }

    fn list_buckets<'a>(
        &'a self,
        provider: &'a str,
    ) -> token_store::BoxFuture<'a, token_store::Result<Vec<String>>> {
        self.inner.list_buckets(provider)
    }

    fn get_bucket_stats<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> token_store::BoxFuture<'a, token_store::Result<Option<BucketStats>>> {
        if self.failing_reads.lock().unwrap().contains(bucket) {
            return Box::pin(async {
                Err(token_store::Error::Io("keychain locked".into()))
            });
        }
        self.inner.get_bucket_stats(provider, bucket)
    }

    fn acquire_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> token_store::BoxFuture<'a, token_store::Result<Option<RefreshLease>>> {
        self.lock_attempts.fetch_add(1, Ordering::SeqCst);
        if self.deny_locks.load(Ordering::SeqCst) {
            return Box::pin(async { Ok(None) });
        }
        self.inner.acquire_refresh_lock(provider, bucket)
    }

    fn release_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        lease: RefreshLease,
    ) -> token_store::BoxFuture<'a, token_store::Result<()>> {
        self.inner.release_refresh_lock(provider, bucket, lease)
    }
}

pub fn valid_token(name: &str, lifetime_secs: u64) -> OAuthToken {
    OAuthToken::bearer(
        format!("at_{name}"),
        format!("rt_{name}"),
        common::now_secs() + lifetime_secs,
    )
}

pub fn expired_token(name: &str) -> OAuthToken {
    OAuthToken::bearer(format!("at_{name}"), format!("rt_{name}"), common::now_secs() - 60)
}

/// Manager over a flaky store with the scripted provider registered and a
/// profile for `buckets` active.
pub async fn manager_with(
    provider: Arc<ScriptedProvider>,
    buckets: &[&str],
) -> (Arc<OAuthManager>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let registry = ProviderRegistry::new().with(provider);
    let manager = Arc::new(OAuthManager::with_policy(
        store.clone(),
        registry,
        RenewalPolicy::default(),
    ));
    let profile = Profile::new(
        "test",
        PROVIDER,
        buckets.iter().map(|b| b.to_string()).collect(),
    );
    manager.set_active_profile(profile).await;
    (manager, store)
}

pub async fn seed(store: &FlakyStore, bucket: &str, token: OAuthToken) {
    store.save_token(PROVIDER, bucket, token).await.unwrap();
}
