//! Proactive background token renewal
//!
//! Owns at most one pending timer per (provider, bucket). A timer fires ahead
//! of expiry, refreshes through the provider and reschedules itself from the
//! new expiry, so buckets rarely reach the reactive failover path.
//!
//! A timer that wakes to find a newer token than the one it was armed for
//! follows that token instead of refreshing.
//!
//! Timers are spawned tasks racing a sleep against a cancel channel. Dropping
//! a timer's entry from the table cancels its wait. An in-flight refresh is
//! never aborted; its result is discarded unless the timer's generation is
//! still the registered one for its key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::OAuthToken;
use provider::ProviderRegistry;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use token_store::{RefreshLease, TokenStore};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::metrics;

type Key = (String, String);

/// Renewal timing.
///
/// A token with `remaining` lifetime is renewed
/// `max(min_lead, lead_fraction * remaining)` before expiry, minus up to
/// `jitter` so buckets sharing an issue time do not refresh together.
/// Failed renewals retry after `retry_base * 2^failures` plus up to
/// `retry_jitter`, and stop after `max_failures` in a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalPolicy {
    pub min_lead_secs: u64,
    pub lead_fraction: f64,
    pub jitter_secs: u64,
    pub retry_base_secs: u64,
    pub retry_jitter_secs: u64,
    pub max_failures: u32,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            min_lead_secs: 300,
            lead_fraction: 0.1,
            jitter_secs: 30,
            retry_base_secs: 30,
            retry_jitter_secs: 5,
            max_failures: 3,
        }
    }
}

impl RenewalPolicy {
    fn min_lead_ms(&self) -> u64 {
        self.min_lead_secs.saturating_mul(1000)
    }

    fn lead_ms(&self, remaining_ms: u64) -> u64 {
        let fractional = (remaining_ms as f64 * self.lead_fraction) as u64;
        self.min_lead_ms().max(fractional)
    }

    /// Delay before the proactive refresh of a token with `remaining_ms` left.
    pub fn renewal_delay(&self, remaining_ms: u64, jitter_ms: u64) -> Duration {
        Duration::from_millis(
            remaining_ms
                .saturating_sub(self.lead_ms(remaining_ms))
                .saturating_sub(jitter_ms),
        )
    }

    /// Delay before retrying after `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32, jitter_ms: u64) -> Duration {
        let backoff = self.retry_base_secs.saturating_mul(1u64 << failures.min(16));
        Duration::from_secs(backoff) + Duration::from_millis(jitter_ms)
    }
}

fn random_ms(max_secs: u64) -> u64 {
    if max_secs == 0 {
        return 0;
    }
    rand::rng().random_range(0..=max_secs * 1000)
}

struct Timer {
    generation: u64,
    // Dropping the sender wakes the waiting task, which then exits.
    _cancel: oneshot::Sender<()>,
}

struct Inner {
    store: Arc<dyn TokenStore>,
    providers: Arc<ProviderRegistry>,
    policy: RenewalPolicy,
    timers: Mutex<HashMap<Key, Timer>>,
    failures: Mutex<HashMap<Key, u32>>,
    generation: AtomicU64,
}

/// Per-(provider, bucket) proactive renewal timers.
///
/// Cheap to clone; clones share the timer table.
#[derive(Clone)]
pub struct RenewalScheduler {
    inner: Arc<Inner>,
}

impl RenewalScheduler {
    pub fn new(
        store: Arc<dyn TokenStore>,
        providers: Arc<ProviderRegistry>,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                providers,
                policy,
                timers: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.inner.policy
    }

    /// Schedule renewal of `token`, replacing any pending timer for the key.
    ///
    /// Resets the key's failure counter. Returns false (and leaves existing
    /// timers alone) when the token is not refreshable, already expired, or
    /// expires within `min_lead_secs`. Must be called inside a tokio runtime.
    pub fn schedule_proactive_renewal(&self, provider: &str, bucket: &str, token: &OAuthToken) -> bool {
        self.inner.reset_failures(&key(provider, bucket));
        self.inner.schedule_from_token(provider, bucket, token)
    }

    /// Cancel the pending timer for one bucket. Returns whether one existed.
    pub fn cancel(&self, provider: &str, bucket: &str) -> bool {
        let removed = self.inner.lock_timers().remove(&key(provider, bucket)).is_some();
        if removed {
            debug!(provider, bucket, "cancelled renewal timer");
        }
        removed
    }

    /// Cancel every timer owned by this scheduler. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Timer> = self.inner.lock_timers().drain().map(|(_, t)| t).collect();
        if !drained.is_empty() {
            info!(cancelled = drained.len(), "cancelled all renewal timers");
        }
        drained.len()
    }

    /// Keys with a pending timer, sorted.
    pub fn pending(&self) -> Vec<(String, String)> {
        let mut keys: Vec<Key> = self.inner.lock_timers().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_pending(&self, provider: &str, bucket: &str) -> bool {
        self.inner.lock_timers().contains_key(&key(provider, bucket))
    }

    /// Consecutive renewal failures recorded for a bucket.
    pub fn failure_count(&self, provider: &str, bucket: &str) -> u32 {
        self.inner
            .lock_failures()
            .get(&key(provider, bucket))
            .copied()
            .unwrap_or(0)
    }
}

fn key(provider: &str, bucket: &str) -> Key {
    (provider.to_string(), bucket.to_string())
}

impl Inner {
    fn lock_timers(&self) -> MutexGuard<'_, HashMap<Key, Timer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<Key, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset_failures(&self, key: &Key) {
        self.lock_failures().remove(key);
    }

    fn is_current(&self, key: &Key, generation: u64) -> bool {
        self.lock_timers()
            .get(key)
            .is_some_and(|t| t.generation == generation)
    }

    /// Drop the timer entry if it still belongs to `generation`.
    fn clear(&self, key: &Key, generation: u64) {
        let mut timers = self.lock_timers();
        if timers.get(key).is_some_and(|t| t.generation == generation) {
            timers.remove(key);
        }
    }

    fn schedule_from_token(self: &Arc<Self>, provider: &str, bucket: &str, token: &OAuthToken) -> bool {
        if !token.is_refreshable() {
            debug!(provider, bucket, "token has no refresh token, renewal not scheduled");
            return false;
        }
        let remaining_ms = token
            .expiry
            .saturating_mul(1000)
            .saturating_sub(common::now_millis());
        if remaining_ms == 0 {
            debug!(provider, bucket, "token already expired, left to the request path");
            return false;
        }
        if remaining_ms <= self.policy.min_lead_ms() {
            debug!(
                provider,
                bucket,
                remaining_secs = remaining_ms / 1000,
                "token expires too soon for proactive renewal"
            );
            return false;
        }

        let delay = self
            .policy
            .renewal_delay(remaining_ms, random_ms(self.policy.jitter_secs));
        info!(
            provider,
            bucket,
            delay_secs = delay.as_secs(),
            "scheduled proactive renewal"
        );
        self.arm(provider, bucket, delay, token.expiry);
        true
    }

    /// Spawn the timer task. `armed_expiry` is the expiry of the token the
    /// timer is meant to renew.
    fn arm(self: &Arc<Self>, provider: &str, bucket: &str, delay: Duration, armed_expiry: u64) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let key = key(provider, bucket);

        let previous = self.lock_timers().insert(
            key.clone(),
            Timer {
                generation,
                _cancel: cancel_tx,
            },
        );
        if previous.is_some() {
            debug!(provider, bucket, "replaced pending renewal timer");
        }
        drop(previous);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx => return,
            }
            inner.fire(key, generation, armed_expiry).await;
        });
    }

    async fn fire(self: Arc<Self>, key: Key, generation: u64, armed_expiry: u64) {
        if !self.is_current(&key, generation) {
            return;
        }
        let (provider, bucket) = (key.0.as_str(), key.1.as_str());

        let token = match self.store.get_token(provider, bucket).await {
            Ok(Some(token)) if token.is_refreshable() => token,
            Ok(_) => {
                debug!(provider, bucket, "no refreshable token stored, stopping renewal");
                self.clear(&key, generation);
                return;
            }
            Err(e) => {
                warn!(provider, bucket, error = %e, "reading token for renewal failed");
                self.on_failure(&key, generation, armed_expiry);
                return;
            }
        };

        if token.expiry > armed_expiry {
            if !self.is_current(&key, generation) {
                return;
            }
            debug!(provider, bucket, "token renewed elsewhere, following it");
            if !self.schedule_from_token(provider, bucket, &token) {
                self.clear(&key, generation);
            }
            return;
        }

        let Some(oauth) = self.providers.get(provider) else {
            warn!(provider, "provider not registered, stopping renewal");
            self.clear(&key, generation);
            return;
        };

        let lease = match self.store.acquire_refresh_lock(provider, bucket).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(provider, bucket, "refresh lock held elsewhere, deferring renewal");
                if !self.is_current(&key, generation) {
                    return;
                }
                // Follow a token the lock holder already renewed, else check
                // back later in case they fail. The token this timer read is
                // due, so rescheduling from it would fire again at once.
                if let Ok(Some(stored)) = self.store.get_token(provider, bucket).await
                    && stored.expiry > token.expiry
                    && self.is_current(&key, generation)
                    && self.schedule_from_token(provider, bucket, &stored)
                {
                    return;
                }
                if self.is_current(&key, generation) {
                    let delay = self
                        .policy
                        .retry_delay(0, random_ms(self.policy.retry_jitter_secs));
                    debug!(provider, bucket, delay_secs = delay.as_secs(), "renewal deferred");
                    self.arm(provider, bucket, delay, token.expiry);
                }
                return;
            }
            Err(e) => {
                warn!(provider, bucket, error = %e, "acquiring refresh lock failed");
                self.on_failure(&key, generation, token.expiry);
                return;
            }
        };

        let refreshed = match oauth.refresh_token(&token.refresh_token).await {
            Ok(Some(new)) => Some(new.renewed(&token.refresh_token)),
            Ok(None) => {
                warn!(provider, bucket, "refresh token rejected during proactive renewal");
                None
            }
            Err(e) => {
                warn!(provider, bucket, error = %e, "proactive renewal failed");
                None
            }
        };

        if !self.is_current(&key, generation) {
            self.release_lock(provider, bucket, lease).await;
            debug!(provider, bucket, "renewal superseded while refreshing, result discarded");
            return;
        }

        let persisted = match refreshed {
            Some(new) => match self.store.save_token(provider, bucket, new.clone()).await {
                Ok(()) => Some(new),
                Err(e) => {
                    warn!(provider, bucket, error = %e, "persisting renewed token failed");
                    None
                }
            },
            None => None,
        };
        self.release_lock(provider, bucket, lease).await;

        match persisted {
            Some(new) => {
                info!(provider, bucket, expiry = new.expiry, "proactive renewal succeeded");
                metrics::record_renewal(provider, "success");
                if !self.is_current(&key, generation) {
                    return;
                }
                self.reset_failures(&key);
                if !self.schedule_from_token(provider, bucket, &new) {
                    self.clear(&key, generation);
                }
            }
            None => self.on_failure(&key, generation, token.expiry),
        }
    }

    fn on_failure(self: &Arc<Self>, key: &Key, generation: u64, armed_expiry: u64) {
        if !self.is_current(key, generation) {
            return;
        }
        let (provider, bucket) = (key.0.as_str(), key.1.as_str());
        metrics::record_renewal(provider, "failure");

        let failures = {
            let mut table = self.lock_failures();
            let count = table.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.policy.max_failures {
            warn!(
                provider,
                bucket,
                failures,
                "proactive renewal keeps failing, stopped until the next token fetch"
            );
            self.clear(key, generation);
            return;
        }

        let delay = self
            .policy
            .retry_delay(failures, random_ms(self.policy.retry_jitter_secs));
        info!(
            provider,
            bucket,
            failures,
            delay_secs = delay.as_secs(),
            "retrying proactive renewal"
        );
        self.arm(provider, bucket, delay, armed_expiry);
    }

    async fn release_lock(&self, provider: &str, bucket: &str, lease: RefreshLease) {
        if let Err(e) = self.store.release_refresh_lock(provider, bucket, lease).await {
            warn!(provider, bucket, error = %e, "releasing refresh lock failed");
        }
    }
}
