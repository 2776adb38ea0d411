//! Advisory refresh locks
//!
//! Non-blocking try-locks keyed by (provider, bucket). A holder that never
//! releases (panicked task, dropped future, killed process) loses the lock
//! after `ttl`, so a stuck refresh cannot block renewal of a bucket forever.
//!
//! Every successful acquire hands out a `RefreshLease`. Releasing with a
//! lease that was taken over after going stale leaves the new holder alone.
//!
//! - `RefreshLocks`: in-process table, for stores owned by one process
//! - `LockFiles`: one `create_new` lock file per key next to a token file,
//!   shared by every process using that file

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default time after which an unreleased lock may be taken over.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Proof of holding a refresh lock. Pass it back to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefreshLease(u64);

static NEXT_LEASE: AtomicU64 = AtomicU64::new(1);

fn next_lease() -> RefreshLease {
    RefreshLease(NEXT_LEASE.fetch_add(1, Ordering::Relaxed))
}

/// In-process advisory lock table.
#[derive(Debug)]
pub struct RefreshLocks {
    held: Mutex<HashMap<(String, String), (Instant, RefreshLease)>>,
    ttl: Duration,
}

impl RefreshLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Take the lock if it is free or stale.
    pub fn try_acquire(&self, provider: &str, bucket: &str) -> Option<RefreshLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let key = (provider.to_string(), bucket.to_string());
        let now = Instant::now();
        match held.get(&key) {
            Some((since, _)) if now.duration_since(*since) < self.ttl => {
                debug!(provider, bucket, "refresh lock busy");
                return None;
            }
            Some(_) => warn!(provider, bucket, "taking over stale refresh lock"),
            None => {}
        }
        let lease = next_lease();
        held.insert(key, (now, lease));
        Some(lease)
    }

    /// Release the lock if `lease` still holds it. Returns whether it did.
    pub fn release(&self, provider: &str, bucket: &str, lease: RefreshLease) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let key = (provider.to_string(), bucket.to_string());
        match held.get(&key) {
            Some((_, holder)) if *holder == lease => {
                held.remove(&key);
                true
            }
            Some(_) => {
                debug!(provider, bucket, "refresh lock was taken over, leaving it");
                false
            }
            None => false,
        }
    }

    pub fn is_held(&self, provider: &str, bucket: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(&(provider.to_string(), bucket.to_string()))
            .is_some_and(|(since, _)| since.elapsed() < self.ttl)
    }
}

impl Default for RefreshLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

/// Cross-process advisory locks backed by lock files.
///
/// The lock for a key is `.<token file name>.<provider>.<bucket>.lock` in the
/// token file's directory, created with `create_new` and holding the owner
/// string `<pid>:<lease>`. A file older than `ttl` is stale.
#[derive(Debug)]
pub struct LockFiles {
    dir: PathBuf,
    stem: String,
    ttl: Duration,
}

impl LockFiles {
    pub fn beside(token_file: &Path, ttl: Duration) -> Self {
        let dir = match token_file.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = token_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokens".to_string());
        Self { dir, stem, ttl }
    }

    pub fn path_for(&self, provider: &str, bucket: &str) -> PathBuf {
        self.dir.join(format!(
            ".{}.{}.{}.lock",
            self.stem,
            sanitize(provider),
            sanitize(bucket)
        ))
    }

    pub async fn try_acquire(&self, provider: &str, bucket: &str) -> Result<Option<RefreshLease>> {
        let path = self.path_for(provider, bucket);
        let lease = next_lease();

        for attempt in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(owner(lease).as_bytes())
                        .await
                        .map_err(|e| Error::Io(format!("writing refresh lock: {e}")))?;
                    return Ok(Some(lease));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.is_stale(&path).await {
                        warn!(provider, bucket, path = %path.display(), "taking over stale refresh lock");
                        remove_if_present(&path).await?;
                        continue;
                    }
                    debug!(provider, bucket, "refresh lock busy");
                    return Ok(None);
                }
                Err(e) => return Err(Error::Io(format!("creating refresh lock: {e}"))),
            }
        }
        Ok(None)
    }

    /// Remove the lock file if it still names `lease` as its owner.
    pub async fn release(&self, provider: &str, bucket: &str, lease: RefreshLease) -> Result<bool> {
        let path = self.path_for(provider, bucket);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(format!("reading refresh lock: {e}"))),
        };
        if contents != owner(lease) {
            debug!(provider, bucket, "refresh lock was taken over, leaving it");
            return Ok(false);
        }
        remove_if_present(&path).await?;
        Ok(true)
    }

    async fn is_stale(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .is_ok_and(|age| age >= self.ttl),
            // Vanished between create and stat: free now
            Err(e) => e.kind() == ErrorKind::NotFound,
        }
    }
}

fn owner(lease: RefreshLease) -> String {
    format!("{}:{}", std::process::id(), lease.0)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(format!("removing refresh lock: {e}"))),
    }
}
