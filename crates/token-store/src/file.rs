//! File-backed token storage
//!
//! Manages a JSON file mapping provider → bucket → token. Several processes
//! may share the file (a long-running `watch` next to one-shot commands), so
//! nothing is cached: reads parse the file, and writes re-read it, apply one
//! change and write it back with an atomic temp-file + rename. A tokio Mutex
//! serializes read-modify-write cycles within the process. Refresh locks are
//! lock files next to the token file so they hold across processes.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::OAuthToken;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TTL, LockFiles, RefreshLease};
use crate::{BoxFuture, BucketStats, StoredToken, TokenStore};

type Buckets = HashMap<String, StoredToken>;

/// On-disk layout: provider → bucket → token.
type State = HashMap<String, Buckets>;

/// Thread-safe token file manager.
pub struct FileTokenStore {
    path: PathBuf,
    write: Mutex<()>,
    locks: LockFiles,
}

impl FileTokenStore {
    /// Open the token file at `path`.
    ///
    /// If the file doesn't exist, creates it (and its parent directory) as
    /// `{}` so every bucket starts without a token. An unparseable file is an
    /// error here rather than on the first request.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let state = read_state(&path).await?;
            info!(
                path = %path.display(),
                providers = state.len(),
                buckets = state.values().map(HashMap::len).sum::<usize>(),
                "loaded tokens"
            );
        } else {
            info!(path = %path.display(), "token file not found, starting with empty store");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;
            }
            write_atomic(&path, &State::new()).await?;
        }

        let locks = LockFiles::beside(&path, DEFAULT_LOCK_TTL);
        Ok(Self {
            path,
            write: Mutex::new(()),
            locks,
        })
    }

    /// Replace the refresh lock TTL (default 60 s).
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.locks = LockFiles::beside(&self.path, ttl);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of stored bucket tokens across providers.
    pub async fn len(&self) -> Result<usize> {
        let state = read_state(&self.path).await?;
        Ok(state.values().map(HashMap::len).sum())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn save(&self, provider: &str, bucket: &str, token: OAuthToken) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut state = read_state(&self.path).await?;
        state.entry(provider.to_string()).or_default().insert(
            bucket.to_string(),
            StoredToken {
                token,
                saved_at: common::now_secs(),
            },
        );
        debug!(provider, bucket, "saved token");
        write_atomic(&self.path, &state).await
    }

    async fn get(&self, provider: &str, bucket: &str) -> Result<Option<StoredToken>> {
        let mut state = read_state(&self.path).await?;
        Ok(state.get_mut(provider).and_then(|b| b.remove(bucket)))
    }

    async fn remove(&self, provider: &str, bucket: &str) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut state = read_state(&self.path).await?;
        let Some(buckets) = state.get_mut(provider) else {
            return Ok(());
        };
        if buckets.remove(bucket).is_none() {
            return Ok(());
        }
        if buckets.is_empty() {
            state.remove(provider);
        }
        debug!(provider, bucket, "removed token");
        write_atomic(&self.path, &state).await
    }
}

impl TokenStore for FileTokenStore {
    fn save_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        token: OAuthToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.save(provider, bucket, token))
    }

    fn get_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<OAuthToken>>> {
        Box::pin(async move { Ok(self.get(provider, bucket).await?.map(|s| s.token)) })
    }

    fn remove_token<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove(provider, bucket))
    }

    fn list_providers(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let state = read_state(&self.path).await?;
            let mut providers: Vec<String> = state.into_keys().collect();
            providers.sort();
            Ok(providers)
        })
    }

    fn list_buckets<'a>(&'a self, provider: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut state = read_state(&self.path).await?;
            let mut buckets: Vec<String> = state
                .remove(provider)
                .map(|b| b.into_keys().collect())
                .unwrap_or_default();
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
            Ok(self
                .get(provider, bucket)
                .await?
                .map(|stored| BucketStats::from_stored(bucket, &stored)))
        })
    }

    fn acquire_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
    ) -> BoxFuture<'a, Result<Option<RefreshLease>>> {
        Box::pin(self.locks.try_acquire(provider, bucket))
    }

    fn release_refresh_lock<'a>(
        &'a self,
        provider: &'a str,
        bucket: &'a str,
        lease: RefreshLease,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.locks.release(provider, bucket, lease).await?;
            Ok(())
        })
    }
}

/// Parse the token file. A missing or blank file is an empty store.
async fn read_state(path: &Path) -> Result<State> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(State::new()),
        Err(e) => return Err(Error::Io(format!("reading token file: {e}"))),
    };
    if contents.trim().is_empty() {
        return Ok(State::new());
    }
    serde_json::from_str(&contents).map_err(|e| Error::Parse(format!("parsing token file: {e}")))
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the token map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains OAuth tokens. Keys are written sorted so the file diffs
/// cleanly.
async fn write_atomic(path: &Path, data: &State) -> Result<()> {
    let sorted: BTreeMap<&String, BTreeMap<&String, &StoredToken>> = data
        .iter()
        .map(|(provider, buckets)| (provider, buckets.iter().collect()))
        .collect();
    let json = serde_json::to_string_pretty(&sorted)
        .map_err(|e| Error::Parse(format!("serializing tokens: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };

    // Unique per write: other instances may be writing the same file
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".tokens.tmp.{}.{seq}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted tokens");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_token(suffix: &str) -> OAuthToken {
        OAuthToken::bearer(format!("at_{suffix}"), format!("rt_{suffix}"), 1_735_500_000)
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::load(path.clone()).await.unwrap();
        store
            .save_token("anthropic", "work", test_token("work"))
            .await
            .unwrap();

        let reloaded = FileTokenStore::load(path).await.unwrap();
        let token = reloaded.get_token("anthropic", "work").await.unwrap().unwrap();
        assert_eq!(token.access_token, "at_work");
        assert_eq!(token.refresh_token, "rt_work");
        assert!(reloaded.get_token("anthropic", "personal").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");

        assert!(!path.exists());
        let store = FileTokenStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await.unwrap());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: State = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = FileTokenStore::load(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn remove_prunes_empty_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        store.save_token("anthropic", "a", test_token("a")).await.unwrap();
        store.save_token("anthropic", "b", test_token("b")).await.unwrap();
        store.save_token("gemini", "default", test_token("g")).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 3);

        store.remove_token("anthropic", "a").await.unwrap();
        assert_eq!(store.list_buckets("anthropic").await.unwrap(), vec!["b"]);

        store.remove_token("anthropic", "b").await.unwrap();
        assert_eq!(store.list_providers().await.unwrap(), vec!["gemini"]);

        // Removing again is fine
        store.remove_token("anthropic", "b").await.unwrap();
    }

    #[tokio::test]
    async fn bucket_stats_reflect_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();
        store
            .save_token("anthropic", "ci", OAuthToken::bearer("at", "", 42))
            .await
            .unwrap();

        let stats = store.get_bucket_stats("anthropic", "ci").await.unwrap().unwrap();
        assert_eq!(stats.bucket, "ci");
        assert_eq!(stats.expiry, 42);
        assert!(!stats.refreshable);
        assert!(stats.saved_at > 0);
        assert_eq!(stats.remaining_secs(40), 2);
        assert_eq!(stats.remaining_secs(50), -8);
        assert!(store.get_bucket_stats("anthropic", "none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("tokens.json"))
            .await
            .unwrap();

        let lease = store.acquire_refresh_lock("anthropic", "a").await.unwrap().unwrap();
        assert!(store.acquire_refresh_lock("anthropic", "a").await.unwrap().is_none());
        store.release_refresh_lock("anthropic", "a", lease).await.unwrap();
        assert!(store.acquire_refresh_lock("anthropic", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn instances_sharing_a_file_keep_each_others_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let watcher = FileTokenStore::load(path.clone()).await.unwrap();
        let one_shot = FileTokenStore::load(path.clone()).await.unwrap();

        one_shot.save_token("anthropic", "a", test_token("rotated")).await.unwrap();
        watcher.save_token("anthropic", "b", test_token("b")).await.unwrap();

        // Visible to the other instance without reopening
        let seen = watcher.get_token("anthropic", "a").await.unwrap().unwrap();
        assert_eq!(seen.refresh_token, "rt_rotated");

        let reloaded = FileTokenStore::load(path).await.unwrap();
        assert_eq!(reloaded.list_buckets("anthropic").await.unwrap(), vec!["a", "b"]);

        watcher.remove_token("anthropic", "b").await.unwrap();
        assert!(one_shot.get_token("anthropic", "a").await.unwrap().is_some());
        assert!(one_shot.get_token("anthropic", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_lock_spans_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let first = FileTokenStore::load(path.clone()).await.unwrap();
        let second = FileTokenStore::load(path).await.unwrap();

        let lease = first.acquire_refresh_lock("anthropic", "a").await.unwrap().unwrap();
        assert!(second.acquire_refresh_lock("anthropic", "a").await.unwrap().is_none());

        first.release_refresh_lock("anthropic", "a", lease).await.unwrap();
        assert!(second.acquire_refresh_lock("anthropic", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_refresh_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let crashed = FileTokenStore::load(path.clone()).await.unwrap();
        let survivor = FileTokenStore::load(path)
            .await
            .unwrap()
            .with_lock_ttl(Duration::ZERO);

        let old = crashed.acquire_refresh_lock("anthropic", "a").await.unwrap().unwrap();
        let new = survivor.acquire_refresh_lock("anthropic", "a").await.unwrap().unwrap();
        assert_ne!(old, new);

        // Late release by the old holder leaves the survivor's lock in place
        crashed.release_refresh_lock("anthropic", "a", old).await.unwrap();
        assert!(crashed.acquire_refresh_lock("anthropic", "a").await.unwrap().is_none());
        survivor.release_refresh_lock("anthropic", "a", new).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::load(path.clone()).await.unwrap();
        store.save_token("anthropic", "a", test_token("a")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = std::sync::Arc::new(FileTokenStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save_token("anthropic", &format!("bucket-{i}"), test_token(&i.to_string()))
                    .await
                    .unwrap();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await.unwrap(), 10);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: State = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["anthropic"].len(), 10);
    }
}
