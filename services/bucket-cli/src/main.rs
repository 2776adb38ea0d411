//! OAuth bucket operator CLI
//!
//! Single binary over the bucket pool that:
//! 1. Loads the active profile and its provider definitions
//! 2. Opens the file-backed token store
//! 3. Runs one command against the profile's buckets:
//!    - `status`: per-bucket token state as JSON
//!    - `token [bucket]`: print a usable access token
//!    - `watch`: keep proactive renewal running until SIGINT/SIGTERM
//!    - `logout [bucket]`: cancel renewal and delete a bucket's token
//!
//! Flags: `--config <path>`, `--metrics` (print Prometheus text on exit).

mod config;
mod metrics;

use anyhow::{Context, Result};
use bucket_pool::{BucketStatus, OAuthManager, Profile};
use provider::{HeadlessProvider, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use token_store::FileTokenStore;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ProviderConfig};

/// How often `watch` republishes the pending-renewal gauge.
const WATCH_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Token(Option<String>),
    Watch,
    Logout(Option<String>),
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Token(_) => "token",
            Command::Watch => "watch",
            Command::Logout(_) => "logout",
        }
    }
}

#[derive(Debug)]
struct Args {
    config: Option<String>,
    metrics: bool,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut metrics = false;
    let mut positional = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config = Some(iter.next().context("--config requires a path")?.clone());
            }
            "--metrics" => metrics = true,
            flag if flag.starts_with("--") => anyhow::bail!("unknown flag: {flag}"),
            _ => positional.push(arg.clone()),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("status") => Command::Status,
        Some("token") => Command::Token(positional.next()),
        Some("watch") => Command::Watch,
        Some("logout") => Command::Logout(positional.next()),
        Some(other) => anyhow::bail!("unknown command: {other}"),
    };
    if let Some(extra) = positional.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }

    Ok(Args {
        config,
        metrics,
        command,
    })
}

fn build_registry(providers: &[ProviderConfig], http: &reqwest::Client) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        registry.register(Arc::new(HeadlessProvider::new(
            &p.name,
            &p.token_url,
            &p.client_id,
            http.clone(),
        )));
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let raw_args: Vec<String> = std::env::args().collect();
    let args = parse_args(&raw_args)?;

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let profile = config
        .active()
        .cloned()
        .context("active profile missing from config")?;

    info!(
        profile = %profile.name,
        provider = %profile.provider,
        buckets = ?profile.effective_buckets(),
        store = %config.store.path.display(),
        "configuration loaded"
    );

    let registry = build_registry(&config.providers, &reqwest::Client::new());
    let store = FileTokenStore::load(config.store.path.clone())
        .await
        .with_context(|| format!("failed to open token store {}", config.store.path.display()))?;
    let manager = Arc::new(OAuthManager::with_policy(
        Arc::new(store),
        registry,
        config.renewal.clone(),
    ));
    manager.set_active_profile(profile.clone()).await;

    metrics::record_command(args.command.label());
    let provider = profile.provider.as_str();
    match args.command {
        Command::Status => {
            let report = status_report(&profile, &manager.bucket_stats(provider).await, common::now_secs());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Token(bucket) => {
            let token = match bucket.as_deref() {
                Some(bucket) => manager
                    .get_oauth_token(provider, Some(bucket))
                    .await?
                    .map(|t| t.access_token),
                None => manager.get_token(provider).await?,
            };
            let token = token.context("no usable token; sign in with the provider's own tooling first")?;
            println!("{token}");
        }
        Command::Watch => watch(&manager, &profile).await?,
        Command::Logout(bucket) => manager.logout(provider, bucket.as_deref()).await?,
    }

    if args.metrics {
        print!("{}", prometheus.render());
    }
    Ok(())
}

/// JSON status for the active profile. `expires_in_secs` is negative once a
/// token has expired.
fn status_report(profile: &Profile, statuses: &[BucketStatus], now: u64) -> serde_json::Value {
    let buckets: Vec<serde_json::Value> = statuses
        .iter()
        .map(|s| {
            let token = match &s.stats {
                Some(stats) => serde_json::json!({
                    "expires_in_secs": stats.remaining_secs(now),
                    "refreshable": stats.refreshable,
                    "saved_at": stats.saved_at,
                }),
                None => serde_json::Value::Null,
            };
            serde_json::json!({
                "bucket": s.bucket,
                "session": s.session,
                "renewal_pending": s.renewal_pending,
                "token": token,
            })
        })
        .collect();

    serde_json::json!({
        "profile": profile.name,
        "provider": profile.provider,
        "buckets": buckets,
    })
}

/// Keep proactive renewal running for the profile until a shutdown signal.
async fn watch(manager: &OAuthManager, profile: &Profile) -> Result<()> {
    let provider = profile.provider.as_str();
    let scheduled = manager.configure_proactive_renewals_for_profile(profile).await;
    metrics::set_renewals_pending(provider, scheduled);

    for status in manager.bucket_stats(provider).await {
        if status.stats.is_none() {
            warn!(provider, bucket = %status.bucket, "no stored token, bucket will not renew");
        }
    }
    info!(provider, scheduled, "watching buckets");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut tick = tokio::time::interval(WATCH_TICK);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = tick.tick() => {
                let pending = manager.scheduler().pending().len();
                metrics::set_renewals_pending(provider, pending);
                debug!(provider, pending, "renewal timers");
            }
        }
    }

    let cancelled = manager.scheduler().cancel_all();
    info!(cancelled, "renewal stopped, shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("received SIGINT, shutting down");
            result
        }
        result = terminate => {
            info!("received SIGTERM, shutting down");
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OAuthToken;
    use token_store::{MemoryTokenStore, TokenStore};

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("oauth-buckets")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_defaults_to_status() {
        let parsed = parse_args(&args(&[])).unwrap();
        assert_eq!(parsed.command, Command::Status);
        assert!(parsed.config.is_none());
        assert!(!parsed.metrics);
    }

    #[test]
    fn parse_flags_and_command() {
        let parsed = parse_args(&args(&["--config", "/etc/b.toml", "token", "team-b", "--metrics"])).unwrap();
        assert_eq!(parsed.config.as_deref(), Some("/etc/b.toml"));
        assert!(parsed.metrics);
        assert_eq!(parsed.command, Command::Token(Some("team-b".into())));

        let parsed = parse_args(&args(&["logout"])).unwrap();
        assert_eq!(parsed.command, Command::Logout(None));
        assert_eq!(parse_args(&args(&["watch"])).unwrap().command, Command::Watch);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
        assert!(parse_args(&args(&["refresh"])).is_err());
        assert!(parse_args(&args(&["token", "a", "b"])).is_err());
    }

    #[test]
    fn registry_has_every_configured_provider() {
        let providers = vec![
            ProviderConfig {
                name: "anthropic".into(),
                token_url: "https://example.com/token".into(),
                client_id: "id".into(),
            },
            ProviderConfig {
                name: "gemini".into(),
                token_url: "https://example.org/token".into(),
                client_id: "id".into(),
            },
        ];
        let registry = build_registry(&providers, &reqwest::Client::new());
        assert_eq!(registry.names(), vec!["anthropic", "gemini"]);
    }

    #[tokio::test]
    async fn status_report_describes_each_bucket() {
        let now = common::now_secs();
        let store = MemoryTokenStore::new();
        store
            .save_token("anthropic", "team-a", OAuthToken::bearer("at", "rt", now + 600))
            .await
            .unwrap();
        let manager = OAuthManager::new(Arc::new(store), ProviderRegistry::new());
        let profile = Profile::new("work", "anthropic", vec!["team-a".into(), "team-b".into()]);
        manager.set_active_profile(profile.clone()).await;
        manager.set_session_bucket("anthropic", "team-a").await;

        let report = status_report(&profile, &manager.bucket_stats("anthropic").await, now);
        assert_eq!(report["profile"], "work");
        assert_eq!(report["buckets"][0]["bucket"], "team-a");
        assert_eq!(report["buckets"][0]["session"], true);
        assert_eq!(report["buckets"][0]["token"]["expires_in_secs"], 600);
        assert_eq!(report["buckets"][0]["token"]["refreshable"], true);
        assert!(report["buckets"][1]["token"].is_null());
    }
}
