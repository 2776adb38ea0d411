//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The token store path can be overridden with `OAUTH_BUCKETS_STORE` so the
//! same config works across machines.

use bucket_pool::{Profile, RenewalPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Name of the profile this session runs
    pub active_profile: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub renewal: RenewalPolicy,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Token store settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// A provider refreshed through the standard refresh-token grant
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub token_url: String,
    pub client_id: String,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("oauth-tokens.json")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(store_path) = std::env::var("OAUTH_BUCKETS_STORE")
            && !store_path.is_empty()
        {
            config.store.path = PathBuf::from(store_path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(common::Error::Config("provider name must not be empty".into()));
            }
            if !provider_names.insert(provider.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "provider '{}' declared twice",
                    provider.name
                )));
            }
            // Validate token_url is a valid URL with http(s) scheme
            if !provider.token_url.starts_with("http://")
                && !provider.token_url.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "token_url for provider '{}' must start with http:// or https://, got: {}",
                    provider.name, provider.token_url
                )));
            }
        }

        for profile in &self.profiles {
            profile
                .validate()
                .map_err(|e| common::Error::Config(e.to_string()))?;
        }

        let active = self.active().ok_or_else(|| {
            common::Error::Config(format!(
                "active_profile '{}' is not defined",
                self.active_profile
            ))
        })?;
        if !provider_names.contains(active.provider.as_str()) {
            return Err(common::Error::Config(format!(
                "profile '{}' uses undeclared provider '{}'",
                active.name, active.provider
            )));
        }

        if !(0.0..1.0).contains(&self.renewal.lead_fraction) {
            return Err(common::Error::Config(
                "renewal.lead_fraction must be in [0, 1)".into(),
            ));
        }
        if self.renewal.max_failures == 0 {
            return Err(common::Error::Config(
                "renewal.max_failures must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// The profile named by `active_profile`.
    pub fn active(&self) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == self.active_profile)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-buckets.toml")
    }
}
