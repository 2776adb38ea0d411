//! Profiles: which provider a session talks to and through which buckets

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use token_store::DEFAULT_BUCKET;

use crate::error::{Error, Result};

/// A named provider configuration with its ordered bucket list.
///
/// An empty bucket list means the provider uses the single implicit
/// `default` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub buckets: Vec<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>, provider: impl Into<String>, buckets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            buckets,
        }
    }

    /// Configured buckets, or `[default]` when none are listed.
    pub fn effective_buckets(&self) -> Vec<String> {
        if self.buckets.is_empty() {
            vec![DEFAULT_BUCKET.to_string()]
        } else {
            self.buckets.clone()
        }
    }

    /// Reject empty names and duplicate buckets.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidProfile("profile name must not be empty".into()));
        }
        if self.provider.trim().is_empty() {
            return Err(Error::InvalidProfile(format!(
                "profile '{}' has no provider",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for bucket in &self.buckets {
            if bucket.trim().is_empty() {
                return Err(Error::InvalidProfile(format!(
                    "profile '{}' has an empty bucket name",
                    self.name
                )));
            }
            if !seen.insert(bucket.as_str()) {
                return Err(Error::InvalidProfile(format!(
                    "profile '{}' lists bucket '{bucket}' twice",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
