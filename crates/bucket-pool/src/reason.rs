//! Failure reasons and failover triggers
//!
//! A failover is triggered by an upstream status that points at the
//! credential or its quota. Each bucket evaluated during a failover gets one
//! `BucketFailureReason`; reasons are internal classifications reported to
//! the caller, never errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a bucket could not serve the request during a failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketFailureReason {
    /// 429/402 from upstream: wait condition, not a credential problem
    QuotaExhausted,
    /// Token expired and refresh produced nothing, or the server revoked it
    ExpiredRefreshFailed,
    /// Nothing stored, or the store could not be read
    NoToken,
    /// Not evaluated, or failure unrelated to credentials
    Skipped,
    /// Interactive re-authentication failed
    ReauthFailed,
}

impl BucketFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketFailureReason::QuotaExhausted => "quota-exhausted",
            BucketFailureReason::ExpiredRefreshFailed => "expired-refresh-failed",
            BucketFailureReason::NoToken => "no-token",
            BucketFailureReason::Skipped => "skipped",
            BucketFailureReason::ReauthFailed => "reauth-failed",
        }
    }

    /// Whether interactive re-authentication could fix the bucket.
    pub fn is_reauth_eligible(&self) -> bool {
        matches!(
            self,
            BucketFailureReason::ExpiredRefreshFailed | BucketFailureReason::NoToken
        )
    }
}

impl fmt::Display for BucketFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details about the failed request that triggered a failover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailoverContext {
    pub triggering_status: Option<u16>,
}

impl FailoverContext {
    pub fn from_status(status: u16) -> Self {
        Self {
            triggering_status: Some(status),
        }
    }
}

/// Upstream statuses that should trigger a bucket failover.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 402 | 403 | 429)
}

/// Statuses that mean the bucket is out of quota rather than out of credentials.
pub fn is_quota_status(status: u16) -> bool {
    matches!(status, 402 | 429)
}

/// Statuses that mean the server rejected a token that looks valid locally.
pub fn is_auth_rejection_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}
