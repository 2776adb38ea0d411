//! Multi-bucket OAuth credential pool
//!
//! A provider can be configured with several independent credential buckets
//! (separate accounts or subscriptions). This crate keeps one usable bucket
//! selected per provider and recovers when it stops working.
//!
//! Bucket lifecycle:
//! 1. Profile lists the buckets → `OAuthManager` picks the first as the session bucket
//! 2. Each request peeks the session bucket's token (`OAuthManager::get_token`)
//! 3. Background timers refresh tokens before expiry (`RenewalScheduler`)
//! 4. Upstream returns 401/402/403/429 → `BucketFailoverHandler::try_failover`
//!    classifies the bucket and switches, refreshes or re-authenticates
//! 5. Nothing left → the caller raises `AllBucketsExhaustedError` with the
//!    per-bucket reasons

pub mod error;
pub mod failover;
pub mod manager;
pub mod metrics;
pub mod profile;
pub mod reason;
pub mod renewal;

#[cfg(test)]
mod test_support;

pub use error::{AllBucketsExhaustedError, BoxError, Error, Result};
pub use failover::BucketFailoverHandler;
pub use manager::{BucketStatus, OAuthManager};
pub use profile::Profile;
pub use reason::{
    BucketFailureReason, FailoverContext, is_auth_rejection_status, is_failover_status,
    is_quota_status,
};
pub use renewal::{RenewalPolicy, RenewalScheduler};
