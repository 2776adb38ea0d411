//! Bucket pool counters
//!
//! - `oauth_bucket_failover_total` (counter): labels `provider`, `outcome`
//! - `oauth_bucket_failure_reasons_total` (counter): labels `provider`, `reason`
//! - `oauth_renewal_total` (counter): labels `provider`, `outcome`
//!
//! Without an installed recorder every call is a no-op.

use crate::reason::BucketFailureReason;

pub fn record_failover(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "oauth_bucket_failover_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_failure_reason(provider: &str, reason: BucketFailureReason) {
    metrics::counter!(
        "oauth_bucket_failure_reasons_total",
        "provider" => provider.to_string(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

pub fn record_renewal(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "oauth_renewal_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
