//! Error types for bucket pool operations

use std::collections::{BTreeMap, HashMap};

use crate::reason::BucketFailureReason;

/// Errors from manager operations.
///
/// Failover never surfaces these; it folds them into a `BucketFailureReason`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("token store error: {0}")]
    Store(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("interactive authentication unavailable: {0}")]
    InteractiveUnavailable(String),

    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error carried as the cause of an exhausted failover.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal error raised by the request layer once failover is exhausted.
///
/// The message is built once in the constructor. Mutating the public fields
/// afterwards does not change what `Display` prints.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AllBucketsExhaustedError {
    pub provider_name: String,
    pub attempted_buckets: Vec<String>,
    #[source]
    pub last_error: BoxError,
    pub bucket_failure_reasons: HashMap<String, BucketFailureReason>,
    message: String,
}

impl AllBucketsExhaustedError {
    pub fn new(
        provider_name: impl Into<String>,
        attempted_buckets: Vec<String>,
        last_error: impl Into<BoxError>,
    ) -> Self {
        Self::with_failure_reasons(provider_name, attempted_buckets, last_error, HashMap::new())
    }

    pub fn with_failure_reasons(
        provider_name: impl Into<String>,
        attempted_buckets: Vec<String>,
        last_error: impl Into<BoxError>,
        bucket_failure_reasons: HashMap<String, BucketFailureReason>,
    ) -> Self {
        let provider_name = provider_name.into();
        let message = build_message(&provider_name, &attempted_buckets, &bucket_failure_reasons);
        Self {
            provider_name,
            attempted_buckets,
            last_error: last_error.into(),
            bucket_failure_reasons,
            message,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn build_message(
    provider: &str,
    attempted: &[String],
    reasons: &HashMap<String, BucketFailureReason>,
) -> String {
    let mut message = format!(
        "All buckets exhausted for provider '{provider}': {}",
        attempted.join(", ")
    );
    if reasons.is_empty() {
        return message;
    }

    message.push_str("\nBucket failure reasons:");
    for bucket in attempted {
        if let Some(reason) = reasons.get(bucket) {
            message.push_str(&format!("\n  {bucket}: {reason}"));
        }
    }
    // Reasons for buckets outside the attempted list, in stable order
    let extra: BTreeMap<&String, &BucketFailureReason> = reasons
        .iter()
        .filter(|(bucket, _)| !attempted.contains(bucket))
        .collect();
    for (bucket, reason) in extra {
        message.push_str(&format!("\n  {bucket}: {reason}"));
    }
    message
}
