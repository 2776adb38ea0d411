//! Prometheus metrics exposition
//!
//! The pool crate emits the failover, failure-reason and renewal counters;
//! this module installs the recorder they land in and adds the binary's own:
//!
//! - `oauth_buckets_commands_total` (counter): label `command`
//! - `oauth_renewals_pending` (gauge): label `provider`

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_command(command: &'static str) {
    metrics::counter!("oauth_buckets_commands_total", "command" => command).increment(1);
}

pub fn set_renewals_pending(provider: &str, pending: usize) {
    metrics::gauge!("oauth_renewals_pending", "provider" => provider.to_string())
        .set(pending as f64);
}
