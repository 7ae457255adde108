//! Prometheus metrics exposition
//!
//! Service-level metrics:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `auth_state` (gauge): label `state`, 1 for the current state, 0 otherwise
//!
//! The auth-guard crate adds `auth_guard_transitions_total`,
//! `auth_guard_recovery_attempts_total` and `auth_guard_blocked_requests_total`
//! through the same recorder.

use auth_guard::AuthState;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("histogram buckets are non-empty")
}

/// Install the Prometheus recorder globally and return a handle for `/metrics`.
///
/// Explicit buckets make `proxy_request_duration_seconds` render as a
/// histogram (`_bucket` lines) instead of a summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder().install_recorder()?)
}

/// Recorder that is not installed globally, for tests and embedding.
pub fn build_recorder() -> PrometheusRecorder {
    builder().build_recorder()
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Publish the current auth state as a one-hot gauge.
pub fn set_auth_state(current: AuthState) {
    for state in [AuthState::Valid, AuthState::Invalid, AuthState::Recovering] {
        let value = if state == current { 1.0 } else { 0.0 };
        metrics::gauge!("auth_state", "state" => state.as_str()).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_upstream_error("timeout");
        set_auth_state(AuthState::Recovering);
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let recorder = build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(503, "POST", 0.001);

        let output = handle.render();
        assert!(output.contains("proxy_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("proxy_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"30\""), "30s bucket must exist");
    }

    #[test]
    fn record_upstream_error_carries_label() {
        let recorder = build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("auth_invalid");

        let output = handle.render();
        assert!(output.contains("proxy_upstream_errors_total"));
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"auth_invalid\""));
    }

    #[test]
    fn auth_state_gauge_is_one_hot() {
        let recorder = build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        set_auth_state(AuthState::Invalid);

        let output = handle.render();
        let value = |state: &str| -> f64 {
            let prefix = format!("auth_state{{state=\"{state}\"}} ");
            output
                .lines()
                .find_map(|line| line.strip_prefix(prefix.as_str()))
                .unwrap_or_else(|| panic!("missing gauge for {state}:\n{output}"))
                .trim()
                .parse()
                .unwrap()
        };
        assert_eq!(value("invalid"), 1.0);
        assert_eq!(value("valid"), 0.0);
        assert_eq!(value("recovering"), 0.0);
    }
}
