//! Prometheus metrics
//!
//! Metrics are recorded through the `metrics` facade; the binary installs the
//! Prometheus exporter.

use std::time::Duration;

/// Per-controller reconciliation metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Metrics labelled with the reconciled kind
    pub fn new(controller: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "marketplace_operator_reconciliations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "marketplace_operator_reconciliation_errors_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "marketplace_operator_reconciliation_duration_seconds",
                "controller" => controller
            ),
        }
    }
}

/// Record one app-registry request made on behalf of an operator source
///
/// `code` is the HTTP status code, or `0` when no response was received.
pub fn record_registry_request(opsrc: &str, code: u16, elapsed: Duration) {
    metrics::counter!(
        "marketplace_app_registry_requests_total",
        "opsrc" => opsrc.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "marketplace_app_registry_request_duration_seconds",
        "opsrc" => opsrc.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record the outcome of one update poll of a source
pub fn record_poll(opsrc: &str, updated: bool) {
    metrics::counter!(
        "marketplace_update_polls_total",
        "opsrc" => opsrc.to_string(),
        "updated" => updated.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_harmless() {
        let metrics = ControllerMetrics::new("operatorsource");
        metrics.reconciliations.increment(1);
        metrics.duration.record(0.5);
        record_registry_request("community-operators", 200, Duration::from_millis(12));
        record_poll("community-operators", false);
    }
}
