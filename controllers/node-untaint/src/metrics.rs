//! Prometheus metrics for reconciliations.

use crate::error::ControllerError;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Outcome label values
pub const OUTCOME_DONE: &str = "done";
pub const OUTCOME_REQUEUE: &str = "requeue";
pub const OUTCOME_ERROR: &str = "error";

/// Reconciliation metrics, backed by a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    taints_removed: IntCounter,
    reconcile_duration: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "node_untaint_reconciliations_total",
                "Node reconciliations by outcome",
            ),
            &["outcome"],
        )?;
        let taints_removed = IntCounter::new(
            "node_untaint_taints_removed_total",
            "Nodes the target taint was removed from",
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "node_untaint_reconcile_duration_seconds",
                "Time spent reconciling one node",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(taints_removed.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        // Expose every outcome from the start, even at zero
        for outcome in [OUTCOME_DONE, OUTCOME_REQUEUE, OUTCOME_ERROR] {
            reconciliations.with_label_values(&[outcome]);
        }

        Ok(Self {
            registry,
            reconciliations,
            taints_removed,
            reconcile_duration,
        })
    }

    /// Counts one finished reconciliation and its duration.
    pub fn observe(&self, outcome: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[outcome]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn taint_removed(&self) {
        self.taints_removed.inc();
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lists_all_metrics() {
        let metrics = Metrics::new().unwrap();
        let text = metrics.encode().unwrap();

        assert!(text.contains("node_untaint_reconciliations_total{outcome=\"done\"} 0"));
        assert!(text.contains("node_untaint_reconciliations_total{outcome=\"requeue\"} 0"));
        assert!(text.contains("node_untaint_reconciliations_total{outcome=\"error\"} 0"));
        assert!(text.contains("node_untaint_taints_removed_total 0"));
        assert!(text.contains("node_untaint_reconcile_duration_seconds_count 0"));
    }

    #[test]
    fn test_observe_counts_by_outcome() {
        let metrics = Metrics::new().unwrap();
        metrics.observe(OUTCOME_DONE, Duration::from_millis(20));
        metrics.observe(OUTCOME_REQUEUE, Duration::from_millis(20));
        metrics.observe(OUTCOME_REQUEUE, Duration::from_millis(20));
        metrics.taint_removed();

        let text = metrics.encode().unwrap();
        assert!(text.contains("node_untaint_reconciliations_total{outcome=\"done\"} 1"));
        assert!(text.contains("node_untaint_reconciliations_total{outcome=\"requeue\"} 2"));
        assert!(text.contains("node_untaint_taints_removed_total 1"));
        assert!(text.contains("node_untaint_reconcile_duration_seconds_count 3"));
    }
}
