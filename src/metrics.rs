//! Prometheus metrics for the reconciliation loop and the admission webhook

use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Operator metrics, registered in a dedicated registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub reconciliations: IntCounter,
    pub reconcile_failures: IntCounter,
    pub reconcile_duration: Histogram,
    pub cleanup_requeues: IntCounter,
    pub admission_reviews: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations = IntCounter::new(
            "nfspvc_reconciliations_total",
            "Total number of NfsPvc reconciliation passes",
        )?;
        let reconcile_failures = IntCounter::new(
            "nfspvc_reconcile_failures_total",
            "Number of reconciliation passes that returned an error",
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "nfspvc_reconcile_duration_seconds",
                "Duration of NfsPvc reconciliation passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let cleanup_requeues = IntCounter::new(
            "nfspvc_cleanup_requeues_total",
            "Passes that requeued while storage objects were being deleted",
        )?;
        let admission_reviews = IntCounterVec::new(
            Opts::new(
                "nfspvc_admission_reviews_total",
                "Admission reviews handled by the validating webhook",
            ),
            &["operation", "allowed"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_failures.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(cleanup_requeues.clone()))?;
        registry.register(Box::new(admission_reviews.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_failures,
            reconcile_duration,
            cleanup_requeues,
            admission_reviews,
        })
    }

    /// Count one admission review
    pub fn record_admission(&self, operation: &str, allowed: bool) {
        self.admission_reviews
            .with_label_values(&[operation, if allowed { "true" } else { "false" }])
            .inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.reconciliations.inc();
        metrics.record_admission("CREATE", false);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("nfspvc_reconciliations_total 1"));
        assert!(text.contains(r#"nfspvc_admission_reviews_total{allowed="false",operation="CREATE"} 1"#));
    }
}
