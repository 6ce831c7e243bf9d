use crate::{apis::authproxyworkload_types::AuthProxyWorkload, Error};
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub admission_requests: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = Histogram::with_opts(
            histogram_opts!(
                "apw_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "apw_controller_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new(
            "apw_controller_reconciliations_total",
            "reconciliations",
        )
        .unwrap();
        let admission_requests = IntCounterVec::new(
            opts!(
                "apw_webhook_admission_requests_total",
                "admission requests handled by the workload webhook"
            ),
            &["kind", "outcome"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            admission_requests,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.admission_requests.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, apw: &AuthProxyWorkload, e: &Error) {
        self.failures
            .with_label_values(&[apw.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn admission(&self, kind: &str, outcome: &str) {
        self.admission_requests
            .with_label_values(&[kind, outcome])
            .inc()
    }
}

/// Times one reconcile invocation; the observation lands in the histogram
/// when this guard drops, so early returns are measured too.
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
