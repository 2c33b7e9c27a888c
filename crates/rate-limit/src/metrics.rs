use prometheus::{IntCounterVec, Opts, Registry};

/// Receives the outcome of every take.
pub trait MetricsSink: Send + Sync {
    fn on_consume(&self, store: &str, key: &str, accepted: bool);
}

/// Discards all outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn on_consume(&self, _store: &str, _key: &str, _accepted: bool) {}
}

/// Prometheus counters for consumed and rejected takes, labelled by store.
///
/// Keys are not used as labels: they can be crash signatures and would blow
/// up the series count.
pub struct PrometheusMetrics {
    pub registry: Registry,
    pub consumed_total: IntCounterVec,
    pub rejected_total: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let consumed_total = IntCounterVec::new(
            Opts::new(
                "diagd_rate_limit_consumed_total",
                "Number of takes admitted by the rate limiter",
            ),
            &["store"],
        )?;

        let rejected_total = IntCounterVec::new(
            Opts::new(
                "diagd_rate_limit_rejected_total",
                "Number of takes rejected by the rate limiter",
            ),
            &["store"],
        )?;

        registry.register(Box::new(consumed_total.clone()))?;
        registry.register(Box::new(rejected_total.clone()))?;

        Ok(Self {
            registry,
            consumed_total,
            rejected_total,
        })
    }

    pub fn consumed(&self, store: &str) -> u64 {
        self.consumed_total.with_label_values(&[store]).get()
    }

    pub fn rejected(&self, store: &str) -> u64 {
        self.rejected_total.with_label_values(&[store]).get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn on_consume(&self, store: &str, _key: &str, accepted: bool) {
        if accepted {
            self.consumed_total.with_label_values(&[store]).inc();
        } else {
            self.rejected_total.with_label_values(&[store]).inc();
        }
    }
}
