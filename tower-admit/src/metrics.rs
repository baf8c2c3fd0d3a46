use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

/// Counters shared by every admission service.
#[derive(Clone, Debug)]
pub(crate) struct AdmissionMetrics {
    rejected: Counter<u64>,
    early_wake: Counter<u64>,
    attributes: [KeyValue; 1],
}

impl AdmissionMetrics {
    pub(crate) fn new(limiter: &'static str) -> Self {
        let meter = global::meter("tower_admit");
        Self {
            rejected: meter.u64_counter("admission.rejected").build(),
            early_wake: meter.u64_counter("admission.early_wake").build(),
            attributes: [KeyValue::new("limiter", limiter)],
        }
    }

    pub(crate) fn rejected(&self) {
        self.rejected.add(1, &self.attributes);
    }

    /// A waiting service was polled before its retry timer fired.
    pub(crate) fn early_wake(&self) {
        self.early_wake.add(1, &self.attributes);
    }
}
