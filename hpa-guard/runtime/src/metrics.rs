use hpa_guard_core::ErrorKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

/// All metrics exported by the webhook.
///
/// Built once at startup and handed to each component that reports into it.
#[derive(Clone, Debug)]
pub struct Metrics {
    pub admission: AdmissionMetrics,
    pub errors: ErrorMetrics,
    pub certificates: CertificateMetrics,
}

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    requests: Family<RequestLabels, Counter>,
    duration: Family<KindLabels, Histogram>,
}

#[derive(Clone, Debug)]
pub struct ErrorMetrics {
    errors: Family<ErrorLabels, Counter>,
}

#[derive(Clone, Debug)]
pub struct CertificateMetrics {
    expiry_days: Gauge,
    reloads: Family<ReloadLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    kind: String,
    operation: &'static str,
    allowed: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    error_kind: &'static str,
    retryable: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReloadLabels {
    result: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        Self {
            admission: AdmissionMetrics::register(prom.sub_registry_with_prefix("admission")),
            errors: ErrorMetrics::register(prom),
            certificates: CertificateMetrics::register(
                prom.sub_registry_with_prefix("certificate"),
            ),
        }
    }
}

impl Default for Metrics {
    /// Metrics that are not exported anywhere.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of admission reviews by resource kind, operation, and verdict",
            requests.clone(),
        );

        let duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            // The API server's default webhook timeout is 10s.
            Histogram::new([0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
        });
        prom.register_with_unit(
            "duration",
            "Histogram of admission review latency",
            Unit::Seconds,
            duration.clone(),
        );

        Self { requests, duration }
    }

    pub(crate) fn observe(
        &self,
        kind: &str,
        operation: &'static str,
        allowed: bool,
        elapsed: Duration,
    ) {
        self.requests
            .get_or_create(&RequestLabels {
                kind: kind.to_string(),
                operation,
                allowed: if allowed { "true" } else { "false" },
            })
            .inc();
        self.duration
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }
}

// === impl ErrorMetrics ===

impl ErrorMetrics {
    fn register(prom: &mut Registry) -> Self {
        let errors = Family::default();
        prom.register(
            "errors",
            "Count of classified webhook errors by kind and retryability",
            errors.clone(),
        );
        Self { errors }
    }

    pub(crate) fn inc(&self, kind: ErrorKind, retryable: bool) {
        self.errors
            .get_or_create(&ErrorLabels {
                error_kind: kind.as_str(),
                retryable: if retryable { "true" } else { "false" },
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, kind: ErrorKind, retryable: bool) -> u64 {
        self.errors
            .get_or_create(&ErrorLabels {
                error_kind: kind.as_str(),
                retryable: if retryable { "true" } else { "false" },
            })
            .get()
    }
}

// === impl CertificateMetrics ===

impl CertificateMetrics {
    fn register(prom: &mut Registry) -> Self {
        let expiry_days = Gauge::default();
        prom.register(
            "expiry_days",
            "Days until the active TLS certificate expires",
            expiry_days.clone(),
        );

        let reloads = Family::default();
        prom.register(
            "reloads",
            "Count of certificate reload attempts by result",
            reloads.clone(),
        );

        Self {
            expiry_days,
            reloads,
        }
    }

    pub(crate) fn set_expiry_days(&self, days: i64) {
        self.expiry_days.set(days);
    }

    pub(crate) fn expiry_days(&self) -> i64 {
        self.expiry_days.get()
    }

    pub(crate) fn reloaded(&self, result: &'static str) {
        self.reloads.get_or_create(&ReloadLabels { result }).inc();
    }
}
