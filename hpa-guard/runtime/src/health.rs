use crate::certs::{CertificateInfo, CertificateManager};
use chrono::Utc;
use hpa_guard_core::{ClusterState, Deployment, Validator, WebhookError};
use serde::Serialize;
use std::collections::BTreeMap;

/// Certificates closer than this to expiry are reported, but still healthy.
const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
    pub components: BTreeMap<&'static str, ComponentStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentStatus {
    pub status: Status,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Full health: Kubernetes reachability, the serving certificate, and a
/// validator smoke test.
pub async fn health<C: ClusterState>(
    validator: &Validator<C>,
    certs: &CertificateManager,
) -> HealthReport {
    let kubernetes = kubernetes(validator.cluster()).await;
    let certificate = certificate(&certs.info(), certs.ca_certificates());
    let validator = smoke_test(validator).await;
    HealthReport::new(
        "all components are healthy",
        [
            ("kubernetes", kubernetes),
            ("certificate", certificate),
            ("validator", validator),
        ],
    )
}

/// Readiness: Kubernetes reachability and that the configured certificate
/// files still load.
pub async fn readiness<C: ClusterState>(
    validator: &Validator<C>,
    certs: &CertificateManager,
) -> HealthReport {
    let kubernetes = kubernetes(validator.cluster()).await;
    let certificate = match certs.check_loadable().await {
        Ok(info) => certificate(&info, certs.ca_certificates()),
        Err(error) => ComponentStatus::error(error.to_string()),
    };
    HealthReport::new(
        "ready",
        [("kubernetes", kubernetes), ("certificate", certificate)],
    )
}

async fn kubernetes<C: ClusterState>(cluster: &C) -> ComponentStatus {
    match cluster.check_connectivity().await {
        Ok(()) => ComponentStatus::ok("Kubernetes API is reachable"),
        Err(error) => ComponentStatus::error(format!("Kubernetes API is unreachable: {error}")),
    }
}

fn certificate(info: &CertificateInfo, ca_certificates: Option<usize>) -> ComponentStatus {
    let now = Utc::now();
    if info.not_after <= now {
        return ComponentStatus::error(format!(
            "certificate {} expired at {}",
            info.subject,
            info.not_after.to_rfc3339()
        ));
    }

    let days = (info.not_after - now).num_days();
    let mut message = if days < EXPIRY_WARNING_DAYS {
        format!("certificate expires soon: {days} days remaining")
    } else {
        format!("certificate valid for {days} more days")
    };
    if let Some(n) = ca_certificates {
        message.push_str(&format!("; CA bundle has {n} certificate(s)"));
    }
    ComponentStatus::ok(message)
}

async fn smoke_test<C: ClusterState>(validator: &Validator<C>) -> ComponentStatus {
    let probe = Deployment::new("hpa-guard-health", "health-probe", 2);
    match validator.validate_deployment(&probe).await {
        Ok(()) => ComponentStatus::ok("validator is functional"),
        Err(WebhookError { message, .. }) => {
            ComponentStatus::error(format!("validator smoke test failed: {message}"))
        }
    }
}

// === impl HealthReport ===

impl HealthReport {
    fn new<const N: usize>(
        healthy_message: &str,
        components: [(&'static str, ComponentStatus); N],
    ) -> Self {
        let components = components.into_iter().collect::<BTreeMap<_, _>>();
        let failed = components
            .iter()
            .filter(|(_, c)| c.status == Status::Error)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();
        let (status, message) = if failed.is_empty() {
            (Status::Ok, healthy_message.to_string())
        } else {
            (Status::Error, format!("unhealthy: {}", failed.join(", ")))
        };
        Self {
            status,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
            components,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Status::Ok
    }
}

// === impl ComponentStatus ===

impl ComponentStatus {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
        }
    }
}
