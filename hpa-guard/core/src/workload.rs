//! Projections of the Kubernetes resources the webhook reasons about.
//!
//! Only the fields that matter to the replica/autoscaler invariant are kept.
//! Both the admission path and the cluster reads convert into these types so
//! the validator never depends on a particular API version.

use k8s_openapi::api::{apps::v1 as appsv1, autoscaling::v1 as autoscalingv1, autoscaling::v2};

/// The Kubernetes default for an unset `spec.replicas`.
const DEFAULT_REPLICAS: i32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HorizontalPodAutoscaler {
    pub name: String,
    pub namespace: String,
    pub scale_target_ref: ScaleTargetRef,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaleTargetRef {
    pub kind: String,
    pub name: String,
}

// === impl Deployment ===

impl Deployment {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, replicas: i32) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            replicas,
        }
    }
}

impl From<appsv1::Deployment> for Deployment {
    fn from(deployment: appsv1::Deployment) -> Self {
        let replicas = deployment
            .spec
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS);
        Self {
            name: deployment.metadata.name.unwrap_or_default(),
            namespace: deployment.metadata.namespace.unwrap_or_default(),
            replicas,
        }
    }
}

// === impl HorizontalPodAutoscaler ===

impl HorizontalPodAutoscaler {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        scale_target_ref: ScaleTargetRef,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            scale_target_ref,
        }
    }

    /// Returns true if this HPA scales the named Deployment.
    ///
    /// HPA scale targets are always resolved in the HPA's own namespace.
    pub fn targets_deployment(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace
            && self.scale_target_ref.is_deployment()
            && self.scale_target_ref.name == name
    }
}

impl From<v2::HorizontalPodAutoscaler> for HorizontalPodAutoscaler {
    fn from(hpa: v2::HorizontalPodAutoscaler) -> Self {
        let scale_target_ref = hpa
            .spec
            .map(|spec| ScaleTargetRef {
                kind: spec.scale_target_ref.kind,
                name: spec.scale_target_ref.name,
            })
            .unwrap_or_default();
        Self {
            name: hpa.metadata.name.unwrap_or_default(),
            namespace: hpa.metadata.namespace.unwrap_or_default(),
            scale_target_ref,
        }
    }
}

impl From<autoscalingv1::HorizontalPodAutoscaler> for HorizontalPodAutoscaler {
    fn from(hpa: autoscalingv1::HorizontalPodAutoscaler) -> Self {
        let scale_target_ref = hpa
            .spec
            .map(|spec| ScaleTargetRef {
                kind: spec.scale_target_ref.kind,
                name: spec.scale_target_ref.name,
            })
            .unwrap_or_default();
        Self {
            name: hpa.metadata.name.unwrap_or_default(),
            namespace: hpa.metadata.namespace.unwrap_or_default(),
            scale_target_ref,
        }
    }
}

// === impl ScaleTargetRef ===

impl ScaleTargetRef {
    pub fn deployment(name: impl Into<String>) -> Self {
        Self {
            kind: "Deployment".to_string(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn is_deployment(&self) -> bool {
        self.kind == "Deployment"
    }
}
