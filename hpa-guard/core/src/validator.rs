use crate::{Deployment, HorizontalPodAutoscaler, WebhookError, SINGLE_REPLICA};
use tracing::{debug, trace};

/// Read access to live cluster state.
///
/// Every call is expected to reach the Kubernetes API; implementations must
/// not cache, so that each admission decision reflects the latest committed
/// state.
#[async_trait::async_trait]
pub trait ClusterState: Send + Sync {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, WebhookError>;

    async fn list_hpas(
        &self,
        namespace: &str,
    ) -> Result<Vec<HorizontalPodAutoscaler>, WebhookError>;

    /// Checks that the Kubernetes API is reachable.
    async fn check_connectivity(&self) -> Result<(), WebhookError>;
}

/// Enforces that no HPA targets a single-replica Deployment.
#[derive(Clone, Debug)]
pub struct Validator<C> {
    cluster: C,
}

// === impl Validator ===

impl<C: ClusterState> Validator<C> {
    pub fn new(cluster: C) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Denies a Deployment with a single replica when an HPA in its namespace
    /// targets it.
    pub async fn validate_deployment(&self, deployment: &Deployment) -> Result<(), WebhookError> {
        if deployment.replicas != SINGLE_REPLICA {
            trace!(replicas = deployment.replicas, "No HPA conflict possible");
            return Ok(());
        }

        let hpas = self.cluster.list_hpas(&deployment.namespace).await?;
        let conflict = hpas
            .iter()
            .find(|hpa| hpa.targets_deployment(&deployment.namespace, &deployment.name));
        if let Some(hpa) = conflict {
            return Err(WebhookError::validation(format!(
                "Deployment {ns}/{name} cannot run 1 replica because HorizontalPodAutoscaler {ns}/{hpa} \
                 targets it and requires at least 2 replicas. Set spec.replicas to 2 or more, or \
                 delete the HorizontalPodAutoscaler first.",
                ns = deployment.namespace,
                name = deployment.name,
                hpa = hpa.name,
            ))
            .with_code("DEPLOYMENT_SINGLE_REPLICA_WITH_HPA")
            .with_details(format!(
                "HorizontalPodAutoscaler {} has scaleTargetRef Deployment/{}",
                hpa.name, deployment.name
            ))
            .with_suggestion(format!(
                "Set spec.replicas of Deployment {} to 2 or more",
                deployment.name
            ))
            .with_suggestion(format!(
                "Delete HorizontalPodAutoscaler {} if autoscaling is not needed",
                hpa.name
            )));
        }

        debug!(hpas = hpas.len(), "No HPA targets the Deployment");
        Ok(())
    }

    /// Denies an HPA whose scale target is an existing single-replica
    /// Deployment.
    ///
    /// A missing target is allowed: the Deployment may be created later in
    /// the same apply batch.
    pub async fn validate_hpa(&self, hpa: &HorizontalPodAutoscaler) -> Result<(), WebhookError> {
        let target = &hpa.scale_target_ref;
        if !target.is_deployment() {
            trace!(kind = %target.kind, "Scale target is not a Deployment");
            return Ok(());
        }

        let deployment = match self.cluster.get_deployment(&hpa.namespace, &target.name).await? {
            Some(deployment) => deployment,
            None => {
                debug!(deployment = %target.name, "Scale target does not exist yet");
                return Ok(());
            }
        };

        if deployment.replicas == SINGLE_REPLICA {
            return Err(WebhookError::validation(format!(
                "HorizontalPodAutoscaler {ns}/{hpa} cannot target Deployment {ns}/{name} because it \
                 runs 1 replica and HPAs require at least 2 replicas. Scale the Deployment to 2 or \
                 more replicas, or do not create the HorizontalPodAutoscaler.",
                ns = hpa.namespace,
                hpa = hpa.name,
                name = deployment.name,
            ))
            .with_code("HPA_TARGETS_SINGLE_REPLICA_DEPLOYMENT")
            .with_details(format!(
                "Deployment {} has spec.replicas=1",
                deployment.name
            ))
            .with_suggestion(format!(
                "Set spec.replicas of Deployment {} to 2 or more before creating the HPA",
                deployment.name
            ))
            .with_suggestion(format!(
                "Remove HorizontalPodAutoscaler {} from the manifests",
                hpa.name
            )));
        }

        Ok(())
    }
}
