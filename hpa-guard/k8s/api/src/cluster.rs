use crate::{Api, Client, Deployment, HorizontalPodAutoscaler, ListParams};
use hpa_guard_core::{self as core, ClusterState, WebhookError};
use tracing::trace;

/// Reads cluster state directly from the Kubernetes API.
///
/// Each call issues its own request; nothing is watched or cached.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ClusterState for KubeCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<core::Deployment>, WebhookError> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        let deployment = api.get_opt(name).await.map_err(|error| {
            classify(error).with_details(format!("reading Deployment {namespace}/{name}"))
        })?;
        trace!(found = deployment.is_some(), %namespace, %name, "Read Deployment");
        Ok(deployment.map(Into::into))
    }

    async fn list_hpas(
        &self,
        namespace: &str,
    ) -> Result<Vec<core::HorizontalPodAutoscaler>, WebhookError> {
        let api = Api::<HorizontalPodAutoscaler>::namespaced(self.client.clone(), namespace);
        let hpas = api.list(&ListParams::default()).await.map_err(|error| {
            classify(error)
                .with_details(format!("listing HorizontalPodAutoscalers in {namespace}"))
        })?;
        trace!(count = hpas.items.len(), %namespace, "Listed HorizontalPodAutoscalers");
        Ok(hpas.items.into_iter().map(Into::into).collect())
    }

    async fn check_connectivity(&self) -> Result<(), WebhookError> {
        let info = self.client.apiserver_version().await.map_err(classify)?;
        trace!(version = %info.git_version, "Kubernetes API reachable");
        Ok(())
    }
}

/// Classifies a Kubernetes client failure.
pub fn classify(error: kube::Error) -> WebhookError {
    match error {
        kube::Error::Api(ref rsp) => {
            let message = format!("Kubernetes API returned {}: {}", rsp.code, rsp.message);
            let err = match rsp.code {
                401 | 403 => WebhookError::auth(message).with_suggestion(
                    "Check the webhook's RBAC permissions for deployments and horizontalpodautoscalers",
                ),
                429 => WebhookError::resource(message).with_code("KUBERNETES_API_THROTTLED"),
                408 | 409 | 500..=599 => WebhookError::kubernetes_api(message),
                _ => WebhookError::kubernetes_api(message).with_retryable(false),
            };
            err.with_source(error)
        }
        kube::Error::Auth(_) => {
            WebhookError::auth(format!("Kubernetes client authentication failed: {error}"))
                .with_source(error)
        }
        kube::Error::SerdeError(_) => {
            WebhookError::internal(format!("failed to decode Kubernetes API response: {error}"))
                .with_source(error)
        }
        kube::Error::HyperError(_)
        | kube::Error::Service(_)
        | kube::Error::HttpError(_)
        | kube::Error::TlsRequired => network(error),
        #[cfg(feature = "rustls-tls")]
        kube::Error::RustlsTls(_) => network(error),
        #[cfg(feature = "openssl-tls")]
        kube::Error::OpensslTls(_) => network(error),
        error => WebhookError::kubernetes_api(format!("Kubernetes client error: {error}"))
            .with_source(error),
    }
}

fn network(error: kube::Error) -> WebhookError {
    WebhookError::network(format!("failed to reach the Kubernetes API: {error}")).with_source(error)
}
