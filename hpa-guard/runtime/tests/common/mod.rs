#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hpa_guard_runtime::{
    core::{
        ClusterState, Deployment, Environment, HorizontalPodAutoscaler, ScaleTargetRef,
        Validator, WebhookError,
    },
    Admission, CertificateManager, CertificatePaths, ErrorHandler, Metrics,
};
use hyper::{http, Request, StatusCode};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use tower::{Service, ServiceExt};

pub type Svc = Admission<FakeCluster>;

/// In-memory cluster state with failure injection.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<(String, String), Deployment>,
    hpas: Vec<HorizontalPodAutoscaler>,
    unreachable: bool,
    delay: Option<Duration>,
    panic: bool,
}

pub struct Webhook {
    pub svc: Svc,
    pub cluster: FakeCluster,
    pub certs: Arc<CertificateManager>,
    pub paths: CertificatePaths,
    _dir: tempfile::TempDir,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: serde_json::Value,
}

// === impl FakeCluster ===

impl FakeCluster {
    pub fn with_deployment(self, ns: &str, name: &str, replicas: i32) -> Self {
        self.state.lock().deployments.insert(
            (ns.to_string(), name.to_string()),
            Deployment::new(ns, name, replicas),
        );
        self
    }

    pub fn with_hpa(self, ns: &str, name: &str, deployment: &str) -> Self {
        self.state.lock().hpas.push(HorizontalPodAutoscaler::new(
            ns,
            name,
            ScaleTargetRef::deployment(deployment),
        ));
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn set_panic(&self) {
        self.state.lock().panic = true;
    }

    async fn read(&self) -> Result<(), WebhookError> {
        let (unreachable, delay, panic) = {
            let state = self.state.lock();
            (state.unreachable, state.delay, state.panic)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panic {
            panic!("injected panic");
        }
        if unreachable {
            return Err(WebhookError::kubernetes_api("connection refused"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterState for FakeCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, WebhookError> {
        self.read().await?;
        let state = self.state.lock();
        Ok(state
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_hpas(
        &self,
        namespace: &str,
    ) -> Result<Vec<HorizontalPodAutoscaler>, WebhookError> {
        self.read().await?;
        let state = self.state.lock();
        Ok(state
            .hpas
            .iter()
            .filter(|hpa| hpa.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn check_connectivity(&self) -> Result<(), WebhookError> {
        if self.state.lock().unreachable {
            return Err(WebhookError::network("connection refused"));
        }
        Ok(())
    }
}

// === impl Webhook ===

impl Webhook {
    pub async fn new(cluster: FakeCluster, environment: Environment) -> Self {
        Self::with_timeout(cluster, environment, Duration::from_secs(10)).await
    }

    pub async fn with_timeout(
        cluster: FakeCluster,
        environment: Environment,
        request_timeout: Duration,
    ) -> Self {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let paths = write_certificate(dir.path(), "hpa-guard.hpa-guard.svc");

        let mut prom = Registry::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("hpa_guard"));
        let certs = CertificateManager::load(paths.clone(), metrics.certificates.clone())
            .await
            .map(Arc::new)
            .expect("certificate must load");
        let svc = Admission::new(
            Validator::new(cluster.clone()),
            ErrorHandler::new(environment, metrics.errors.clone()),
            certs.clone(),
            metrics.admission.clone(),
            Arc::new(prom),
            request_timeout,
        );
        Self {
            svc,
            cluster,
            certs,
            paths,
            _dir: dir,
        }
    }

    pub async fn call(&self, req: Request<Full<Bytes>>) -> Reply {
        let mut svc = self.svc.clone();
        let rsp = ServiceExt::<Request<Full<Bytes>>>::ready(&mut svc)
            .await
            .expect("service must be ready")
            .call(req)
            .await
            .expect("request must succeed");
        let status = rsp.status();
        let headers = rsp.headers().clone();
        let bytes = rsp
            .into_body()
            .collect()
            .await
            .expect("body must be read")
            .to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, path: &str) -> Reply {
        let req = Request::get(path)
            .body(Full::default())
            .expect("request must be valid");
        self.call(req).await
    }

    /// Sends a review and returns its `response` object.
    pub async fn review(&self, review: serde_json::Value) -> serde_json::Value {
        let reply = self.call(post_review(review)).await;
        assert_eq!(reply.status, StatusCode::OK);
        reply.body["response"].clone()
    }

    pub async fn allows(&self, review: serde_json::Value) -> serde_json::Value {
        let rsp = self.review(review).await;
        assert_eq!(rsp["allowed"], true, "expected admission: {rsp}");
        rsp
    }

    pub async fn denies(&self, review: serde_json::Value) -> serde_json::Value {
        let rsp = self.review(review).await;
        assert_eq!(rsp["allowed"], false, "expected denial: {rsp}");
        rsp
    }
}

pub fn post_review(review: serde_json::Value) -> Request<Full<Bytes>> {
    Request::post("/validate")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(review.to_string())))
        .expect("request must be valid")
}

/// Writes a fresh self-signed certificate and key for `name` into `dir`.
pub fn write_certificate(dir: &Path, name: &str) -> CertificatePaths {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .expect("certificate must generate");
    let paths = CertificatePaths {
        cert: dir.join("tls.crt"),
        key: dir.join("tls.key"),
        ca: None,
    };
    std::fs::write(&paths.cert, cert.pem()).expect("must write certificate");
    std::fs::write(&paths.key, key_pair.serialize_pem()).expect("must write key");
    paths
}

pub const UID: &str = "705ab4f5-6393-11e8-b7cc-42010a800002";

pub fn review(
    group: &str,
    version: &str,
    kind: &str,
    resource: &str,
    operation: &str,
    object: serde_json::Value,
) -> serde_json::Value {
    let metadata = &object["metadata"];
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": UID,
            "kind": { "group": group, "version": version, "kind": kind },
            "resource": { "group": group, "version": version, "resource": resource },
            "name": metadata["name"],
            "namespace": metadata["namespace"],
            "operation": operation,
            "userInfo": { "username": "kubernetes-admin" },
            "object": object,
            "dryRun": false,
        },
    })
}

pub fn deployment(operation: &str, ns: &str, name: &str, replicas: i32) -> serde_json::Value {
    review(
        "apps",
        "v1",
        "Deployment",
        "deployments",
        operation,
        serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": ns },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "app": name } },
                "template": { "metadata": { "labels": { "app": name } } },
            },
        }),
    )
}

pub fn hpa(operation: &str, ns: &str, name: &str, target: &str) -> serde_json::Value {
    hpa_targeting(operation, ns, name, "Deployment", target)
}

pub fn hpa_targeting(
    operation: &str,
    ns: &str,
    name: &str,
    target_kind: &str,
    target: &str,
) -> serde_json::Value {
    review(
        "autoscaling",
        "v2",
        "HorizontalPodAutoscaler",
        "horizontalpodautoscalers",
        operation,
        serde_json::json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": { "name": name, "namespace": ns },
            "spec": {
                "scaleTargetRef": { "apiVersion": "apps/v1", "kind": target_kind, "name": target },
                "minReplicas": 2,
                "maxReplicas": 10,
            },
        }),
    )
}

pub fn hpa_v1(operation: &str, ns: &str, name: &str, target: &str) -> serde_json::Value {
    review(
        "autoscaling",
        "v1",
        "HorizontalPodAutoscaler",
        "horizontalpodautoscalers",
        operation,
        serde_json::json!({
            "apiVersion": "autoscaling/v1",
            "kind": "HorizontalPodAutoscaler",
            "metadata": { "name": name, "namespace": ns },
            "spec": {
                "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": target },
                "minReplicas": 2,
                "maxReplicas": 10,
                "targetCPUUtilizationPercentage": 80,
            },
        }),
    )
}
