use crate::{
    certs::CertificateManager, error_handler, health, metrics::AdmissionMetrics,
    AdmissionRequest, AdmissionResponse, AdmissionReview, ErrorHandler,
};
use futures::{future, FutureExt};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hpa_guard_core::{ClusterState, Validator, WebhookError};
use hpa_guard_k8s_api::{autoscalingv1, Deployment, HorizontalPodAutoscaler, Resource};
use hyper::{
    header::{self, HeaderMap, HeaderValue},
    http, Request, Response,
};
use kube::core::admission::Operation;
use prometheus_client::registry::Registry;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info_span, trace, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Body = http_body_util::Full<bytes::Bytes>;

/// The webhook's HTTP service: admission reviews, health probes and metrics.
pub struct Admission<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    validator: Validator<C>,
    errors: ErrorHandler,
    certs: Arc<CertificateManager>,
    metrics: AdmissionMetrics,
    registry: Arc<Registry>,
    request_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

const REQUEST_ID: &str = "x-request-id";

/// The API server itself rejects objects larger than this.
const MAX_REVIEW_BYTES: usize = 3 * 1024 * 1024;

// === impl Admission ===

impl<C> Admission<C> {
    pub fn new(
        validator: Validator<C>,
        errors: ErrorHandler,
        certs: Arc<CertificateManager>,
        metrics: AdmissionMetrics,
        registry: Arc<Registry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                validator,
                errors,
                certs,
                metrics,
                registry,
                request_timeout,
            }),
        }
    }
}

impl<C> Clone for Admission<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, B> tower::Service<Request<B>> for Admission<C>
where
    C: ClusterState + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "request",
            %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        let inner = self.inner.clone();
        Box::pin(
            async move {
                trace!(headers = ?req.headers());
                let mut rsp = inner.route(req, &request_id).await?;
                security_headers(rsp.headers_mut(), &request_id);
                Ok(rsp)
            }
            .instrument(span),
        )
    }
}

// === impl Inner ===

impl<C: ClusterState> Inner<C> {
    async fn route<B>(&self, req: Request<B>, request_id: &str) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        match (req.method(), req.uri().path()) {
            (&http::Method::POST, "/validate") => self.review(req, request_id).await,
            (_, "/validate") => Ok(Response::builder()
                .status(http::StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, "POST")
                .body(Body::default())
                .expect("method not allowed response must be valid")),
            (&http::Method::GET, "/health" | "/healthz") => {
                let report = health::health(&self.validator, &self.certs).await;
                json_response(health_status(report.is_healthy()), &report)
            }
            (&http::Method::GET, "/readyz") => {
                let report = health::readiness(&self.validator, &self.certs).await;
                json_response(health_status(report.is_healthy()), &report)
            }
            (&http::Method::GET, "/livez") => json_response(
                http::StatusCode::OK,
                &serde_json::json!({ "status": "alive" }),
            ),
            (&http::Method::GET, "/metrics") => Ok(self.metrics_response()),
            _ => Ok(Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not found response must be valid")),
        }
    }

    async fn review<B>(&self, req: Request<B>, request_id: &str) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        use bytes::Buf;
        let bytes = match Limited::new(req.into_body(), MAX_REVIEW_BYTES).collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) if error.is::<LengthLimitError>() => {
                warn!(limit = MAX_REVIEW_BYTES, "Admission review body too large");
                return Ok(Response::builder()
                    .status(http::StatusCode::PAYLOAD_TOO_LARGE)
                    .body(Body::default())
                    .expect("payload too large response must be valid"));
            }
            Err(error) => return Err(Error::Request(error)),
        };
        let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return json_response(
                    http::StatusCode::OK,
                    &AdmissionResponse::invalid(error).into_review(),
                );
            }
        };
        trace!(?review);

        let rsp = match review.try_into() {
            Ok(req) => self.admit(req, request_id).await,
            Err(error) => {
                warn!(%error, "Invalid admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        json_response(http::StatusCode::OK, &rsp.into_review())
    }

    async fn admit(&self, req: AdmissionRequest, request_id: &str) -> AdmissionResponse {
        let start = Instant::now();
        let operation = error_handler::operation(&req.operation);
        debug!(
            uid = %req.uid,
            kind = %req.kind.kind,
            ns = req.namespace.as_deref().unwrap_or_default(),
            name = %req.name,
            %operation,
            dry_run = req.dry_run,
            "Reviewing"
        );

        let result = match req.operation {
            Operation::Delete | Operation::Connect => Ok(()),
            Operation::Create | Operation::Update => self.validate(&req).await,
        };
        let rsp = self.errors.handle(&req, request_id, result);
        self.metrics
            .observe(&req.kind.kind, operation, rsp.allowed, start.elapsed());
        rsp
    }

    /// Runs validation under the request timeout. A panic is reported as an
    /// internal error rather than tearing down the connection.
    async fn validate(&self, req: &AdmissionRequest) -> Result<(), WebhookError> {
        let validation = AssertUnwindSafe(self.dispatch(req)).catch_unwind();
        match tokio::time::timeout(self.request_timeout, validation).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(WebhookError::internal(format!(
                "validation panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(WebhookError::kubernetes_api(format!(
                "validation did not complete within {:?}",
                self.request_timeout
            ))
            .with_code("VALIDATION_TIMEOUT")
            .with_suggestion("Check the health of the Kubernetes API server")),
        }
    }

    async fn dispatch(&self, req: &AdmissionRequest) -> Result<(), WebhookError> {
        if is_kind::<Deployment>(req) {
            let deployment = parse::<Deployment>(req)?;
            return self.validator.validate_deployment(&deployment.into()).await;
        }

        if is_kind::<HorizontalPodAutoscaler>(req) {
            let hpa: hpa_guard_core::HorizontalPodAutoscaler = if req.kind.version == "v1" {
                parse::<autoscalingv1::HorizontalPodAutoscaler>(req)?.into()
            } else {
                parse::<HorizontalPodAutoscaler>(req)?.into()
            };
            return self.validator.validate_hpa(&hpa).await;
        }

        debug!(
            group = %req.kind.group,
            version = %req.kind.version,
            kind = %req.kind.kind,
            "Allowing unsupported resource type"
        );
        Ok(())
    }

    fn metrics_response(&self) -> Response<Body> {
        let mut text = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut text, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::default())
                .expect("metrics error response must be valid");
        }
        Response::builder()
            .status(http::StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(text))
            .expect("metrics response must be valid")
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn parse<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<T, WebhookError> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| WebhookError::internal("admission request is missing its object"))?;
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|error| {
            WebhookError::internal(format!("failed to decode {}: {error}", req.kind.kind))
                .with_source(error)
        })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        return msg;
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg;
    }
    "unknown panic"
}

fn health_status(healthy: bool) -> http::StatusCode {
    if healthy {
        http::StatusCode::OK
    } else {
        http::StatusCode::SERVICE_UNAVAILABLE
    }
}

fn security_headers(headers: &mut HeaderMap, request_id: &str) {
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID, value);
    }
}

fn json_response<T: Serialize>(
    status: http::StatusCode,
    body: &T,
) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}
