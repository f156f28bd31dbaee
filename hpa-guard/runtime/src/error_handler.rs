use crate::{metrics::ErrorMetrics, AdmissionRequest, AdmissionResponse};
use hpa_guard_core::{Environment, ErrorKind, WebhookError};
use kube::core::admission::Operation;
use std::fmt::Write;
use tracing::{error, info, warn};

/// Turns the outcome of an admission decision into the response sent back to
/// the API server.
///
/// Every failure is logged, counted, checked for retry eligibility and
/// rendered with the amount of detail appropriate for the environment.
#[derive(Clone, Debug)]
pub struct ErrorHandler {
    environment: Environment,
    metrics: ErrorMetrics,
}

const RETRYABLE_REASON: &str = "Retryable";

impl ErrorHandler {
    pub fn new(environment: Environment, metrics: ErrorMetrics) -> Self {
        Self {
            environment,
            metrics,
        }
    }

    pub fn handle<E>(
        &self,
        req: &AdmissionRequest,
        request_id: &str,
        result: Result<(), E>,
    ) -> AdmissionResponse
    where
        E: Into<WebhookError>,
    {
        let rsp = AdmissionResponse::from(req);
        let mut err = match result {
            Ok(()) => return rsp,
            Err(err) => err.into(),
        };

        err.enrich(
            request_id,
            &req.kind.kind,
            &req.name,
            req.namespace.as_deref(),
        );
        let retryable = self.is_retryable(&err);
        self.log(&err, retryable, operation(&req.operation));
        self.metrics.inc(err.kind, retryable);

        let mut rsp = rsp.deny(self.render_message(&err));
        rsp.result.code = err.kind.status_code();
        rsp.result.reason = if retryable {
            RETRYABLE_REASON.to_string()
        } else {
            format!("{:?}", err.kind)
        };
        rsp
    }

    /// Whether the API server may resend the request expecting a different
    /// outcome.
    ///
    /// Production only advertises transient connectivity failures as
    /// retryable.
    pub fn is_retryable(&self, err: &WebhookError) -> bool {
        if self.environment.is_production() {
            return err.retryable
                && matches!(err.kind, ErrorKind::Network | ErrorKind::KubernetesApi);
        }
        err.retryable
    }

    /// Renders the message shown to the user who submitted the object.
    pub fn render_message(&self, err: &WebhookError) -> String {
        if self.environment.is_production() {
            if matches!(err.kind, ErrorKind::Internal | ErrorKind::Configuration) {
                return format!(
                    "The admission webhook failed to process this request (request ID: {}). \
                     Retry later or contact your cluster administrator.",
                    err.request_id.as_deref().unwrap_or("unknown"),
                );
            }
            return err.message.clone();
        }

        let mut message = err.message.clone();
        if let Some(details) = &err.details {
            let _ = write!(message, "\nDetails: {details}");
        }
        if !err.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for (i, suggestion) in err.suggestions.iter().enumerate() {
                let _ = write!(message, "\n  {}. {suggestion}", i + 1);
            }
        }
        message
    }

    fn log(&self, err: &WebhookError, retryable: bool, operation: &'static str) {
        let request_id = err.request_id.as_deref().unwrap_or_default();
        let resource = err.resource_type.as_deref().unwrap_or_default();
        let name = err.resource_name.as_deref().unwrap_or_default();
        let ns = err.namespace.as_deref().unwrap_or_default();
        let code = &*err.code;
        let source = err.source.as_ref().map(|s| s.to_string());
        match err.kind {
            ErrorKind::Validation => info!(
                %request_id, %resource, %ns, %name, %operation, %code,
                error = %err.message,
                "Denied"
            ),
            ErrorKind::Configuration | ErrorKind::Certificate | ErrorKind::Internal => error!(
                %request_id, %resource, %ns, %name, %operation, %code, retryable,
                kind = %err.kind,
                error = %err.message,
                ?source,
                "Admission failed"
            ),
            ErrorKind::Network
            | ErrorKind::KubernetesApi
            | ErrorKind::Auth
            | ErrorKind::Resource => warn!(
                %request_id, %resource, %ns, %name, %operation, %code, retryable,
                kind = %err.kind,
                error = %err.message,
                ?source,
                "Admission failed"
            ),
        }
    }
}

pub(crate) fn operation(op: &Operation) -> &'static str {
    match op {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}
