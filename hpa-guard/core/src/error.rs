use std::{borrow::Cow, fmt};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed set of failure classes the webhook distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A user-correctable admission conflict.
    Validation,
    /// The webhook itself is misconfigured.
    Configuration,
    /// Transient connectivity failure.
    Network,
    /// Transient or unexpected failure reported by the Kubernetes API server.
    KubernetesApi,
    /// A problem with the webhook's TLS material.
    Certificate,
    /// The webhook is not authorized to read from the Kubernetes API.
    Auth,
    /// Local resource exhaustion or API throttling.
    Resource,
    /// Anything unexpected or unclassified.
    Internal,
}

/// A classified webhook failure.
///
/// Errors are created where a failure happens, enriched with request context
/// as they move through the admission server, and rendered exactly once into
/// an admission response.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WebhookError {
    pub kind: ErrorKind,
    pub code: Cow<'static, str>,
    pub message: String,
    pub details: Option<String>,
    pub suggestions: Vec<String>,
    pub retryable: bool,
    pub request_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_name: Option<String>,
    pub namespace: Option<String>,
    #[source]
    pub source: Option<BoxError>,
}

// === impl ErrorKind ===

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Network => "network",
            Self::KubernetesApi => "kubernetes_api",
            Self::Certificate => "certificate",
            Self::Auth => "auth",
            Self::Resource => "resource",
            Self::Internal => "internal",
        }
    }

    /// The HTTP-style status code reported in a denied admission response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 403,
            Self::Resource => 429,
            Self::Network | Self::KubernetesApi => 503,
            Self::Configuration | Self::Certificate | Self::Internal => 500,
        }
    }

    fn default_code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_FAILED",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::KubernetesApi => "KUBERNETES_API_ERROR",
            Self::Certificate => "CERTIFICATE_ERROR",
            Self::Auth => "AUTHORIZATION_ERROR",
            Self::Resource => "RESOURCE_EXHAUSTED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Transient failure classes are retryable unless stated otherwise.
    fn retryable_by_default(&self) -> bool {
        matches!(self, Self::Network | Self::KubernetesApi | Self::Resource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl WebhookError ===

impl WebhookError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: Cow::Borrowed(kind.default_code()),
            message: message.into(),
            details: None,
            suggestions: Vec::new(),
            retryable: kind.retryable_by_default(),
            request_id: None,
            resource_type: None,
            resource_name: None,
            namespace: None,
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn kubernetes_api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KubernetesApi, message)
    }

    pub fn certificate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Certificate, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<Cow<'static, str>>) -> Self {
        self.code = code.into();
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Fills in request context that was not already set where the error was
    /// created.
    pub fn enrich(
        &mut self,
        request_id: &str,
        resource_type: &str,
        resource_name: &str,
        namespace: Option<&str>,
    ) {
        fn fill(slot: &mut Option<String>, value: &str) {
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }

        fill(&mut self.request_id, request_id);
        fill(&mut self.resource_type, resource_type);
        fill(&mut self.resource_name, resource_name);
        if let Some(ns) = namespace {
            fill(&mut self.namespace, ns);
        }
    }
}

impl From<anyhow::Error> for WebhookError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string()).with_source(error)
    }
}
