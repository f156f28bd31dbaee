#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use hpa_guard_core as core;
pub use hpa_guard_k8s_api as k8s;

mod admission;
mod args;
pub mod certs;
mod duration;
mod error_handler;
pub mod health;
mod metrics;
pub mod server;

pub use self::{
    admission::{Admission, Body, Error},
    args::Args,
    certs::{CertResolver, CertificateInfo, CertificateManager, CertificatePaths},
    duration::GoDuration,
    error_handler::ErrorHandler,
    metrics::{AdmissionMetrics, CertificateMetrics, ErrorMetrics, Metrics},
};

pub type AdmissionRequest = kube::core::admission::AdmissionRequest<kube::core::DynamicObject>;
pub type AdmissionResponse = kube::core::admission::AdmissionResponse;
pub type AdmissionReview = kube::core::admission::AdmissionReview<kube::core::DynamicObject>;
