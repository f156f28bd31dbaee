#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod environment;
pub mod error;
pub mod validator;
pub mod workload;

pub use self::{
    environment::Environment,
    error::{ErrorKind, WebhookError},
    validator::{ClusterState, Validator},
    workload::{Deployment, HorizontalPodAutoscaler, ScaleTargetRef},
};

/// The number of replicas that makes a Deployment incompatible with an HPA.
pub const SINGLE_REPLICA: i32 = 1;
