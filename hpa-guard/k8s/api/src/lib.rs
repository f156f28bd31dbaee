#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;

pub use self::cluster::{classify, KubeCluster};
pub use k8s_openapi::api::{
    apps::v1::Deployment,
    autoscaling::{v1 as autoscalingv1, v2::HorizontalPodAutoscaler},
};
pub use kube::{
    api::{Api, ListParams},
    Client, Resource,
};
