#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use exposure_controller_core as core;
pub use exposure_controller_k8s_api as k8s;
pub use exposure_controller_k8s_reconcile as reconcile;

mod args;
mod cluster;
mod controller;
mod global_config;
mod index;
mod ingress_class;
mod metrics;

pub use self::{
    args::Args,
    cluster::{KubeMaintenance, KubeReadiness},
    controller::Controller,
    global_config::GlobalConfig,
    index::{Index, SharedIndex, Update},
    metrics::ControllerMetrics,
};
