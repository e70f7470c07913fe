#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use exposure_controller_runtime::{
    core, k8s, reconcile, Args, Controller, ControllerMetrics, GlobalConfig, Index,
    KubeMaintenance, KubeReadiness, SharedIndex, Update,
};
