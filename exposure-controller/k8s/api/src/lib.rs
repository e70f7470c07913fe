#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod traefik;

pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        core::v1::{ConfigMap, Service, ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressClass,
            IngressClassSpec, IngressRule, IngressServiceBackend, IngressSpec, IngressTLS,
            NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec,
            ServiceBackendPort,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, ResourceExt},
    core::ErrorResponse,
    Client, Error, Resource,
};

/// Label that ties generated objects to the Service they were generated for.
pub const EXPOSED_SERVICE_LABEL: &str = "k8s.cloudogu.com/exposed-service";

/// Label that ties per-path ingresses to the Service that declared them.
pub const CES_SERVICE_OWNER_LABEL: &str = "k8s.cloudogu.com/ces-service-owner";

/// Tests whether an API error reports that the object does not exist.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(rsp) if rsp.code == 404)
}

/// Tests whether an API error reports a stale resourceVersion or an object
/// that already exists.
pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(rsp) if rsp.code == 409)
}
