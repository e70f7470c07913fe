#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod exposure;
pub mod merge;
pub mod ownership;
pub mod retry;

pub use self::{
    backend::{BackendKind, Identity},
    exposure::{
        AlternativeFqdn, CesService, Contributor, ExposedPort, ExposedPorts, ParseError, PortId,
        Protocol, ServiceRewrite,
    },
    merge::{merge, Change, Entry, Merged},
    ownership::OwnershipAnnotations,
    retry::RetryPolicy,
};

/// Service annotation listing the ports a contributor wants exposed.
pub const EXPOSED_PORTS_ANNOTATION: &str = "ces-exposed-ports";

/// Service annotation listing the HTTP paths a contributor serves.
pub const CES_SERVICES_ANNOTATION: &str = "ces-services";

/// Service annotation whose JSON object is merged into generated ingresses.
pub const ADDITIONAL_INGRESS_ANNOTATIONS: &str = "additional-ingress-annotations";
