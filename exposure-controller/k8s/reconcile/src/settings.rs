use exposure_controller_core::{OwnershipAnnotations, RetryPolicy};

/// Names and paths shared by every reconciliation.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace of the contributors and of the shared resources.
    pub namespace: String,
    pub ingress_class: String,
    pub static_content: StaticContent,
    pub ownership: OwnershipAnnotations,
    pub retry: RetryPolicy,

    pub tcp_services: String,
    pub udp_services: String,

    /// Name of the objects that redirect alternative FQDNs.
    pub fqdn_redirect: String,
}

/// The backend serving maintenance and starting pages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticContent {
    pub service: String,
    pub port: i32,
    pub maintenance_path: String,
    pub starting_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "ecosystem".to_string(),
            ingress_class: "k8s-ecosystem-ces-service".to_string(),
            static_content: StaticContent::default(),
            ownership: OwnershipAnnotations::default(),
            retry: RetryPolicy::default(),
            tcp_services: "tcp-services".to_string(),
            udp_services: "udp-services".to_string(),
            fqdn_redirect: "ces-alternative-fqdn-redirect".to_string(),
        }
    }
}

impl Default for StaticContent {
    fn default() -> Self {
        Self {
            service: "nginx-static".to_string(),
            port: 80,
            maintenance_path: "/errors/503.html".to_string(),
            starting_path: "/errors/starting.html".to_string(),
        }
    }
}
