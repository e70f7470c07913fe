use std::collections::BTreeMap;

/// The ingress technology that materializes forwarding and rewrites.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// ingress-nginx, forwarding through `tcp-services`/`udp-services`
    /// ConfigMaps.
    #[default]
    Nginx,

    /// Traefik, forwarding through `IngressRouteTCP`/`IngressRouteUDP`
    /// resources.
    Traefik,
}

/// Describes a backend. Built once at start-up and shared by every
/// reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    name: String,
    controller: String,
    rewrite_annotation: String,
    additional_configuration_annotation: String,
    selector: BTreeMap<String, String>,
}

// === impl BackendKind ===

impl BackendKind {
    /// Parses the configured backend name. Unknown names fall back to the
    /// default backend.
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "nginx" | "nginx-ingress" => Self::Nginx,
            "traefik" => Self::Traefik,
            _ => {
                tracing::warn!(
                    backend = %value,
                    default = ?Self::default(),
                    "Unknown ingress backend, using the default"
                );
                Self::default()
            }
        }
    }

    pub fn identity(self) -> Identity {
        match self {
            Self::Nginx => Identity::new(
                "nginx-ingress",
                "k8s.io/nginx-ingress",
                "nginx.ingress.kubernetes.io/rewrite-target",
                "nginx.ingress.kubernetes.io/configuration-snippet",
                Some(("dogu.name", "nginx-ingress")),
            ),
            Self::Traefik => Identity::new(
                "traefik",
                "traefik.io/ingress-controller",
                "traefik.ingress.kubernetes.io/router.middlewares",
                "traefik.ingress.kubernetes.io/router.middlewares",
                Some(("app.kubernetes.io/name", "traefik")),
            ),
        }
    }
}

// === impl Identity ===

impl Identity {
    pub fn new<K: ToString, V: ToString>(
        name: impl ToString,
        controller: impl ToString,
        rewrite_annotation: impl ToString,
        additional_configuration_annotation: impl ToString,
        selector: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            controller: controller.to_string(),
            rewrite_annotation: rewrite_annotation.to_string(),
            additional_configuration_annotation: additional_configuration_annotation.to_string(),
            selector: selector
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `spec.controller` of the backend's IngressClass.
    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn rewrite_annotation_key(&self) -> &str {
        &self.rewrite_annotation
    }

    pub fn additional_configuration_key(&self) -> &str {
        &self.additional_configuration_annotation
    }

    /// Labels of the backend's own pods.
    pub fn selector(&self) -> &BTreeMap<String, String> {
        &self.selector
    }

    /// The selector in `k=v,k=v` form, as accepted by list calls.
    pub fn selector_string(&self) -> String {
        self.selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The name shared by the resources every contributor merges into.
    pub fn exposed_name(&self) -> String {
        format!("{}-exposed", self.name)
    }
}
