//! Ingress backends: how ports are forwarded and how routes are annotated.

mod nginx;
mod traefik;

pub use self::{nginx::Nginx, traefik::Traefik};

use crate::{Result, Settings, Stores};
use async_trait::async_trait;
use exposure_controller_core::{
    AlternativeFqdn, BackendKind, Contributor, ExposedPorts, Identity, ServiceRewrite,
};
use exposure_controller_k8s_api::Service;
use std::{collections::BTreeMap, sync::Arc};

/// Backend-neutral configuration of one HTTP route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    /// Replaces the request path before it is passed on.
    pub rewrite_target: Option<String>,

    /// Asks upstreams for uncompressed responses.
    pub identity_encoding: bool,

    pub rewrite: Option<ServiceRewrite>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn identity(&self) -> &Identity;

    fn rewrite_annotation_key(&self) -> &str {
        self.identity().rewrite_annotation_key()
    }

    fn additional_configuration_key(&self) -> &str {
        self.identity().additional_configuration_key()
    }

    fn selector(&self) -> &BTreeMap<String, String> {
        self.identity().selector()
    }

    fn exposed_name(&self) -> String {
        self.identity().exposed_name()
    }

    /// Forwards `ports` to `owner`, replacing whatever was forwarded to it
    /// before. Ports with protocols other than TCP and UDP are ignored.
    async fn materialize_ports(&self, owner: &Contributor, ports: &ExposedPorts) -> Result<()>;

    /// Stops forwarding anything to the named service.
    async fn remove_ports(&self, namespace: &str, service: &str) -> Result<()> {
        self.materialize_ports(&Contributor::new(namespace, service), &ExposedPorts::default())
            .await
    }

    /// Renders `route` into annotations for the ingress named `ingress`
    /// that routes to `owner`.
    async fn route_annotations(
        &self,
        owner: &Service,
        ingress: &str,
        route: &Route,
    ) -> Result<BTreeMap<String, String>>;

    /// Removes whatever `route_annotations` created besides the
    /// annotations for the ingress named `ingress`.
    async fn remove_route(&self, _ingress: &str) -> Result<()> {
        Ok(())
    }

    /// Redirects the alternative FQDNs to `primary`, or removes the
    /// redirect when there are no alternatives.
    async fn redirect_alternative_fqdns(
        &self,
        primary: &str,
        alternatives: &[AlternativeFqdn],
    ) -> Result<()>;
}

/// Builds the backend of the given kind.
pub fn new(kind: BackendKind, settings: Arc<Settings>, stores: &Stores) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Nginx => Arc::new(Nginx::new(settings, stores)),
        BackendKind::Traefik => Arc::new(Traefik::new(settings, stores)),
    }
}

/// Drops and logs ports that cannot be forwarded.
fn forwardable(owner: &Contributor, ports: &ExposedPorts) -> ExposedPorts {
    let (forwardable, ignored) = ports.partition_forwardable();
    for port in ignored {
        tracing::info!(
            %owner,
            port = port.port,
            protocol = %port.protocol,
            "Ignoring port with a protocol that cannot be forwarded"
        );
    }
    forwardable
}
