use crate::{
    backend::Backend,
    load_balancer::ExposedLoadBalancer,
    network_policy::ExposedNetworkPolicy,
    shared,
    store::ObjectStore,
    Error, Result, Settings, Stores,
};
use exposure_controller_core::{Contributor, ExposedPorts, EXPOSED_PORTS_ANNOTATION};
use exposure_controller_k8s_api::{NetworkPolicy, ResourceExt, Service};
use std::sync::Arc;

/// Publishes the `ces-exposed-ports` of services through the shared
/// NetworkPolicy, the shared LoadBalancer Service and the backend's
/// forwarding.
pub struct Exposure {
    settings: Arc<Settings>,
    backend: Arc<dyn Backend>,
    network_policy: ExposedNetworkPolicy,
    load_balancer: ExposedLoadBalancer,
    network_policies: Arc<dyn ObjectStore<NetworkPolicy>>,
    services: Arc<dyn ObjectStore<Service>>,
}

/// Reads a service's exposed ports. Every exposed port must be one of the
/// service's own ports.
pub fn exposed_ports(service: &Service) -> Result<ExposedPorts> {
    let Some(json) = service.annotations().get(EXPOSED_PORTS_ANNOTATION) else {
        return Ok(ExposedPorts::default());
    };
    let ports = ExposedPorts::parse(EXPOSED_PORTS_ANNOTATION, json)?;
    let declared = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect::<Vec<_>>())
        .unwrap_or_default();
    if let Some(undeclared) = ports.iter().find(|p| !declared.contains(&p.port)) {
        return Err(Error::UndeclaredPort {
            service: service.name_any(),
            port: undeclared.port,
        });
    }
    Ok(ports)
}

impl Exposure {
    pub fn new(settings: Arc<Settings>, backend: Arc<dyn Backend>, stores: &Stores) -> Self {
        let name = backend.exposed_name();
        let selector = backend.selector().clone();
        Self {
            network_policy: ExposedNetworkPolicy::new(
                &name,
                &settings.namespace,
                selector.clone(),
                settings.ownership.clone(),
            ),
            load_balancer: ExposedLoadBalancer::new(&name, &settings.namespace, selector),
            network_policies: stores.network_policies.clone(),
            services: stores.services.clone(),
            backend,
            settings,
        }
    }

    /// Brings the shared resources in line with the service's exposed
    /// ports.
    pub async fn upsert(&self, service: &Service) -> Result<()> {
        let ports = exposed_ports(service)?;
        let contributor = Contributor::new(
            service.namespace().unwrap_or_else(|| self.settings.namespace.clone()),
            service.name_any(),
        );
        tracing::debug!(%contributor, ports = ports.len(), "Exposing ports");
        self.converge(&contributor, &ports).await
    }

    /// Removes everything the named service contributed to the shared
    /// resources.
    pub async fn remove(&self, namespace: &str, name: &str) -> Result<()> {
        let contributor = Contributor::new(namespace, name);
        tracing::debug!(%contributor, "Removing exposed ports");
        self.converge(&contributor, &ExposedPorts::default()).await
    }

    async fn converge(&self, contributor: &Contributor, ports: &ExposedPorts) -> Result<()> {
        let retry = self.settings.retry;
        shared::converge(
            &self.network_policy,
            &*self.network_policies,
            retry,
            contributor,
            ports,
        )
        .await?;
        shared::converge(&self.load_balancer, &*self.services, retry, contributor, ports).await?;
        self.backend.materialize_ports(contributor, ports).await
    }
}
