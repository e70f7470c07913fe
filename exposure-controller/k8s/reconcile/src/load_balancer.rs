//! The LoadBalancer Service that publishes every exposed port.
//!
//! Ports are owned through their names: `<service>-<port>` for TCP and
//! `<service>-<port>-udp` for UDP.

use crate::{shared::SharedResource, Result};
use ahash::AHashSet as HashSet;
use exposure_controller_core::{
    merge, Change, Contributor, Entry, ExposedPort, ExposedPorts, PortId, Protocol,
};
use exposure_controller_k8s_api::{IntOrString, ObjectMeta, Service, ServicePort, ServiceSpec};
use std::collections::BTreeMap;

pub(crate) struct ExposedLoadBalancer {
    name: String,
    namespace: String,
    selector: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
struct LoadBalancerPort(ServicePort);

/// Names a contributor's port on the load balancer.
pub(crate) fn port_name(service: &str, port: &ExposedPort) -> String {
    match port.protocol {
        Protocol::Udp => format!("{}-{}-udp", service, port.port),
        _ => format!("{}-{}", service, port.port),
    }
}

/// Tests whether a load balancer port name was derived from `service`.
fn is_owned_by(name: &str, service: &str) -> bool {
    name.strip_prefix(service)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|rest| rest.strip_suffix("-udp").unwrap_or(rest))
        .map_or(false, |port| port.parse::<u16>().is_ok())
}

impl ExposedLoadBalancer {
    pub(crate) fn new(
        name: impl ToString,
        namespace: impl ToString,
        selector: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            selector,
        }
    }

    fn service(&self, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(self.selector.clone()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl SharedResource for ExposedLoadBalancer {
    type Object = Service;

    fn name(&self) -> &str {
        &self.name
    }

    fn plan(
        &self,
        current: Option<&Service>,
        contributor: &Contributor,
        desired: &ExposedPorts,
    ) -> Result<Change<Service>> {
        let (desired, _) = desired.partition_forwardable();
        let entries = current
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default()
            .into_iter()
            .map(LoadBalancerPort)
            .collect::<Vec<_>>();

        let owns = |p: &LoadBalancerPort| {
            p.0.name
                .as_deref()
                .map_or(false, |name| is_owned_by(name, &contributor.name))
        };
        let prior = entries.iter().filter(|p| owns(p)).cloned().collect::<Vec<_>>();
        let claimed = entries
            .iter()
            .filter(|p| !owns(p))
            .map(Entry::id)
            .collect::<HashSet<_>>();
        let wanted = desired
            .iter()
            .map(|p| {
                let mut port = ServicePort {
                    name: Some(port_name(&contributor.name, p)),
                    protocol: Some(p.protocol.to_string()),
                    port: p.port,
                    target_port: Some(IntOrString::Int(p.port)),
                    ..Default::default()
                };
                // Keep what the API server allocated for an existing port.
                if let Some(LoadBalancerPort(existing)) =
                    prior.iter().find(|e| e.0.name == port.name && e.id() == p.id())
                {
                    port.node_port = existing.node_port;
                    port.app_protocol = existing.app_protocol.clone();
                }
                LoadBalancerPort(port)
            })
            .collect::<Vec<_>>();

        let merged = merge(&entries, &prior, &wanted, &claimed);
        for LoadBalancerPort(port) in &merged.collisions {
            tracing::warn!(port = port.port, %contributor, "Port is already published for another service");
        }

        let ports = merged
            .entries
            .into_iter()
            .map(|LoadBalancerPort(p)| p)
            .collect::<Vec<_>>();
        let next = match current {
            _ if ports.is_empty() => None,
            None => Some(self.service(ports)),
            Some(current) => {
                let mut next = current.clone();
                next.spec.get_or_insert_with(Default::default).ports = Some(ports);
                Some(next)
            }
        };
        Ok(Change::between(current, next))
    }
}

impl Entry for LoadBalancerPort {
    type Id = PortId;

    fn id(&self) -> PortId {
        PortId {
            protocol: Protocol::from(self.0.protocol.as_deref().unwrap_or("TCP")),
            port: self.0.port,
        }
    }
}
