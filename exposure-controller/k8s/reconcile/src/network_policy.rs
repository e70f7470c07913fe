//! The NetworkPolicy that admits traffic to every exposed port.
//!
//! Only the numeric ports of the first ingress rule are merged. Ownership is
//! recorded per contributor in annotations on the policy itself.

use crate::{shared::SharedResource, Error, Result};
use ahash::AHashSet as HashSet;
use exposure_controller_core::{
    merge, Change, Contributor, Entry, ExposedPorts, OwnershipAnnotations, PortId, Protocol,
};
use exposure_controller_k8s_api::{
    IntOrString, LabelSelector, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort,
    NetworkPolicySpec, ObjectMeta,
};
use std::collections::BTreeMap;

pub(crate) struct ExposedNetworkPolicy {
    name: String,
    namespace: String,
    selector: BTreeMap<String, String>,
    ownership: OwnershipAnnotations,
}

#[derive(Clone, Debug, PartialEq)]
struct PolicyPort(NetworkPolicyPort);

impl ExposedNetworkPolicy {
    pub(crate) fn new(
        name: impl ToString,
        namespace: impl ToString,
        selector: BTreeMap<String, String>,
        ownership: OwnershipAnnotations,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            selector,
            ownership,
        }
    }

    fn empty(&self) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(self.selector.clone()),
                    ..Default::default()
                },
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![]),
                ..Default::default()
            }),
        }
    }
}

impl SharedResource for ExposedNetworkPolicy {
    type Object = NetworkPolicy;

    fn name(&self) -> &str {
        &self.name
    }

    fn plan(
        &self,
        current: Option<&NetworkPolicy>,
        contributor: &Contributor,
        desired: &ExposedPorts,
    ) -> Result<Change<NetworkPolicy>> {
        let (desired, _) = desired.partition_forwardable();
        if current.is_none() && desired.is_empty() {
            return Ok(Change::Unchanged);
        }
        let mut next = current.cloned().unwrap_or_else(|| self.empty());

        let annotations = next.metadata.annotations.clone().unwrap_or_default();
        let prior = self.ownership.read(&annotations, &contributor.name)?;
        let others = self.ownership.read_others(&annotations, &contributor.name)?;

        let spec = next.spec.get_or_insert_with(Default::default);
        let rules = spec.ingress.get_or_insert_with(Vec::new);
        let (entries, named) = rules
            .first()
            .and_then(|rule| rule.ports.clone())
            .unwrap_or_default()
            .into_iter()
            .partition::<Vec<_>, _>(|p| matches!(p.port, Some(IntOrString::Int(_))));
        let entries = entries.into_iter().map(PolicyPort).collect::<Vec<_>>();

        let prior_ids = prior.iter().map(|p| p.id()).collect::<HashSet<_>>();
        let others = others
            .iter()
            .flat_map(|ports| ports.iter().map(|p| p.id()))
            .collect::<HashSet<_>>();
        // Ports nobody has a record for were added by hand and are never
        // adopted.
        let foreign = entries
            .iter()
            .map(Entry::id)
            .filter(|id| !prior_ids.contains(id) && !others.contains(id))
            .collect::<HashSet<_>>();
        let claimed = others.union(&foreign).cloned().collect::<HashSet<_>>();
        let prior = prior.iter().map(PolicyPort::from).collect::<Vec<_>>();
        let wanted = desired.iter().map(PolicyPort::from).collect::<Vec<_>>();

        let merged = merge(&entries, &prior, &wanted, &claimed);
        for PolicyPort(port) in &merged.collisions {
            tracing::warn!(port = ?port.port, %contributor, "Port is already admitted for another service");
        }

        let mut ports = merged
            .entries
            .into_iter()
            .map(|PolicyPort(p)| p)
            .collect::<Vec<_>>();
        ports.extend(named);
        match (ports.is_empty(), rules.is_empty()) {
            (true, true) => {}
            (true, false) => {
                // Peers added by hand keep their rule.
                rules[0].ports = None;
                if rules[0].from.as_ref().map_or(true, Vec::is_empty) {
                    rules.remove(0);
                }
            }
            (false, true) => rules.push(NetworkPolicyIngressRule {
                ports: Some(ports),
                ..Default::default()
            }),
            (false, false) => rules[0].ports = Some(ports),
        }

        let owned = merged
            .owned
            .iter()
            .map(Entry::id)
            .filter(|id| !foreign.contains(id))
            .collect::<HashSet<_>>();
        let recorded = desired
            .iter()
            .filter(|p| owned.contains(&p.id()))
            .cloned()
            .collect::<ExposedPorts>();
        let mut annotations = annotations;
        self.ownership
            .write(&mut annotations, &contributor.name, &recorded)
            .map_err(|e| Error::encode(format!("ownership of {contributor}"), e))?;
        next.metadata.annotations = (!annotations.is_empty()).then_some(annotations);

        Ok(Change::between(current, Some(next)))
    }
}

// === impl PolicyPort ===

impl Entry for PolicyPort {
    type Id = PortId;

    fn id(&self) -> PortId {
        let port = match self.0.port {
            Some(IntOrString::Int(port)) => port,
            _ => 0,
        };
        PortId {
            protocol: Protocol::from(self.0.protocol.as_deref().unwrap_or("TCP")),
            port,
        }
    }
}

impl From<&exposure_controller_core::ExposedPort> for PolicyPort {
    fn from(p: &exposure_controller_core::ExposedPort) -> Self {
        Self(NetworkPolicyPort {
            port: Some(IntOrString::Int(p.port)),
            protocol: Some(p.protocol.to_string()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exposure_controller_core::ExposedPort;
    use exposure_controller_k8s_api::api::networking::v1::{IPBlock, NetworkPolicyPeer};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn policy() -> ExposedNetworkPolicy {
        ExposedNetworkPolicy::new(
            "nginx-ingress-exposed",
            "ecosystem",
            btreemap! { "dogu.name".to_string() => "nginx-ingress".to_string() },
            OwnershipAnnotations::default(),
        )
    }

    fn ports(ports: &[(&str, i32)]) -> ExposedPorts {
        ports
            .iter()
            .map(|(proto, port)| ExposedPort::new(*proto, *port, *port))
            .collect()
    }

    fn numeric_ports(np: &NetworkPolicy) -> Vec<(String, i32)> {
        np.spec
            .as_ref()
            .and_then(|s| s.ingress.as_ref())
            .and_then(|rules| rules.first())
            .and_then(|rule| rule.ports.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|p| match p.port {
                Some(IntOrString::Int(n)) => Some((p.protocol.clone().unwrap_or_default(), n)),
                _ => None,
            })
            .collect()
    }

    fn applied(change: Change<NetworkPolicy>) -> NetworkPolicy {
        match change {
            Change::Create(np) | Change::Replace(np) => np,
            change => panic!("expected a write, got {change:?}"),
        }
    }

    #[test]
    fn absent_and_empty_is_a_noop() {
        let change = policy()
            .plan(None, &Contributor::new("ecosystem", "ldap"), &ExposedPorts::default())
            .expect("must plan");
        assert!(change.is_unchanged());
    }

    #[test]
    fn creates_with_ownership_record() {
        let ldap = Contributor::new("ecosystem", "ldap");
        let np = applied(
            policy()
                .plan(None, &ldap, &ports(&[("TCP", 389), ("UDP", 3333)]))
                .expect("must plan"),
        );
        assert_eq!(
            numeric_ports(&np),
            vec![("TCP".to_string(), 389), ("UDP".to_string(), 3333)]
        );
        let spec = np.spec.as_ref().expect("spec");
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
        let annotations = np.metadata.annotations.clone().unwrap_or_default();
        assert_eq!(
            OwnershipAnnotations::default()
                .read(&annotations, "ldap")
                .expect("must parse")
                .len(),
            2
        );
    }

    #[test]
    fn removal_keeps_other_contributors_and_the_policy() {
        let np = policy();
        let ldap = Contributor::new("ecosystem", "ldap");
        let scm = Contributor::new("ecosystem", "scm");
        let after_ldap = applied(np.plan(None, &ldap, &ports(&[("TCP", 389)])).expect("plan"));
        let after_scm = applied(
            np.plan(Some(&after_ldap), &scm, &ports(&[("TCP", 2222)]))
                .expect("plan"),
        );
        let after_remove = applied(
            np.plan(Some(&after_scm), &ldap, &ExposedPorts::default())
                .expect("plan"),
        );
        assert_eq!(numeric_ports(&after_remove), vec![("TCP".to_string(), 2222)]);

        let emptied = applied(
            np.plan(Some(&after_remove), &scm, &ExposedPorts::default())
                .expect("plan"),
        );
        assert_eq!(emptied.spec.and_then(|s| s.ingress), Some(vec![]));
        assert_eq!(emptied.metadata.annotations, None);
    }

    #[test]
    fn foreign_ports_are_preserved() {
        let np = policy();
        let mut current = np.empty();
        current.spec.as_mut().expect("spec").ingress = Some(vec![NetworkPolicyIngressRule {
            ports: Some(vec![
                NetworkPolicyPort {
                    port: Some(IntOrString::Int(443)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                NetworkPolicyPort {
                    port: Some(IntOrString::String("http".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }]);

        let ldap = Contributor::new("ecosystem", "ldap");
        let next = applied(
            np.plan(Some(&current), &ldap, &ports(&[("TCP", 443), ("TCP", 389)]))
                .expect("plan"),
        );
        // 443 is foreign and identical, so it is shared rather than replaced.
        assert_eq!(
            numeric_ports(&next),
            vec![("TCP".to_string(), 443), ("TCP".to_string(), 389)]
        );
        let rule_ports = next.spec.clone().and_then(|s| s.ingress).expect("rules")[0]
            .ports
            .clone()
            .expect("ports");
        assert_eq!(rule_ports.len(), 3);

        let recorded = OwnershipAnnotations::default()
            .read(&next.metadata.annotations.clone().unwrap_or_default(), "ldap")
            .expect("must parse");
        assert_eq!(recorded.iter().map(|p| p.port).collect::<Vec<_>>(), vec![389]);

        let removed = applied(
            np.plan(Some(&next), &ldap, &ExposedPorts::default())
                .expect("plan"),
        );
        assert_eq!(numeric_ports(&removed), vec![("TCP".to_string(), 443)]);
    }

    #[test]
    fn emptied_rule_keeps_its_peers() {
        let np = policy();
        let ldap = Contributor::new("ecosystem", "ldap");
        let mut current = applied(np.plan(None, &ldap, &ports(&[("TCP", 389)])).expect("plan"));
        let peers = vec![NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: "10.0.0.0/8".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        current
            .spec
            .as_mut()
            .and_then(|s| s.ingress.as_mut())
            .expect("rules")[0]
            .from = Some(peers.clone());

        let removed = applied(
            np.plan(Some(&current), &ldap, &ExposedPorts::default())
                .expect("plan"),
        );
        assert_eq!(
            removed.spec.and_then(|s| s.ingress),
            Some(vec![NetworkPolicyIngressRule {
                from: Some(peers),
                ports: None,
            }])
        );
    }

    #[test]
    fn unchanged_when_reapplied() {
        let np = policy();
        let ldap = Contributor::new("ecosystem", "ldap");
        let desired = ports(&[("TCP", 389)]);
        let current = applied(np.plan(None, &ldap, &desired).expect("plan"));
        assert!(np
            .plan(Some(&current), &ldap, &desired)
            .expect("plan")
            .is_unchanged());
    }

    #[test]
    fn malformed_ownership_fails() {
        let np = policy();
        let mut current = np.empty();
        current.metadata.annotations = Some(btreemap! {
            "k8s.cloudogu.com/ces-exposed-ports-scm".to_string() => "{".to_string(),
        });
        np.plan(
            Some(&current),
            &Contributor::new("ecosystem", "ldap"),
            &ports(&[("TCP", 389)]),
        )
        .expect_err("malformed ownership must fail");
    }
}
