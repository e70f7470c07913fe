use super::{Backend, Route};
use crate::{
    redirect,
    shared::{self, SharedResource},
    store::{self, ObjectStore},
    Result, Settings, Stores,
};
use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use exposure_controller_core::{
    merge, AlternativeFqdn, BackendKind, Change, Contributor, Entry, ExposedPorts, Identity,
    Protocol,
};
use exposure_controller_k8s_api::{ConfigMap, Ingress, ObjectMeta, Service};
use std::{collections::BTreeMap, sync::Arc};

const ACCEPT_ENCODING_DIRECTIVE: &str = r#"proxy_set_header Accept-Encoding "identity";"#;
const PERMANENT_REDIRECT: &str = "nginx.ingress.kubernetes.io/permanent-redirect";
const PERMANENT_REDIRECT_CODE: &str = "nginx.ingress.kubernetes.io/permanent-redirect-code";

/// ingress-nginx. Ports are forwarded through the `tcp-services` and
/// `udp-services` ConfigMaps; routes are configured with annotations.
pub struct Nginx {
    identity: Identity,
    settings: Arc<Settings>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    ingresses: Arc<dyn ObjectStore<Ingress>>,
    tables: [ForwardingTable; 2],
}

/// A ConfigMap that maps a port to `<namespace>/<service>:<port>`.
struct ForwardingTable {
    name: String,
    namespace: String,
    protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq)]
struct Forward {
    port: String,
    target: String,
}

// === impl Nginx ===

impl Nginx {
    pub fn new(settings: Arc<Settings>, stores: &Stores) -> Self {
        let tables = [
            ForwardingTable::new(&settings.tcp_services, &settings.namespace, Protocol::Tcp),
            ForwardingTable::new(&settings.udp_services, &settings.namespace, Protocol::Udp),
        ];
        Self {
            identity: BackendKind::Nginx.identity(),
            config_maps: stores.config_maps.clone(),
            ingresses: stores.ingresses.clone(),
            tables,
            settings,
        }
    }
}

#[async_trait]
impl Backend for Nginx {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn materialize_ports(&self, owner: &Contributor, ports: &ExposedPorts) -> Result<()> {
        let ports = super::forwardable(owner, ports);
        for table in &self.tables {
            shared::converge(
                table,
                &*self.config_maps,
                self.settings.retry,
                owner,
                &ports,
            )
            .await?;
        }
        Ok(())
    }

    async fn route_annotations(
        &self,
        _owner: &Service,
        _ingress: &str,
        route: &Route,
    ) -> Result<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        if let Some(target) = &route.rewrite_target {
            annotations.insert(self.rewrite_annotation_key().to_string(), target.clone());
        }

        let mut snippet = Vec::new();
        if route.identity_encoding {
            snippet.push(ACCEPT_ENCODING_DIRECTIVE.to_string());
        }
        if let Some(rewrite) = &route.rewrite {
            snippet.push(rewrite.nginx_directive());
        }
        if !snippet.is_empty() {
            annotations.insert(
                self.additional_configuration_key().to_string(),
                snippet.join("\n"),
            );
        }
        Ok(annotations)
    }

    async fn redirect_alternative_fqdns(
        &self,
        primary: &str,
        alternatives: &[AlternativeFqdn],
    ) -> Result<()> {
        let annotations = [
            (
                PERMANENT_REDIRECT.to_string(),
                format!("https://{primary}$request_uri"),
            ),
            (PERMANENT_REDIRECT_CODE.to_string(), "308".to_string()),
        ]
        .into_iter()
        .collect();
        match redirect::alternative_fqdn_ingress(&self.settings, alternatives, annotations) {
            Some(ingress) => {
                store::apply(&*self.ingresses, self.settings.retry, &ingress).await?;
            }
            None => {
                store::delete_if_exists(&*self.ingresses, &self.settings.fqdn_redirect).await?;
            }
        }
        Ok(())
    }
}

// === impl ForwardingTable ===

impl ForwardingTable {
    fn new(name: &str, namespace: &str, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            protocol,
        }
    }
}

impl SharedResource for ForwardingTable {
    type Object = ConfigMap;

    fn name(&self) -> &str {
        &self.name
    }

    /// Forwarding tables are never deleted, even when they become empty.
    fn plan(
        &self,
        current: Option<&ConfigMap>,
        contributor: &Contributor,
        desired: &ExposedPorts,
    ) -> Result<Change<ConfigMap>> {
        let wanted = desired
            .with_protocol(&self.protocol)
            .iter()
            .map(|p| Forward {
                port: p.port.to_string(),
                target: contributor.forward_target(p.target_port),
            })
            .collect::<Vec<_>>();

        let Some(current) = current else {
            if wanted.is_empty() {
                return Ok(Change::Unchanged);
            }
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                data: Some(wanted.into_iter().map(|f| (f.port, f.target)).collect()),
                ..Default::default()
            };
            return Ok(Change::Create(cm));
        };

        let entries = current
            .data
            .iter()
            .flatten()
            .map(|(port, target)| Forward {
                port: port.clone(),
                target: target.clone(),
            })
            .collect::<Vec<_>>();
        let prior = entries
            .iter()
            .filter(|f| contributor.owns_forward_target(&f.target))
            .cloned()
            .collect::<Vec<_>>();
        let claimed = entries
            .iter()
            .filter(|f| !contributor.owns_forward_target(&f.target))
            .map(Entry::id)
            .collect::<HashSet<_>>();

        let merged = merge(&entries, &prior, &wanted, &claimed);
        for forward in &merged.collisions {
            let owner = entries
                .iter()
                .find(|f| f.port == forward.port)
                .map(|f| f.target.as_str())
                .unwrap_or_default();
            tracing::warn!(
                table = %self.name,
                port = %forward.port,
                %contributor,
                %owner,
                "Port is already forwarded to another service"
            );
        }

        let data = merged
            .entries
            .into_iter()
            .map(|f| (f.port, f.target))
            .collect::<BTreeMap<_, _>>();
        let mut next = current.clone();
        if current.data.is_some() || !data.is_empty() {
            next.data = Some(data);
        }
        Ok(Change::between(Some(current), Some(next)))
    }
}

impl Entry for Forward {
    type Id = String;

    fn id(&self) -> String {
        self.port.clone()
    }
}
