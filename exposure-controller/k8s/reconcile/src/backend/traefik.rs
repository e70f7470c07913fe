use super::{Backend, Route};
use crate::{
    redirect,
    store::{self, ObjectStore, Owned},
    Error, Result, Settings, Stores,
};
use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use exposure_controller_core::{
    merge, AlternativeFqdn, BackendKind, Contributor, Entry, ExposedPort, ExposedPorts, Identity,
    Protocol,
};
use exposure_controller_k8s_api::{
    traefik::{
        Headers, IngressRouteTCP, IngressRouteTcpSpec, IngressRouteUDP, IngressRouteUdpSpec,
        Middleware, MiddlewareSpec, ReplacePath, ReplacePathRegex, RouteService, TcpRoute,
        UdpRoute,
    },
    Ingress, Resource, ResourceExt, Service, EXPOSED_SERVICE_LABEL,
};
use std::{collections::BTreeMap, sync::Arc};

/// Traefik. Every port is forwarded by its own `IngressRouteTCP` or
/// `IngressRouteUDP`; routes are configured with `Middleware` objects.
pub struct Traefik {
    identity: Identity,
    settings: Arc<Settings>,
    ingresses: Arc<dyn ObjectStore<Ingress>>,
    middlewares: Arc<dyn ObjectStore<Middleware>>,
    tcp_routes: Arc<dyn ObjectStore<IngressRouteTCP>>,
    udp_routes: Arc<dyn ObjectStore<IngressRouteUDP>>,
}

/// A resource that forwards one entry point to one service port.
trait PortRoute: Owned {
    fn protocol() -> Protocol;

    fn build(name: &str, entry_point: String, service: RouteService) -> Self;

    fn entry_points(&self) -> &[String];

    fn service(&self) -> Option<&RouteService>;
}

#[derive(Clone, Debug, PartialEq)]
struct Forward {
    entry_point: String,
    target: String,
}

// === impl Traefik ===

impl Traefik {
    pub fn new(settings: Arc<Settings>, stores: &Stores) -> Self {
        Self {
            identity: BackendKind::Traefik.identity(),
            settings,
            ingresses: stores.ingresses.clone(),
            middlewares: stores.middlewares.clone(),
            tcp_routes: stores.tcp_routes.clone(),
            udp_routes: stores.udp_routes.clone(),
        }
    }

    /// How an ingress refers to a middleware in its namespace.
    fn middleware_ref(&self, name: &str) -> String {
        format!("{}-{}@kubernetescrd", self.settings.namespace, name)
    }

    async fn converge_routes<K: PortRoute>(
        &self,
        store: &dyn ObjectStore<K>,
        owner: &Contributor,
        ports: &ExposedPorts,
    ) -> Result<()> {
        let protocol = K::protocol();
        let current = store
            .list(EXPOSED_SERVICE_LABEL)
            .await
            .map_err(|e| Error::api("list", K::kind(&()), &self.settings.namespace, e))?;

        let owned_by = |route: &K, name: &str| {
            route.labels().get(EXPOSED_SERVICE_LABEL).map(String::as_str) == Some(name)
        };
        let entries = current.iter().filter_map(Forward::of).collect::<Vec<_>>();
        let prior = current
            .iter()
            .filter(|r| owned_by(*r, &owner.name))
            .filter_map(Forward::of)
            .collect::<Vec<_>>();
        let claimed = current
            .iter()
            .filter(|r| !owned_by(*r, &owner.name))
            .filter_map(Forward::of)
            .map(|f| f.id())
            .collect::<HashSet<_>>();

        let wanted = ports
            .with_protocol(&protocol)
            .iter()
            .map(|port| route::<K>(owner, port))
            .collect::<Vec<_>>();
        let forwards = wanted
            .iter()
            .filter_map(Forward::of)
            .collect::<Vec<_>>();

        let merged = merge(&entries, &prior, &forwards, &claimed);
        for forward in &merged.collisions {
            tracing::warn!(
                entry_point = %forward.entry_point,
                %owner,
                "Entry point is already forwarded to another service"
            );
        }

        let keep = wanted
            .iter()
            .filter(|r| Forward::of(*r).map_or(false, |f| merged.owned.contains(&f)))
            .collect::<Vec<_>>();
        for stale in current.iter().filter(|r| owned_by(*r, &owner.name)) {
            let name = stale.name_any();
            if !keep.iter().any(|r| r.name_any() == name) {
                store::delete_if_exists(store, &name).await?;
            }
        }
        for route in keep {
            store::apply(store, self.settings.retry, route).await?;
        }
        Ok(())
    }

    async fn apply_middleware(
        &self,
        owner: &Service,
        name: String,
        spec: Option<MiddlewareSpec>,
    ) -> Result<Option<String>> {
        let Some(spec) = spec else {
            store::delete_if_exists(&*self.middlewares, &name).await?;
            return Ok(None);
        };
        let mut middleware = Middleware::new(&name, spec);
        middleware.metadata.namespace = Some(self.settings.namespace.clone());
        middleware.metadata.labels = Some(BTreeMap::from([(
            EXPOSED_SERVICE_LABEL.to_string(),
            owner.name_any(),
        )]));
        middleware.metadata.owner_references =
            owner.controller_owner_ref(&()).map(|r| vec![r]);
        store::apply(&*self.middlewares, self.settings.retry, &middleware).await?;
        Ok(Some(self.middleware_ref(&name)))
    }
}

#[async_trait]
impl Backend for Traefik {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn materialize_ports(&self, owner: &Contributor, ports: &ExposedPorts) -> Result<()> {
        let ports = super::forwardable(owner, ports);
        self.converge_routes(&*self.tcp_routes, owner, &ports).await?;
        self.converge_routes(&*self.udp_routes, owner, &ports).await
    }

    async fn route_annotations(
        &self,
        owner: &Service,
        ingress: &str,
        route: &Route,
    ) -> Result<BTreeMap<String, String>> {
        let headers = route.identity_encoding.then(|| MiddlewareSpec {
            headers: Some(Headers {
                custom_request_headers: BTreeMap::from([(
                    "Accept-Encoding".to_string(),
                    "identity".to_string(),
                )]),
            }),
            ..Default::default()
        });
        let path_regex = route.rewrite.as_ref().map(|rewrite| {
            let (regex, replacement) = rewrite.path_regex();
            MiddlewareSpec {
                replace_path_regex: Some(ReplacePathRegex { regex, replacement }),
                ..Default::default()
            }
        });
        let replace_path = route.rewrite_target.as_ref().map(|path| MiddlewareSpec {
            replace_path: Some(ReplacePath { path: path.clone() }),
            ..Default::default()
        });

        let mut annotations = BTreeMap::<String, String>::new();
        // Both keys are the same for traefik, so references are appended.
        let mut add = |key: &str, reference: Option<String>| {
            if let Some(reference) = reference {
                match annotations.get_mut(key) {
                    Some(refs) => {
                        refs.push(',');
                        refs.push_str(&reference);
                    }
                    None => {
                        annotations.insert(key.to_string(), reference);
                    }
                }
            }
        };
        let [headers_name, path_regex_name, replace_path_name] = route_middlewares(ingress);
        let additional = self.additional_configuration_key();
        add(
            additional,
            self.apply_middleware(owner, headers_name, headers).await?,
        );
        add(
            additional,
            self.apply_middleware(owner, path_regex_name, path_regex)
                .await?,
        );
        add(
            self.rewrite_annotation_key(),
            self.apply_middleware(owner, replace_path_name, replace_path)
                .await?,
        );
        Ok(annotations)
    }

    async fn remove_route(&self, ingress: &str) -> Result<()> {
        for name in route_middlewares(ingress) {
            store::delete_if_exists(&*self.middlewares, &name).await?;
        }
        Ok(())
    }

    async fn redirect_alternative_fqdns(
        &self,
        primary: &str,
        alternatives: &[AlternativeFqdn],
    ) -> Result<()> {
        let name = &self.settings.fqdn_redirect;
        let middleware = redirect::alternative_fqdn_middleware(&self.settings, primary, alternatives);
        let annotations = BTreeMap::from([(
            self.additional_configuration_key().to_string(),
            self.middleware_ref(name),
        )]);
        let ingress = redirect::alternative_fqdn_ingress(&self.settings, alternatives, annotations);

        match (middleware, ingress) {
            (Some(middleware), Some(ingress)) => {
                store::apply(&*self.middlewares, self.settings.retry, &middleware).await?;
                store::apply(&*self.ingresses, self.settings.retry, &ingress).await?;
            }
            _ => {
                store::delete_if_exists(&*self.ingresses, name).await?;
                store::delete_if_exists(&*self.middlewares, name).await?;
            }
        }
        Ok(())
    }
}

/// Names of the middlewares that configure the ingress named `ingress`.
fn route_middlewares(ingress: &str) -> [String; 3] {
    [
        format!("{ingress}-headers"),
        format!("{ingress}-path-regex"),
        format!("{ingress}-replace-path"),
    ]
}

/// Builds the route that forwards `port` to `owner`.
fn route<K: PortRoute>(owner: &Contributor, port: &ExposedPort) -> K {
    let proto = K::protocol().as_str().to_ascii_lowercase();
    let name = format!("{}-{}-{}", owner.name, port.port, proto);
    let mut route = K::build(
        &name,
        format!("{}-{}", proto, port.port),
        RouteService {
            name: owner.name.clone(),
            namespace: None,
            port: port.target_port,
        },
    );
    let meta = route.meta_mut();
    meta.namespace = Some(owner.namespace.clone());
    meta.labels = Some(BTreeMap::from([(
        EXPOSED_SERVICE_LABEL.to_string(),
        owner.name.clone(),
    )]));
    route
}

// === impl Forward ===

impl Forward {
    fn of<K: PortRoute>(route: &K) -> Option<Self> {
        let entry_point = route.entry_points().first()?.clone();
        let service = route.service()?;
        let namespace = service
            .namespace
            .clone()
            .or_else(|| route.namespace())
            .unwrap_or_default();
        Some(Self {
            entry_point,
            target: format!("{}/{}:{}", namespace, service.name, service.port),
        })
    }
}

impl Entry for Forward {
    type Id = String;

    fn id(&self) -> String {
        self.entry_point.clone()
    }
}

// === impl PortRoute ===

impl PortRoute for IngressRouteTCP {
    fn protocol() -> Protocol {
        Protocol::Tcp
    }

    fn build(name: &str, entry_point: String, service: RouteService) -> Self {
        Self::new(
            name,
            IngressRouteTcpSpec {
                entry_points: vec![entry_point],
                routes: vec![TcpRoute {
                    match_: "HostSNI(`*`)".to_string(),
                    services: vec![service],
                }],
            },
        )
    }

    fn entry_points(&self) -> &[String] {
        &self.spec.entry_points
    }

    fn service(&self) -> Option<&RouteService> {
        self.spec.routes.first()?.services.first()
    }
}

impl PortRoute for IngressRouteUDP {
    fn protocol() -> Protocol {
        Protocol::Udp
    }

    fn build(name: &str, entry_point: String, service: RouteService) -> Self {
        Self::new(
            name,
            IngressRouteUdpSpec {
                entry_points: vec![entry_point],
                routes: vec![UdpRoute {
                    services: vec![service],
                }],
            },
        )
    }

    fn entry_points(&self) -> &[String] {
        &self.spec.entry_points
    }

    fn service(&self) -> Option<&RouteService> {
        self.spec.routes.first()?.services.first()
    }
}
