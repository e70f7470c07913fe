//! Per-service ingresses.
//!
//! Every `ces-services` entry of a Service becomes an Ingress named after the
//! entry. Depending on the global maintenance flag and the readiness of the
//! service's deployment, the Ingress routes to the service itself or to a
//! static page.

use crate::{
    backend::{Backend, Route},
    store::{self, ObjectStore},
    BoxError, Error, Result, Settings,
};
use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use exposure_controller_core::{
    CesService, ParseError, ADDITIONAL_INGRESS_ANNOTATIONS, CES_SERVICES_ANNOTATION,
};
use exposure_controller_k8s_api::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ObjectMeta, Resource, ResourceExt, Service,
    ServiceBackendPort, CES_SERVICE_OWNER_LABEL,
};
use std::{collections::BTreeMap, sync::Arc};

/// Reports whether the cluster is in maintenance mode.
#[async_trait]
pub trait MaintenanceMode: Send + Sync {
    async fn is_active(&self) -> Result<bool, BoxError>;
}

/// Reports whether the deployment behind a service has a ready pod.
#[async_trait]
pub trait DeploymentReadiness: Send + Sync {
    async fn is_ready(&self, name: &str) -> Result<bool, BoxError>;
}

/// Where a service's ingresses currently point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Maintenance,
    Starting,
    Ready,
}

pub struct IngressUpdater {
    settings: Arc<Settings>,
    backend: Arc<dyn Backend>,
    ingresses: Arc<dyn ObjectStore<Ingress>>,
    maintenance: Arc<dyn MaintenanceMode>,
    readiness: Arc<dyn DeploymentReadiness>,
}

/// An ingress computed for one ces-service, before annotations are added.
struct Planned<'a> {
    ces: &'a CesService,
    service: String,
    port: i32,
    route: Route,
}

impl IngressUpdater {
    pub fn new(
        settings: Arc<Settings>,
        backend: Arc<dyn Backend>,
        ingresses: Arc<dyn ObjectStore<Ingress>>,
        maintenance: Arc<dyn MaintenanceMode>,
        readiness: Arc<dyn DeploymentReadiness>,
    ) -> Self {
        Self {
            settings,
            backend,
            ingresses,
            maintenance,
            readiness,
        }
    }

    /// Maintenance takes precedence over readiness, except for the static
    /// content service, which serves the maintenance page.
    pub async fn state(&self, service: &str) -> Result<State> {
        if service != self.settings.static_content.service
            && self.maintenance.is_active().await.map_err(Error::Maintenance)?
        {
            return Ok(State::Maintenance);
        }
        let ready = self
            .readiness
            .is_ready(service)
            .await
            .map_err(|source| Error::Readiness {
                name: service.to_string(),
                source,
            })?;
        Ok(if ready { State::Ready } else { State::Starting })
    }

    /// Writes the ingresses of `service` and deletes the ones it no longer
    /// declares.
    pub async fn upsert(&self, service: &Service) -> Result<()> {
        let name = service.name_any();
        let annotations = service.annotations();
        let ces_services = match annotations.get(CES_SERVICES_ANNOTATION) {
            Some(json) => CesService::parse_list(CES_SERVICES_ANNOTATION, json)?,
            None => Vec::new(),
        };
        let additional = match annotations.get(ADDITIONAL_INGRESS_ANNOTATIONS) {
            Some(json) => serde_json::from_str::<BTreeMap<String, String>>(json).map_err(
                |source| ParseError::Json {
                    annotation: ADDITIONAL_INGRESS_ANNOTATIONS.to_string(),
                    source,
                },
            )?,
            None => BTreeMap::new(),
        };

        let mut planned = Vec::with_capacity(ces_services.len());
        let state = if ces_services.is_empty() {
            None
        } else {
            let state = self.state(&name).await?;
            tracing::debug!(service = %name, ?state, "Updating ingresses");
            for ces in &ces_services {
                planned.push(self.plan(state, &name, ces)?);
            }
            Some(state)
        };

        for Planned {
            ces,
            service: target,
            port,
            route,
        } in &planned
        {
            let mut annotations = self
                .backend
                .route_annotations(service, &ces.name, route)
                .await?;
            if state == Some(State::Ready) {
                annotations.extend(additional.clone());
            }
            let ingress = self.ingress(service, ces, target, *port, annotations);
            store::apply(&*self.ingresses, self.settings.retry, &ingress).await?;
        }

        let declared = ces_services
            .iter()
            .map(|ces| ces.name.as_str())
            .collect::<HashSet<_>>();
        let selector = format!("{CES_SERVICE_OWNER_LABEL}={name}");
        let existing = self
            .ingresses
            .list(&selector)
            .await
            .map_err(|e| Error::api("list", Ingress::kind(&()), &selector, e))?;
        for stale in existing {
            let stale = stale.name_any();
            if !declared.contains(stale.as_str()) {
                // The ingress goes last so that a failed cleanup is retried.
                self.backend.remove_route(&stale).await?;
                store::delete_if_exists(&*self.ingresses, &stale).await?;
            }
        }
        Ok(())
    }

    fn plan<'a>(&self, state: State, service: &str, ces: &'a CesService) -> Result<Planned<'a>> {
        let static_content = &self.settings.static_content;
        let page = |path: &str| Planned {
            ces,
            service: static_content.service.clone(),
            port: static_content.port,
            route: Route {
                rewrite_target: Some(path.to_string()),
                ..Default::default()
            },
        };
        Ok(match state {
            State::Maintenance => page(&static_content.maintenance_path),
            State::Starting => page(&static_content.starting_path),
            State::Ready => Planned {
                ces,
                service: service.to_string(),
                port: ces.port,
                route: Route {
                    rewrite_target: ces.needs_rewrite_target().then(|| ces.pass.clone()),
                    identity_encoding: true,
                    rewrite: ces.service_rewrite()?,
                },
            },
        })
    }

    fn ingress(
        &self,
        owner: &Service,
        ces: &CesService,
        target: &str,
        port: i32,
        annotations: BTreeMap<String, String>,
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(ces.name.clone()),
                namespace: Some(self.settings.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    CES_SERVICE_OWNER_LABEL.to_string(),
                    owner.name_any(),
                )])),
                annotations: (!annotations.is_empty()).then_some(annotations),
                owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.settings.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(ces.location.clone()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: target.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
