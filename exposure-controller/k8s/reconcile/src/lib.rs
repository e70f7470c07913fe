//! Reconciles services' exposure annotations into cluster resources.
//!
//! Per-service ingresses are owned by a single service. The NetworkPolicy,
//! the LoadBalancer Service and the forwarding tables are shared by all
//! services; each service only ever changes its own part of them.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
mod error;
pub mod exposure;
pub mod ingress;
mod load_balancer;
mod network_policy;
pub mod redirect;
mod settings;
mod shared;
mod store;


pub use self::{
    backend::{Backend, Route},
    error::{BoxError, Error, Result},
    exposure::Exposure,
    ingress::{DeploymentReadiness, IngressUpdater, MaintenanceMode, State},
    settings::{Settings, StaticContent},
    store::{ObjectStore, Owned, Stores},
};
use exposure_controller_core::{AlternativeFqdn, BackendKind};
use std::sync::Arc;

/// Everything needed to reconcile the services of one namespace.
pub struct Reconciler {
    backend: Arc<dyn Backend>,
    exposure: Exposure,
    ingresses: IngressUpdater,
}

impl Reconciler {
    pub fn new(
        settings: Settings,
        kind: BackendKind,
        stores: Stores,
        maintenance: Arc<dyn MaintenanceMode>,
        readiness: Arc<dyn DeploymentReadiness>,
    ) -> Self {
        let settings = Arc::new(settings);
        let backend = backend::new(kind, settings.clone(), &stores);
        Self {
            exposure: Exposure::new(settings.clone(), backend.clone(), &stores),
            ingresses: IngressUpdater::new(
                settings,
                backend.clone(),
                stores.ingresses.clone(),
                maintenance,
                readiness,
            ),
            backend,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn exposure(&self) -> &Exposure {
        &self.exposure
    }

    pub fn ingresses(&self) -> &IngressUpdater {
        &self.ingresses
    }

    pub async fn redirect_alternative_fqdns(
        &self,
        primary: &str,
        alternatives: &[AlternativeFqdn],
    ) -> Result<()> {
        self.backend
            .redirect_alternative_fqdns(primary, alternatives)
            .await
    }
}
