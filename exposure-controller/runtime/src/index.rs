//! Watches the namespace and turns changes into reconciliation requests.
//!
//! The index only keeps the latest version of each object. Updates name what
//! changed; the controller looks up the current state when it processes
//! them, so a requeued update never acts on stale data.

use crate::{
    cluster,
    core::{AlternativeFqdn, CES_SERVICES_ANNOTATION},
    k8s::{ConfigMap, Deployment, ResourceExt, Service, ServicePort},
    GlobalConfig,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SharedIndex = Arc<RwLock<Index>>;

/// A request to reconcile part of the namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    /// A service's exposed ports and ingresses. A service that is gone has
    /// its exposure removed.
    Exposure(String),

    /// Only the ingresses of a service, after its readiness or the
    /// maintenance mode changed.
    Ingresses(String),

    /// The redirect of the alternative FQDNs.
    Redirect,
}

pub struct Index {
    namespace: String,
    global_config: String,

    /// The shared LoadBalancer service is written by the controller itself
    /// and never contributes.
    exposed_service: String,

    updates: mpsc::Sender<Update>,

    services: HashMap<String, Service>,
    ready: HashMap<String, bool>,
    config: GlobalConfig,
}

// === impl Update ===

impl Update {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exposure(_) => "exposure",
            Self::Ingresses(_) => "ingress",
            Self::Redirect => "redirect",
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Exposure(name) | Self::Ingresses(name) => Some(name),
            Self::Redirect => None,
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        namespace: impl ToString,
        global_config: impl ToString,
        exposed_service: impl ToString,
        updates: mpsc::Sender<Update>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            namespace: namespace.to_string(),
            global_config: global_config.to_string(),
            exposed_service: exposed_service.to_string(),
            updates,
            services: HashMap::new(),
            ready: HashMap::new(),
            config: GlobalConfig::default(),
        }))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.get(name).cloned()
    }

    /// The primary FQDN and the alternatives that redirect to it.
    pub fn redirect(&self) -> (String, Vec<AlternativeFqdn>) {
        self.config.redirect()
    }

    /// Periodically requests a reconciliation of everything in the index, so
    /// that drift and dropped updates are eventually repaired.
    pub async fn resync(index: SharedIndex, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the watches already trigger
        // the initial reconciliation.
        interval.tick().await;
        loop {
            interval.tick().await;
            let guard = index.read();
            tracing::debug!(services = guard.services.len(), "Resyncing");
            for name in guard.services.keys() {
                guard.send(Update::Exposure(name.clone()));
            }
            guard.send(Update::Redirect);
        }
    }

    fn send(&self, update: Update) {
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::error!(?update, "Update queue is full, dropping update")
            }
            Err(TrySendError::Closed(update)) => {
                tracing::error!(?update, "Controller is gone, dropping update")
            }
        }
    }

    fn has_ces_services(&self, name: &str) -> bool {
        self.services
            .get(name)
            .map_or(false, |svc| svc.annotations().contains_key(CES_SERVICES_ANNOTATION))
    }

    fn ingress_services(&self) -> Vec<String> {
        let mut names = self
            .services
            .keys()
            .filter(|name| self.has_ces_services(name))
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn apply_config(&mut self, config: GlobalConfig) {
        let previous = std::mem::replace(&mut self.config, config);
        if previous.maintenance != self.config.maintenance {
            tracing::info!(maintenance = self.config.maintenance, "Maintenance mode changed");
            for name in self.ingress_services() {
                self.send(Update::Ingresses(name));
            }
        }
        if previous.redirect() != self.config.redirect() {
            self.send(Update::Redirect);
        }
    }

    fn apply_readiness(&mut self, name: String, ready: Option<bool>) {
        let previous = match ready {
            Some(ready) => self.ready.insert(name.clone(), ready),
            None => self.ready.remove(&name),
        };
        if previous == ready {
            return;
        }
        tracing::debug!(%name, ?ready, "Deployment readiness changed");
        if self.has_ces_services(&name) {
            self.send(Update::Ingresses(name));
        }
    }
}

/// The parts of a service that drive its reconciliation.
fn relevant(svc: &Service) -> (&BTreeMap<String, String>, Option<&Vec<ServicePort>>) {
    (
        svc.annotations(),
        svc.spec.as_ref().and_then(|spec| spec.ports.as_ref()),
    )
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, resource: Service) {
        let name = resource.name_unchecked();
        if name == self.exposed_service {
            return;
        }

        if let Some(previous) = self.services.get(&name) {
            if relevant(previous) == relevant(&resource) {
                self.services.insert(name, resource);
                return;
            }
        }
        self.services.insert(name.clone(), resource);
        self.send(Update::Exposure(name));
    }

    fn delete(&mut self, _namespace: String, name: String) {
        if self.services.remove(&name).is_some() {
            self.send(Update::Exposure(name));
        }
    }
}

impl kubert::index::IndexNamespacedResource<Deployment> for Index {
    fn apply(&mut self, resource: Deployment) {
        let ready = cluster::is_ready(&resource);
        self.apply_readiness(resource.name_unchecked(), Some(ready));
    }

    fn delete(&mut self, _namespace: String, name: String) {
        self.apply_readiness(name, None);
    }
}

impl kubert::index::IndexNamespacedResource<ConfigMap> for Index {
    fn apply(&mut self, resource: ConfigMap) {
        if resource.name_unchecked() != self.global_config {
            return;
        }
        self.apply_config(GlobalConfig::from_config_map(&resource));
    }

    fn delete(&mut self, _namespace: String, name: String) {
        if name == self.global_config {
            self.apply_config(GlobalConfig::default());
        }
    }
}
