use crate::{Error, Result};
use async_trait::async_trait;
use exposure_controller_core::{retry, RetryPolicy};
use exposure_controller_k8s_api::{
    self as k8s,
    traefik::{IngressRouteTCP, IngressRouteUDP, Middleware},
    Api, Client, ConfigMap, DeleteParams, Ingress, ListParams, NetworkPolicy, PostParams,
    Resource, ResourceExt, Service,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, sync::Arc};

/// Typed access to the objects of one kind in one namespace.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>, k8s::Error>;

    /// Lists the objects matching a `k=v,k=v` label selector.
    async fn list(&self, labels: &str) -> Result<Vec<K>, k8s::Error>;

    async fn create(&self, obj: &K) -> Result<K, k8s::Error>;

    /// Replaces an object. The object's resourceVersion must match the
    /// stored one.
    async fn replace(&self, obj: &K) -> Result<K, k8s::Error>;

    async fn delete(&self, name: &str) -> Result<(), k8s::Error>;
}

/// An object owned wholesale by a single writer.
pub trait Owned: Resource<DynamicType = ()> + Clone + PartialEq + Send + Sync + 'static {
    /// Copies fields maintained by other parties from `current`.
    fn keep_foreign_fields(&mut self, _current: &Self) {}
}

// === impl Api ===

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource + Clone + fmt::Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, k8s::Error> {
        self.get_opt(name).await
    }

    async fn list(&self, labels: &str) -> Result<Vec<K>, k8s::Error> {
        let params = ListParams::default().labels(labels);
        Ok(Api::list(self, &params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, k8s::Error> {
        Api::create(self, &PostParams::default(), obj).await
    }

    async fn replace(&self, obj: &K) -> Result<K, k8s::Error> {
        Api::replace(self, &obj.name_any(), &PostParams::default(), obj).await
    }

    async fn delete(&self, name: &str) -> Result<(), k8s::Error> {
        Api::delete(self, name, &DeleteParams::default()).await?;
        Ok(())
    }
}

// === impl Owned ===

impl Owned for Ingress {
    fn keep_foreign_fields(&mut self, current: &Self) {
        self.status = current.status.clone();
    }
}

impl Owned for Middleware {}

impl Owned for IngressRouteTCP {}

impl Owned for IngressRouteUDP {}

/// Creates `desired` or replaces the stored object with it. Labels,
/// annotations and owner references are taken from `desired`; the rest of
/// the stored metadata is kept. Returns whether anything was written.
pub(crate) async fn apply<K: Owned>(
    store: &dyn ObjectStore<K>,
    policy: RetryPolicy,
    desired: &K,
) -> Result<bool> {
    let name = &desired.name_any();
    let kind = &K::kind(&()).to_string();
    retry::on_conflict(policy, Error::is_conflict, || async move {
        let current = store
            .get(name)
            .await
            .map_err(|e| Error::api("get", kind, name, e))?;
        let Some(current) = current else {
            store
                .create(desired)
                .await
                .map_err(|e| Error::api("create", kind, name, e))?;
            tracing::info!(%kind, %name, "Created");
            return Ok(true);
        };

        let mut next = desired.clone();
        let mut meta = current.meta().clone();
        meta.labels = desired.meta().labels.clone();
        meta.annotations = desired.meta().annotations.clone();
        meta.owner_references = desired.meta().owner_references.clone();
        *next.meta_mut() = meta;
        next.keep_foreign_fields(&current);
        if next == current {
            tracing::debug!(%kind, %name, "Unchanged");
            return Ok(false);
        }

        store
            .replace(&next)
            .await
            .map_err(|e| Error::api("replace", kind, name, e))?;
        tracing::info!(%kind, %name, "Updated");
        Ok(true)
    })
    .await
}

/// Deletes an object, treating a missing object as already deleted.
pub(crate) async fn delete_if_exists<K: Resource<DynamicType = ()>>(
    store: &dyn ObjectStore<K>,
    name: &str,
) -> Result<bool> {
    match store.delete(name).await {
        Ok(()) => {
            tracing::info!(kind = %K::kind(&()), %name, "Deleted");
            Ok(true)
        }
        Err(error) if k8s::is_not_found(&error) => Ok(false),
        Err(error) => Err(Error::api("delete", K::kind(&()), name, error)),
    }
}

/// The stores a reconciler writes through, all scoped to one namespace.
#[derive(Clone)]
pub struct Stores {
    pub services: Arc<dyn ObjectStore<Service>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub network_policies: Arc<dyn ObjectStore<NetworkPolicy>>,
    pub ingresses: Arc<dyn ObjectStore<Ingress>>,
    pub middlewares: Arc<dyn ObjectStore<Middleware>>,
    pub tcp_routes: Arc<dyn ObjectStore<IngressRouteTCP>>,
    pub udp_routes: Arc<dyn ObjectStore<IngressRouteUDP>>,
}

impl Stores {
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            services: Arc::new(Api::<Service>::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(Api::<ConfigMap>::namespaced(client.clone(), namespace)),
            network_policies: Arc::new(Api::<NetworkPolicy>::namespaced(
                client.clone(),
                namespace,
            )),
            ingresses: Arc::new(Api::<Ingress>::namespaced(client.clone(), namespace)),
            middlewares: Arc::new(Api::<Middleware>::namespaced(client.clone(), namespace)),
            tcp_routes: Arc::new(Api::<IngressRouteTCP>::namespaced(
                client.clone(),
                namespace,
            )),
            udp_routes: Arc::new(Api::<IngressRouteUDP>::namespaced(client, namespace)),
        }
    }
}
