//! Cluster-backed answers to the questions the ingress state machine asks.

use crate::{
    k8s::{self, Api, Client, ConfigMap, Deployment},
    reconcile::{BoxError, DeploymentReadiness, MaintenanceMode},
    GlobalConfig,
};
use async_trait::async_trait;

/// Reads the maintenance flag from the global config ConfigMap.
#[derive(Clone)]
pub struct KubeMaintenance {
    api: Api<ConfigMap>,
    name: String,
}

/// Reads deployment readiness from the API server.
#[derive(Clone)]
pub struct KubeReadiness {
    api: Api<Deployment>,
}

/// A deployment is ready when at least one of its pods is.
pub(crate) fn is_ready(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .map_or(false, |ready| ready > 0)
}

// === impl KubeMaintenance ===

impl KubeMaintenance {
    pub fn new(client: Client, namespace: &str, name: impl ToString) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl MaintenanceMode for KubeMaintenance {
    async fn is_active(&self) -> Result<bool, BoxError> {
        let config = self.api.get_opt(&self.name).await?;
        Ok(config
            .as_ref()
            .map_or(false, |cm| GlobalConfig::from_config_map(cm).maintenance))
    }
}

// === impl KubeReadiness ===

impl KubeReadiness {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl DeploymentReadiness for KubeReadiness {
    async fn is_ready(&self, name: &str) -> Result<bool, BoxError> {
        match self.api.get(name).await {
            Ok(deployment) => Ok(is_ready(&deployment)),
            // Services without a deployment of their own are always routed.
            Err(error) if k8s::is_not_found(&error) => Ok(true),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::api::apps::v1::DeploymentStatus;

    fn deployment(ready_replicas: Option<i32>) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                ready_replicas,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness() {
        assert!(is_ready(&deployment(Some(1))));
        assert!(!is_ready(&deployment(Some(0))));
        assert!(!is_ready(&deployment(None)));
        assert!(!is_ready(&Deployment::default()));
    }
}
