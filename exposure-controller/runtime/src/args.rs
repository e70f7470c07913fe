use crate::{
    core::{BackendKind, RetryPolicy},
    index::Index,
    ingress_class,
    k8s::{
        traefik::{IngressRouteTCP, IngressRouteUDP, Middleware},
        Client, ConfigMap, Deployment, Resource, Service,
    },
    reconcile::{Reconciler, Settings, StaticContent, Stores},
    Controller, ControllerMetrics, KubeMaintenance, KubeReadiness,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

const RESYNC_PERIOD: Duration = Duration::from_secs(300);

// The maximum number of updates to buffer between the index and the
// controller.
const UPDATE_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Parser)]
#[clap(
    name = "exposure-controller",
    about = "Exposes annotated services through the ingress backend"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "exposure_controller=info,warn",
        env = "EXPOSURE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace of the exposed services and of the shared resources.
    #[clap(long, default_value = "ecosystem", env = "POD_NAMESPACE")]
    namespace: String,

    /// Either `nginx` or `traefik`.
    #[clap(long, default_value = "nginx")]
    ingress_backend: String,

    #[clap(long, default_value = "k8s-ecosystem-ces-service")]
    ingress_class: String,

    /// ConfigMap holding the FQDN, the alternative FQDNs and the maintenance
    /// flag.
    #[clap(long, default_value = "global-config")]
    global_config: String,

    #[clap(long, default_value = "nginx-static")]
    static_content_service: String,

    #[clap(long, default_value = "80")]
    static_content_port: i32,

    #[clap(long, default_value = "/errors/503.html")]
    maintenance_path: String,

    #[clap(long, default_value = "/errors/starting.html")]
    starting_path: String,

    /// How often a write to a shared resource is attempted when it keeps
    /// losing optimistic-concurrency races.
    #[clap(long, default_value = "5")]
    conflict_retries: u32,

    #[clap(long, default_value = "10000")]
    reconcile_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    requeue_delay_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            namespace,
            ingress_backend,
            ingress_class,
            global_config,
            static_content_service,
            static_content_port,
            maintenance_path,
            starting_path,
            conflict_retries,
            reconcile_timeout_ms,
            requeue_delay_ms,
        } = self;

        let mut prom = <Registry>::default();
        let metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("exposure_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let kind = BackendKind::from_config(&ingress_backend);
        let client = runtime.client();
        if kind == BackendKind::Traefik {
            warn_missing_crds(&client).await;
        }

        let settings = Settings {
            namespace: namespace.clone(),
            ingress_class: ingress_class.clone(),
            static_content: StaticContent {
                service: static_content_service,
                port: static_content_port,
                maintenance_path,
                starting_path,
            },
            retry: RetryPolicy::new(conflict_retries),
            ..Default::default()
        };
        tracing::info!(backend = ?kind, %namespace, "Starting");

        ingress_class::ensure(client.clone(), &ingress_class, &kind.identity()).await?;

        let reconciler = Arc::new(Reconciler::new(
            settings,
            kind,
            Stores::namespaced(client.clone(), &namespace),
            Arc::new(KubeMaintenance::new(
                client.clone(),
                &namespace,
                &global_config,
            )),
            Arc::new(KubeReadiness::new(client.clone(), &namespace)),
        ));

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE_SIZE);
        let index = Index::shared(
            &namespace,
            &global_config,
            reconciler.backend().exposed_name(),
            updates_tx.clone(),
        );

        // Spawn resource watches.

        let services =
            runtime.watch_namespaced::<Service>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let deployments =
            runtime.watch_namespaced::<Deployment>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), deployments)
                .instrument(info_span!("deployments")),
        );

        let config = runtime.watch_namespaced::<ConfigMap>(
            namespace.clone(),
            watcher::Config::default().fields(&format!("metadata.name={global_config}")),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), config).instrument(info_span!("globalconfig")),
        );

        tokio::spawn(Index::resync(index.clone(), RESYNC_PERIOD).instrument(info_span!("resync")));

        let controller = Controller::new(
            client,
            reconciler,
            index,
            updates_rx,
            updates_tx,
            Duration::from_millis(reconcile_timeout_ms),
            Duration::from_millis(requeue_delay_ms),
            metrics,
        );
        tokio::spawn(controller.run().instrument(info_span!("controller")));

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn warn_missing_crds(client: &Client) {
    if !api_resource_exists::<IngressRouteTCP>(client).await {
        tracing::warn!("ingressroutetcps.traefik.io resource kind not found");
    }
    if !api_resource_exists::<IngressRouteUDP>(client).await {
        tracing::warn!("ingressrouteudps.traefik.io resource kind not found");
    }
    if !api_resource_exists::<Middleware>(client).await {
        tracing::warn!("middlewares.traefik.io resource kind not found");
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["exposure-controller"]).expect("must parse");
        assert_eq!(args.ingress_class, "k8s-ecosystem-ces-service");
        assert_eq!(args.static_content_port, 80);
        assert_eq!(args.conflict_retries, 5);
        assert_eq!(args.reconcile_timeout_ms, 10_000);
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
