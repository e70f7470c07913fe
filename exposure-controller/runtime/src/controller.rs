use crate::{
    index::{SharedIndex, Update},
    k8s::{Client, Resource, Service},
    reconcile::{self, Reconciler},
    ControllerMetrics,
};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::Instrument;

pub const CONTROLLER_NAME: &str = "exposure-controller";

/// Receives updates from the index and reconciles each of them in its own
/// task. Failed updates are retried after a delay.
pub struct Controller {
    updates: mpsc::Receiver<Update>,
    inner: Arc<Inner>,
}

struct Inner {
    reconciler: Arc<Reconciler>,
    index: SharedIndex,
    requeue: mpsc::Sender<Update>,
    recorder: Recorder,
    timeout: Duration,
    requeue_delay: Duration,
    metrics: ControllerMetrics,
}

#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error(transparent)]
    Reconcile(#[from] reconcile::Error),

    #[error("reconciliation did not complete within {0:?}")]
    Timeout(Duration),
}

impl Failure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Reconcile(error) => !error.is_permanent(),
            Self::Timeout(_) => true,
        }
    }
}

// === impl Controller ===

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        reconciler: Arc<Reconciler>,
        index: SharedIndex,
        updates: mpsc::Receiver<Update>,
        requeue: mpsc::Sender<Update>,
        timeout: Duration,
        requeue_delay: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            updates,
            inner: Arc::new(Inner {
                reconciler,
                index,
                requeue,
                recorder: Recorder::new(client, reporter),
                timeout,
                requeue_delay,
                metrics,
            }),
        }
    }

    pub async fn run(mut self) {
        while let Some(update) = self.updates.recv().await {
            let span = tracing::info_span!("reconcile", kind = update.kind(), service = ?update.service());
            tokio::spawn(self.inner.clone().process(update).instrument(span));
        }
        tracing::debug!("Update stream closed");
    }
}

// === impl Inner ===

impl Inner {
    async fn process(self: Arc<Self>, update: Update) {
        let kind = update.kind();
        self.metrics.reconciled(kind);
        let error = match tokio::time::timeout(self.timeout, self.reconcile(&update)).await {
            Ok(Ok(())) => {
                tracing::debug!("Reconciled");
                return;
            }
            Ok(Err(error)) => Failure::Reconcile(error),
            Err(_) => {
                self.metrics.timed_out(kind);
                Failure::Timeout(self.timeout)
            }
        };

        self.metrics.failed(kind);
        if !error.is_retryable() {
            // The next change to the service triggers a new attempt.
            tracing::warn!(%error, "Reconciliation failed on malformed input");
            self.publish_failure(&update, &error).await;
            return;
        }
        tracing::warn!(%error, delay = ?self.requeue_delay, "Reconciliation failed, requeueing");
        self.publish_failure(&update, &error).await;

        tokio::time::sleep(self.requeue_delay).await;
        if self.requeue.send(update).await.is_err() {
            tracing::debug!("Controller is gone, not requeueing");
        }
    }

    async fn reconcile(&self, update: &Update) -> reconcile::Result<()> {
        match update {
            Update::Exposure(name) => {
                let (namespace, service) = {
                    let index = self.index.read();
                    (index.namespace().to_string(), index.service(name))
                };
                match service {
                    Some(service) => {
                        self.reconciler.exposure().upsert(&service).await?;
                        self.reconciler.ingresses().upsert(&service).await
                    }
                    None => self.reconciler.exposure().remove(&namespace, name).await,
                }
            }

            Update::Ingresses(name) => {
                let service = self.index.read().service(name);
                match service {
                    Some(service) => self.reconciler.ingresses().upsert(&service).await,
                    None => Ok(()),
                }
            }

            Update::Redirect => {
                let (primary, alternatives) = self.index.read().redirect();
                self.reconciler
                    .redirect_alternative_fqdns(&primary, &alternatives)
                    .await
            }
        }
    }

    /// Reports a failure on the service it concerns. Publishing is best
    /// effort.
    async fn publish_failure(&self, update: &Update, error: &Failure) {
        let service = match update.service() {
            Some(name) => self.index.read().service(name),
            None => None,
        };
        let Some(service) = service else { return };

        let event = Event {
            type_: EventType::Warning,
            reason: "ReconcileFailed".to_string(),
            note: Some(error.to_string()),
            action: update.kind().to_string(),
            secondary: None,
        };
        if let Err(error) = self
            .recorder
            .publish(&event, &Service::object_ref(&service, &()))
            .await
        {
            tracing::warn!(%error, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ParseError;

    #[test]
    fn malformed_input_is_not_retried() {
        let undeclared = Failure::from(reconcile::Error::UndeclaredPort {
            service: "ldap".to_string(),
            port: 636,
        });
        assert!(!undeclared.is_retryable());

        let malformed = Failure::from(reconcile::Error::Parse(ParseError::Json {
            annotation: "ces-services".to_string(),
            source: serde_json::from_str::<u8>("nope").expect_err("must fail"),
        }));
        assert!(!malformed.is_retryable());

        assert!(Failure::Timeout(Duration::from_secs(10)).is_retryable());

        let readiness = Failure::from(reconcile::Error::Readiness {
            name: "cas".to_string(),
            source: "unavailable".into(),
        });
        assert!(readiness.is_retryable());
    }
}
