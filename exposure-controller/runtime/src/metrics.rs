use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<KindLabels, Counter>,
    failures: Family<KindLabels, Counter>,
    timeouts: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::<KindLabels, Counter>::default();
        prom.register(
            "reconcile",
            "Count of reconciliations attempted",
            reconciles.clone(),
        );

        let failures = Family::<KindLabels, Counter>::default();
        prom.register(
            "reconcile_failures",
            "Count of reconciliations that failed and were requeued",
            failures.clone(),
        );

        let timeouts = Family::<KindLabels, Counter>::default();
        prom.register(
            "reconcile_timeouts",
            "Count of reconciliations that did not complete in time",
            timeouts.clone(),
        );

        Self {
            reconciles,
            failures,
            timeouts,
        }
    }

    pub(crate) fn reconciled(&self, kind: &'static str) {
        self.reconciles.get_or_create(&KindLabels { kind }).inc();
    }

    pub(crate) fn failed(&self, kind: &'static str) {
        self.failures.get_or_create(&KindLabels { kind }).inc();
    }

    pub(crate) fn timed_out(&self, kind: &'static str) {
        self.timeouts.get_or_create(&KindLabels { kind }).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_kind() {
        let mut prom = Registry::default();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("exposure"));
        metrics.reconciled("exposure");
        metrics.reconciled("exposure");
        metrics.failed("ingress");

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &prom).expect("must encode");
        assert!(text.contains(r#"exposure_reconcile_total{kind="exposure"} 2"#));
        assert!(text.contains(r#"exposure_reconcile_failures_total{kind="ingress"} 1"#));
        assert!(!text.contains("reconcile_timeouts_total{"));
    }
}
