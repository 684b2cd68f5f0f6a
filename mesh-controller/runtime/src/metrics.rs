use crate::PassOutcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    passes: Family<OutcomeLabels, Counter>,
    upstreams: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let passes = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "passes",
            "Total number of pod reconciliation passes by outcome",
            passes.clone(),
        );

        let upstreams = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "upstreams",
            "Total number of upstream bindings processed by outcome",
            upstreams.clone(),
        );

        Self { passes, upstreams }
    }

    pub fn record(&self, pass: &PassOutcome) {
        self.passes
            .get_or_create(&OutcomeLabels {
                outcome: pass.label(),
            })
            .inc();
        for (_, upstream) in pass.upstreams() {
            self.upstreams
                .get_or_create(&OutcomeLabels {
                    outcome: upstream.label(),
                })
                .inc();
        }
    }
}
