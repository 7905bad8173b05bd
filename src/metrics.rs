use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::index::MembershipIndex;

/// Prometheus metrics for grouping sessions.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    index: IndexMetrics,
    gateway: GatewayMetrics,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("metric_groups".into()), None)?);

        let index = IndexMetrics::register(&registry)?;
        let gateway = GatewayMetrics::register(&registry)?;

        Ok(Self {
            registry,
            index,
            gateway,
        })
    }

    /// Record a rebuild and publish the resulting group sizes.
    pub fn observe_rebuild(&self, index: &MembershipIndex, elapsed: Duration) {
        self.index.rebuild_seconds.observe(elapsed.as_secs_f64());
        self.index.groups.set(index.groups().len() as i64);
        self.index.ungrouped.set(index.ungrouped_count() as i64);

        // Deleted or renamed groups must not linger as stale series.
        self.index.resolved_members.reset();
        for group in index.groups() {
            self.index
                .resolved_members
                .with_label_values(&[group.name.as_str()])
                .set(group.union.len() as i64);
        }
    }

    /// Record the outcome and latency of one gateway request.
    pub fn observe_request(&self, op: &str, elapsed: Duration, success: bool) {
        self.gateway
            .request_seconds
            .with_label_values(&[op])
            .observe(elapsed.as_secs_f64());
        let outcome = if success { "ok" } else { "error" };
        self.gateway
            .requests_total
            .with_label_values(&[op, outcome])
            .inc();
    }

    pub fn inc_superseded(&self) {
        self.gateway.superseded_total.inc();
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct IndexMetrics {
    rebuild_seconds: Histogram,
    groups: IntGauge,
    resolved_members: IntGaugeVec,
    ungrouped: IntGauge,
}

impl IndexMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let rebuild_seconds = Histogram::with_opts(
            HistogramOpts::new("index_rebuild_seconds", "Membership index rebuild duration")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(rebuild_seconds.clone()))?;

        let groups = IntGauge::with_opts(Opts::new("index_groups", "Groups in the registry"))?;
        registry.register(Box::new(groups.clone()))?;

        let resolved_members = IntGaugeVec::new(
            Opts::new(
                "index_resolved_members",
                "Resolved (manual or rule matched) members per group",
            ),
            &["group"],
        )?;
        registry.register(Box::new(resolved_members.clone()))?;

        let ungrouped = IntGauge::with_opts(Opts::new(
            "ungrouped_metrics",
            "Catalog metrics that belong to no group",
        ))?;
        registry.register(Box::new(ungrouped.clone()))?;

        Ok(Self {
            rebuild_seconds,
            groups,
            resolved_members,
            ungrouped,
        })
    }
}

#[derive(Clone)]
struct GatewayMetrics {
    requests_total: IntCounterVec,
    request_seconds: HistogramVec,
    superseded_total: IntCounter,
}

impl GatewayMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Grouping API requests by outcome"),
            &["op", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_request_seconds", "Grouping API request latency"),
            &["op"],
        )?;
        registry.register(Box::new(request_seconds.clone()))?;

        let superseded_total = IntCounter::with_opts(Opts::new(
            "saves_superseded_total",
            "Save results discarded because a newer save was issued",
        ))?;
        registry.register(Box::new(superseded_total.clone()))?;

        Ok(Self {
            requests_total,
            request_seconds,
            superseded_total,
        })
    }
}
