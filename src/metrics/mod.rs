use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides metrics for:
// - Event appends and version conflicts, per backend
// - Grouped writes by outcome (committed / rolled_back / rollback_failed)
// - Snapshots written
// - Aggregate loads (events folded per load)
// - Aggregate ids poured to a message channel
//
// Metrics are optional everywhere: stores take an Arc<Metrics> through
// `with_metrics` and record nothing without one.
// ============================================================================

/// Central metrics registry for the event store
pub struct Metrics {
    registry: Registry,

    // Write Metrics
    pub events_appended: IntCounterVec,
    pub append_conflicts: IntCounterVec,
    pub event_groups: IntCounterVec,
    pub snapshots_written: IntCounterVec,

    // Read Metrics
    pub aggregate_loads: IntCounterVec,
    pub events_folded: HistogramVec,

    // Pour Metrics
    pub aggregate_ids_poured: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_appended = IntCounterVec::new(
            Opts::new("events_appended_total", "Total events appended"),
            &["backend"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let append_conflicts = IntCounterVec::new(
            Opts::new(
                "append_conflicts_total",
                "Appends rejected because the version already existed",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(append_conflicts.clone()))?;

        let event_groups = IntCounterVec::new(
            Opts::new("event_groups_total", "Grouped writes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(event_groups.clone()))?;

        let snapshots_written = IntCounterVec::new(
            Opts::new("snapshots_written_total", "Total snapshots written"),
            &["backend"],
        )?;
        registry.register(Box::new(snapshots_written.clone()))?;

        let aggregate_loads = IntCounterVec::new(
            Opts::new("aggregate_loads_total", "Aggregate reconstructions"),
            &["event_store_id", "from_snapshot"],
        )?;
        registry.register(Box::new(aggregate_loads.clone()))?;

        let events_folded = HistogramVec::new(
            HistogramOpts::new("aggregate_events_folded", "Events folded per aggregate load")
                .buckets(vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
            &["event_store_id"],
        )?;
        registry.register(Box::new(events_folded.clone()))?;

        let aggregate_ids_poured = IntCounterVec::new(
            Opts::new("aggregate_ids_poured_total", "Aggregate ids published by pour"),
            &["event_store_id"],
        )?;
        registry.register(Box::new(aggregate_ids_poured.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            append_conflicts,
            event_groups,
            snapshots_written,
            aggregate_loads,
            events_folded,
            aggregate_ids_poured,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format of every registered metric
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn record_event_appended(&self, backend: &str) {
        self.events_appended.with_label_values(&[backend]).inc();
    }

    pub fn record_append_conflict(&self, backend: &str) {
        self.append_conflicts.with_label_values(&[backend]).inc();
    }

    pub fn record_event_group(&self, outcome: &str) {
        self.event_groups.with_label_values(&[outcome]).inc();
    }

    pub fn record_snapshot_written(&self, backend: &str) {
        self.snapshots_written.with_label_values(&[backend]).inc();
    }

    /// Helper to record an aggregate reconstruction
    pub fn record_aggregate_load(
        &self,
        event_store_id: &str,
        from_snapshot: bool,
        events_folded: usize,
    ) {
        let from_snapshot = if from_snapshot { "true" } else { "false" };
        self.aggregate_loads
            .with_label_values(&[event_store_id, from_snapshot])
            .inc();
        self.events_folded
            .with_label_values(&[event_store_id])
            .observe(events_folded as f64);
    }

    pub fn record_aggregate_ids_poured(&self, event_store_id: &str, count: u64) {
        self.aggregate_ids_poured
            .with_label_values(&[event_store_id])
            .inc_by(count);
    }
}
