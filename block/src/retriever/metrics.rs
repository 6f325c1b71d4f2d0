//! Metrics for [super::Retriever].

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [super::Retriever].
#[derive(Default)]
pub struct Metrics {
    /// Requests received.
    pub requests: Counter,
    /// Requests merged into an in-flight retrieval.
    pub coalesced: Counter,
    /// Requests served by the memory or disk cache.
    pub cache_hits: Counter,
    /// Fetches started by workers.
    pub fetches: Counter,
    /// Retrievals finalized with an error.
    pub failures: Counter,
    /// Signals sent to on-demand workers.
    pub on_demand_signals: Counter,
    /// Signals sent to prefetch workers.
    pub prefetch_signals: Counter,
    /// Signals held back for throttled release.
    pub throttled_signals: Counter,
    /// Retrievals waiting for a worker.
    pub pending: Gauge,
    /// Running workers.
    pub workers: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given context.
    ///
    /// Metric names will be prefixed with the context's label.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("requests", "Requests received", metrics.requests.clone());
        context.register(
            "coalesced",
            "Requests merged into an in-flight retrieval",
            metrics.coalesced.clone(),
        );
        context.register(
            "cache_hits",
            "Requests served by the memory or disk cache",
            metrics.cache_hits.clone(),
        );
        context.register(
            "fetches",
            "Fetches started by workers",
            metrics.fetches.clone(),
        );
        context.register(
            "failures",
            "Retrievals finalized with an error",
            metrics.failures.clone(),
        );
        context.register(
            "on_demand_signals",
            "Signals sent to on-demand workers",
            metrics.on_demand_signals.clone(),
        );
        context.register(
            "prefetch_signals",
            "Signals sent to prefetch workers",
            metrics.prefetch_signals.clone(),
        );
        context.register(
            "throttled_signals",
            "Signals held back for throttled release",
            metrics.throttled_signals.clone(),
        );
        context.register(
            "pending",
            "Retrievals waiting for a worker",
            metrics.pending.clone(),
        );
        context.register("workers", "Running workers", metrics.workers.clone());
        metrics
    }
}
