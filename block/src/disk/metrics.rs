//! Metrics for [super::Cache].

use super::meter::Meter;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::gauge::Gauge;

/// Metrics for [super::Cache].
#[derive(Default)]
pub struct Metrics {
    /// Blocks found in the cache.
    pub hits: Meter,
    /// Blocks not found in the cache.
    pub misses: Meter,
    /// Blocks written to the cache.
    pub puts: Meter,
    /// Prefetch status updates.
    pub metadata_updates: Meter,
    /// Blocks removed to make room.
    pub evicted_blocks: Meter,
    /// Bytes removed to make room.
    pub evicted_bytes: Meter,
    /// Blocks removed on request.
    pub deleted_blocks: Meter,
    /// Bytes removed on request.
    pub deleted_bytes: Meter,
    /// Blocks currently cached.
    pub blocks: Gauge,
    /// Bytes currently cached.
    pub bytes: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given context.
    ///
    /// Metric names will be prefixed with the context's label.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("hits", "Blocks found in the cache", metrics.hits.counter());
        context.register(
            "misses",
            "Blocks not found in the cache",
            metrics.misses.counter(),
        );
        context.register("puts", "Blocks written to the cache", metrics.puts.counter());
        context.register(
            "metadata_updates",
            "Prefetch status updates",
            metrics.metadata_updates.counter(),
        );
        context.register(
            "evicted_blocks",
            "Blocks removed to make room",
            metrics.evicted_blocks.counter(),
        );
        context.register(
            "evicted_bytes",
            "Bytes removed to make room",
            metrics.evicted_bytes.counter(),
        );
        context.register(
            "deleted_blocks",
            "Blocks removed on request",
            metrics.deleted_blocks.counter(),
        );
        context.register(
            "deleted_bytes",
            "Bytes removed on request",
            metrics.deleted_bytes.counter(),
        );
        context.register("blocks", "Blocks currently cached", metrics.blocks.clone());
        context.register("bytes", "Bytes currently cached", metrics.bytes.clone());
        metrics
    }
}
