use super::{Factory, Getter, MemoryCache};
use crate::disk::DiskCache;
use std::{sync::Arc, time::Duration};

/// Default number of workers serving on-demand requests.
pub const DEFAULT_ON_DEMAND_WORKERS: usize = 100;

/// Default number of workers serving prefetch requests.
pub const DEFAULT_PREFETCH_WORKERS: usize = 2;

/// Default number of outstanding signals each lane can hold.
pub const DEFAULT_LANE_CAPACITY: usize = 1 << 20;

/// Default period over which each prefetch worker is handed one throttled request.
pub const DEFAULT_THROTTLE_PERIOD: Duration = Duration::from_secs(1);

/// Configuration for [super::Retriever].
pub struct Config<G: Getter, D: DiskCache> {
    /// Number of workers serving requests at or above [crate::ON_DEMAND_PRIORITY].
    pub on_demand_workers: usize,

    /// Number of workers serving requests below [crate::ON_DEMAND_PRIORITY].
    ///
    /// If zero, prefetch requests are only served once escalated.
    pub prefetch_workers: usize,

    /// Maximum number of outstanding worker signals per lane.
    ///
    /// Must exceed the number of retrievals that can ever be outstanding at once (exceeding it
    /// is a fatal error).
    pub lane_capacity: usize,

    /// Period over which each prefetch worker is handed one request at or below
    /// [crate::THROTTLE_PRIORITY].
    ///
    /// Throttled requests are released one at a time, every `throttle_period / prefetch_workers`.
    /// A zero period releases them as soon as they are queued. Ignored without prefetch workers.
    pub throttle_period: Duration,

    /// Newest block format that can be decoded.
    pub max_data_version: u32,

    /// First-level cache of decrypted blocks.
    pub memory: Arc<dyn MemoryCache>,

    /// Persistent cache of encrypted blocks, if any.
    pub disk: Option<D>,

    /// Fetches and decrypts blocks that aren't cached.
    pub getter: G,

    /// Builds the prefetcher (none are built if absent).
    pub prefetcher: Option<Arc<dyn Factory>>,
}
