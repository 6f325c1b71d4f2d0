//! Persist encrypted blocks across restarts.
//!
//! [Cache] stores encrypted blocks (together with the server half of their key) in three ordered
//! key-value stores:
//!
//! * `blocks`: block id to encoded [metadata::Entry].
//! * `metadata`: block id to encoded [metadata::Metadata] (owning folder, encoded size, last access
//!   time, and prefetch progress).
//! * `tlfs`: `tlf || block id` to nothing, so that the blocks of a single folder can be scanned.
//!
//! Counts and sizes (per folder and in total) are kept in memory and rebuilt from the `metadata`
//! store whenever a [Cache] is created. Until that recount completes, every call fails with
//! [Error::Starting] ([DiskCache::wait_until_started] resolves once it is done).
//!
//! # Eviction
//!
//! Space is never checked locally. Each new block reserves its encoded size with a shared
//! [crate::limiter::Limiter]. A [Category::Sync] cache gives up with [Error::CacheFull] as soon as
//! a reservation fails. A [Category::WorkingSet] cache instead evicts a batch of blocks and tries
//! again (a bounded number of times).
//!
//! Eviction approximates LRU without maintaining a global ordering. Folders are visited in a
//! random order weighted by the number of blocks they hold. For each folder, a pivot is chosen at
//! random in the block id space (such that the scan is expected to find enough blocks) and a few
//! times the number of blocks to evict are read from the folder's index, starting at the pivot.
//! The least recently used candidates are deleted.
//!
//! Folders registered with [DiskCache::add_home_tlf] are only visited once the other folders could
//! not supply enough blocks (public home folders before private ones). Indexed blocks whose
//! metadata is missing or unreadable are removed whenever eviction comes across them.
//!
//! # Marks
//!
//! [DiskCache::mark] tags a block (without counting as an access) and
//! [DiskCache::delete_unmarked] removes every block of a folder that does not carry a given tag,
//! which lets a caller sweep blocks it no longer references.
//!
//! # Routing
//!
//! [dual::Dual] combines a working set cache with an optional sync cache and sends every block to
//! the right one based on a [SyncPolicy].
//!
//! # Example
//!
//! ```rust
//! use commonware_block::{
//!     disk::{Cache, Config, DiskCache, SyncedTlfs},
//!     limiter::{ByteLimiter, Category},
//!     store::Memory,
//!     BlockId, KeyHalf, PrefetchStatus, TlfId,
//! };
//! use commonware_runtime::{deterministic, Runner};
//! use std::sync::Arc;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let cache = Cache::new(context, Config::new(
//!         Category::WorkingSet,
//!         Arc::new(SyncedTlfs::default()),
//!         Arc::new(ByteLimiter::new(0, 1 << 20)),
//!         Memory::new(),
//!         Memory::new(),
//!         Memory::new(),
//!     ));
//!     cache.wait_until_started().await.unwrap();
//!
//!     let tlf = TlfId::new([1; 16]);
//!     let id = BlockId::new([2; 32]);
//!     cache.put(&tlf, &id, b"encrypted", &KeyHalf::default()).await.unwrap();
//!     let (payload, _, status) = cache.get(&tlf, &id).await.unwrap();
//!     assert_eq!(payload, b"encrypted");
//!     assert_eq!(status, PrefetchStatus::None);
//!
//!     cache.shutdown().await;
//! });
//! ```

use crate::{
    limiter::{self, Category, Limiter},
    store, BlockId, KeyHalf, PrefetchStatus, TlfId,
};
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::{Arc, RwLock},
};
use thiserror::Error;

mod cache;
pub use cache::Cache;
pub mod dual;
pub mod metadata;
pub mod meter;
mod metrics;

use meter::MeterStatus;
use metadata::Metadata;

/// Default number of blocks removed by each eviction.
pub const DEFAULT_EVICTION_BATCH: usize = 10;

/// Default number of evictions a single put may trigger before giving up.
pub const DEFAULT_MAX_EVICTION_ROUNDS: usize = 4;

/// Default number of candidates considered for each block evicted.
pub const DEFAULT_EVICTION_OVERSAMPLE: usize = 3;

/// Default number of index entries checked per [DiskCache::delete_unmarked] batch.
pub const DEFAULT_UNMARKED_BATCH: usize = 1_000;

/// Errors that can occur when interacting with a [DiskCache].
#[derive(Debug, Error)]
pub enum Error {
    #[error("block not found: {0}")]
    NotFound(BlockId),
    #[error("cache full: {0}")]
    CacheFull(BlockId),
    #[error("cache starting")]
    Starting,
    #[error("cache closed")]
    Closed,
    #[error("tlf not synced: {0}")]
    NotSynced(TlfId),
    #[error("tlf synced: {0}")]
    Synced(TlfId),
    #[error("nothing to evict")]
    NothingToEvict,
    #[error("cache empty")]
    Empty,
    #[error("no sync cache")]
    NoSyncCache,
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("limiter error: {0}")]
    Limiter(#[from] limiter::Error),
}

/// Decides which folders must remain available locally.
pub trait SyncPolicy: Send + Sync {
    /// Whether blocks of `tlf` belong in the sync cache.
    fn is_synced(&self, tlf: &TlfId) -> bool;
}

/// A [SyncPolicy] backed by an explicit set of folders.
#[derive(Default)]
pub struct SyncedTlfs {
    tlfs: RwLock<HashSet<TlfId>>,
}

impl SyncedTlfs {
    /// Mark `tlf` as synced.
    pub fn enable(&self, tlf: TlfId) {
        self.tlfs.write().unwrap().insert(tlf);
    }

    /// Mark `tlf` as no longer synced.
    pub fn disable(&self, tlf: &TlfId) {
        self.tlfs.write().unwrap().remove(tlf);
    }
}

impl SyncPolicy for SyncedTlfs {
    fn is_synced(&self, tlf: &TlfId) -> bool {
        self.tlfs.read().unwrap().contains(tlf)
    }
}

/// Order in which folders give up blocks during eviction.
///
/// Folders of a lower priority are evicted from first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvictionPriority {
    #[default]
    NotHome,
    PublicHome,
    PrivateHome,
}

/// Progress of a [Cache]'s startup recount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartState {
    #[default]
    Starting,
    Started,
    Failed,
}

/// Snapshot of a single cache returned by [DiskCache::status].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    pub state: StartState,
    pub blocks: u64,
    pub bytes: u64,
    /// Byte budget reported by the limiter.
    pub limit: u64,
    pub hits: MeterStatus,
    pub misses: MeterStatus,
    pub puts: MeterStatus,
    pub metadata_updates: MeterStatus,
    pub evicted_blocks: MeterStatus,
    pub evicted_bytes: MeterStatus,
    pub deleted_blocks: MeterStatus,
    pub deleted_bytes: MeterStatus,
}

/// Configuration for [Cache].
pub struct Config<S: store::Store> {
    /// Budget the cache draws from (and the placement rule it enforces).
    pub category: Category,

    /// Decides which folders belong in the sync cache.
    pub policy: Arc<dyn SyncPolicy>,

    /// Shared byte budget.
    pub limiter: Arc<dyn Limiter>,

    /// Store holding encrypted blocks.
    pub blocks: S,

    /// Store holding per-block metadata.
    pub metadata: S,

    /// Store indexing blocks by folder.
    pub tlfs: S,

    /// Number of blocks removed by each eviction.
    pub eviction_batch: usize,

    /// Number of evictions a single put may trigger before failing with [Error::CacheFull].
    pub max_eviction_rounds: usize,

    /// Number of candidates considered for each block evicted.
    pub eviction_oversample: usize,

    /// Number of index entries checked per [DiskCache::delete_unmarked] batch.
    pub unmarked_batch: usize,
}

impl<S: store::Store> Config<S> {
    /// Create a configuration with the default eviction parameters.
    pub fn new(
        category: Category,
        policy: Arc<dyn SyncPolicy>,
        limiter: Arc<dyn Limiter>,
        blocks: S,
        metadata: S,
        tlfs: S,
    ) -> Self {
        Self {
            category,
            policy,
            limiter,
            blocks,
            metadata,
            tlfs,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            max_eviction_rounds: DEFAULT_MAX_EVICTION_ROUNDS,
            eviction_oversample: DEFAULT_EVICTION_OVERSAMPLE,
            unmarked_batch: DEFAULT_UNMARKED_BATCH,
        }
    }
}

/// A persistent cache of encrypted blocks.
pub trait DiskCache: Clone + Send + Sync + 'static {
    /// Get a block's payload, key half, and prefetch status.
    fn get(
        &self,
        tlf: &TlfId,
        id: &BlockId,
    ) -> impl Future<Output = Result<(Vec<u8>, KeyHalf, PrefetchStatus), Error>> + Send;

    /// Get a block's metadata without refreshing its last access time.
    fn get_metadata(&self, id: &BlockId) -> impl Future<Output = Result<Metadata, Error>> + Send;

    /// Store a block.
    fn put(
        &self,
        tlf: &TlfId,
        id: &BlockId,
        payload: &[u8],
        half: &KeyHalf,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove blocks, returning the number of blocks and bytes removed.
    ///
    /// Blocks that are not stored are skipped.
    fn delete(&self, ids: &[BlockId]) -> impl Future<Output = Result<(usize, u64), Error>> + Send;

    /// Overwrite a block's prefetch status.
    fn update_metadata(
        &self,
        id: &BlockId,
        status: PrefetchStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Tag a block without refreshing its last access time.
    fn mark(&self, id: &BlockId, tag: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove every block of `tlf` whose tag is not `tag`, returning the number of blocks and
    /// bytes removed.
    fn delete_unmarked(
        &self,
        tlf: &TlfId,
        tag: &str,
    ) -> impl Future<Output = Result<(usize, u64), Error>> + Send;

    /// The last unreferenced revision stored for `tlf`.
    fn last_unref_rev(
        &self,
        tlf: &TlfId,
    ) -> impl Future<Output = Result<Option<u64>, Error>> + Send;

    /// Store `rev` as the last unreferenced revision of `tlf`, unless a later one is stored.
    fn put_last_unref_rev(
        &self,
        tlf: &TlfId,
        rev: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Protect the blocks of `tlf` from eviction according to `priority`.
    fn add_home_tlf(
        &self,
        tlf: TlfId,
        priority: EvictionPriority,
    ) -> impl Future<Output = ()> + Send;

    /// Reset every folder to [EvictionPriority::NotHome].
    fn clear_home_tlfs(&self) -> impl Future<Output = ()> + Send;

    /// Snapshot each underlying cache, keyed by name.
    fn status(&self) -> impl Future<Output = BTreeMap<String, Status>> + Send;

    /// Resolves once the cache is ready to serve requests.
    fn wait_until_started(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release the underlying stores. Subsequent calls fail with [Error::Closed].
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}
