//! Coalesce concurrent block requests and serve them from a bounded pool of workers.
//!
//! [Retriever::request] first consults the [MemoryCache] and then the [crate::disk::DiskCache].
//! If neither holds the block, the request joins any in-flight retrieval of the same block (and
//! destination kind) or creates a new one. Outstanding retrievals wait in a priority heap (highest
//! priority first, FIFO within a priority) until a worker claims them.
//!
//! # Lanes
//!
//! Workers are split into two lanes: on-demand workers serve retrievals at or above
//! [crate::ON_DEMAND_PRIORITY] and prefetch workers serve everything below it. Each new retrieval
//! sends a single signal to the lane matching its priority. A worker that receives a signal pops
//! whatever retrieval is at the top of the heap at that moment (not necessarily the one that sent
//! the signal), so retrievals stay in the heap (and can be escalated or joined) until the last
//! possible moment. When a queued retrieval is escalated across [crate::ON_DEMAND_PRIORITY], an
//! extra signal is sent to the on-demand lane.
//!
//! Signals for retrievals at or below [crate::THROTTLE_PRIORITY] are held in a throttled lane
//! (when there are prefetch workers) and released to the prefetch lane one at a time, every
//! [Config::throttle_period] divided by the number of prefetch workers. A queued retrieval
//! escalated above [crate::THROTTLE_PRIORITY] is signaled again on its new lane.
//!
//! # Cancellation
//!
//! Each [Retrieval] holds an [crate::cancel::Interest] in its retrieval. Dropping it (or calling
//! [Retrieval::cancel]) withdraws that caller. A fetch is only abandoned once every caller has
//! withdrawn.
//!
//! # Example
//!
//! ```rust
//! use commonware_block::{
//!     disk::Cache,
//!     retriever::{
//!         mocks::{Data, Folder, Getter, Memory},
//!         Config, Retriever, DEFAULT_THROTTLE_PERIOD,
//!     },
//!     store, BlockId, BlockPointer, CacheLifetime, ON_DEMAND_PRIORITY,
//! };
//! use commonware_runtime::{deterministic, Runner};
//! use std::sync::Arc;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let getter = Getter::new();
//!     let id = BlockId::new([1; 32]);
//!     getter.insert(id, b"hello".to_vec());
//!
//!     let retriever: Retriever<_, _, Cache<deterministic::Context, store::Memory>> =
//!         Retriever::new(context, Config {
//!             on_demand_workers: 1,
//!             prefetch_workers: 1,
//!             lane_capacity: 1_024,
//!             throttle_period: DEFAULT_THROTTLE_PERIOD,
//!             max_data_version: 1,
//!             memory: Arc::new(Memory::default()),
//!             disk: None,
//!             getter,
//!             prefetcher: None,
//!         });
//!
//!     let block = retriever
//!         .request(
//!             ON_DEMAND_PRIORITY,
//!             Arc::new(Folder::default()),
//!             BlockPointer::new(id, 1),
//!             Box::new(Data::default()),
//!             CacheLifetime::Transient,
//!         )
//!         .await
//!         .await
//!         .unwrap();
//!     assert_eq!(Data::contents(block.as_ref()).unwrap(), b"hello");
//! });
//! ```

use crate::{
    cancel::Interest, disk, Block, BlockId, BlockPointer, CacheLifetime, KeyHalf, KeyMetadata,
    PrefetchStatus, TlfId,
};
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;

mod config;
pub use config::{
    Config, DEFAULT_LANE_CAPACITY, DEFAULT_ON_DEMAND_WORKERS, DEFAULT_PREFETCH_WORKERS,
    DEFAULT_THROTTLE_PERIOD,
};
mod metrics;
pub mod mocks;
mod queue;
pub use queue::Retriever;
mod worker;

/// Errors that can be returned by a [Retrieval].
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("retriever shut down")]
    Shutdown,
    #[error("retrieval canceled")]
    Canceled,
    #[error("unsupported data version {version} for block {id}")]
    NewDataVersion { id: BlockId, version: u32 },
    #[error("cache full")]
    CacheFull,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("disk cache error: {0}")]
    Disk(Arc<disk::Error>),
}

impl From<disk::Error> for Error {
    fn from(err: disk::Error) -> Self {
        Self::Disk(Arc::new(err))
    }
}

/// A one-shot notification that can be awaited by many.
pub type Signal = Shared<oneshot::Receiver<()>>;

/// Resolves once a component has finished all outstanding work.
pub type Drained = Signal;

/// A [Signal] that has already fired.
pub fn fired() -> Signal {
    let (sender, receiver) = oneshot::channel();
    let _ = sender.send(());
    receiver.shared()
}

/// Fetches blocks that are not cached locally.
pub trait Getter: Clone + Send + Sync + 'static {
    /// Fetch and decrypt the block referenced by `ptr` into `block`.
    fn fetch(
        &self,
        kmd: &Arc<dyn KeyMetadata>,
        ptr: &BlockPointer,
        block: &mut dyn Block,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Decrypt an encrypted `payload` (read from the disk cache) into `block`.
    fn assemble(
        &self,
        kmd: &Arc<dyn KeyMetadata>,
        ptr: &BlockPointer,
        block: &mut dyn Block,
        payload: &[u8],
        half: &KeyHalf,
    ) -> Result<(), Error>;
}

/// A first-level cache of decrypted blocks.
pub trait MemoryCache: Send + Sync {
    /// Get a copy of the cached block referenced by `ptr`.
    fn get(&self, ptr: &BlockPointer) -> Option<Box<dyn Block>>;

    /// Cache `block`.
    ///
    /// Returns [Error::CacheFull] if there is no room.
    fn put(
        &self,
        ptr: &BlockPointer,
        tlf: &TlfId,
        block: &dyn Block,
        lifetime: CacheLifetime,
    ) -> Result<(), Error>;
}

/// Reads ahead the descendants of retrieved blocks.
pub trait Prefetcher: Send + Sync {
    /// Consider prefetching the descendants of a retrieved block.
    fn process_block(
        &self,
        ptr: &BlockPointer,
        block: &dyn Block,
        kmd: &Arc<dyn KeyMetadata>,
        priority: u32,
        lifetime: CacheLifetime,
        status: PrefetchStatus,
    );

    /// Stop tracking a block that could not be retrieved.
    fn cancel(&self, ptr: &BlockPointer);

    /// Stop accepting work.
    fn shutdown(&self) -> Drained;
}

/// Builds fresh [Prefetcher]s (whenever prefetching is re-enabled).
pub trait Factory: Send + Sync {
    /// Create a [Prefetcher] that, if `sync` is provided, waits on it before each step.
    fn create(&self, sync: Option<Signal>) -> Arc<dyn Prefetcher>;
}

type Outcome = Result<Box<dyn Block>, Error>;

/// The pending result of [Retriever::request].
///
/// Resolves to the filled destination block. Dropping a [Retrieval] withdraws the caller's
/// interest in the block.
pub struct Retrieval {
    receiver: oneshot::Receiver<Outcome>,
    interest: Option<Interest>,
}

impl Retrieval {
    fn new(receiver: oneshot::Receiver<Outcome>, interest: Interest) -> Self {
        Self {
            receiver,
            interest: Some(interest),
        }
    }

    fn ready(outcome: Outcome) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        Self {
            receiver,
            interest: None,
        }
    }

    /// Withdraw interest in the block.
    pub fn cancel(self) {}
}

impl Future for Retrieval {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match self.receiver.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,

            // The retrieval was dropped without being finalized
            Poll::Ready(Err(_)) => Err(Error::Shutdown),
        };
        self.interest = None;
        Poll::Ready(outcome)
    }
}
