//! Request coalescing and the worker lanes that drain the retrieval heap.

use super::{
    fired, metrics::Metrics, worker::Worker, Config, Drained, Error, Factory, Getter, MemoryCache,
    Outcome, Prefetcher, Retrieval, Signal,
};
use crate::{
    cancel::Token, disk, disk::DiskCache, heap::Heap, kind, Block, BlockId, BlockPointer,
    CacheLifetime, KeyMetadata, PrefetchStatus, TlfId, ON_DEMAND_PRIORITY, THROTTLE_PRIORITY,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::{join_all, FutureExt},
    StreamExt,
};
use std::{
    any::TypeId,
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// Maximum number of prefetch statuses remembered when there is no disk cache.
const MAX_STATUSES: usize = 10_000;

/// Position of a retrieval in the heap.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Rank {
    priority: u32,
    seq: u64,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier insertions win ties
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A caller waiting on a retrieval.
struct Waiter {
    block: Box<dyn Block>,
    sender: oneshot::Sender<Outcome>,
}

/// Fields of a [Record] that change while callers join.
struct Pending {
    priority: u32,
    lifetime: CacheLifetime,
    waiters: Vec<Waiter>,
}

/// A single retrieval, shared by every caller requesting the same block (and kind).
pub(super) struct Record {
    seq: u64,
    ptr: BlockPointer,
    kind: TypeId,
    kmd: Arc<dyn KeyMetadata>,
    token: Token,
    pending: Mutex<Pending>,
}

impl Record {
    pub(super) fn token(&self) -> &Token {
        &self.token
    }

    pub(super) fn ptr(&self) -> &BlockPointer {
        &self.ptr
    }

    pub(super) fn kmd(&self) -> &Arc<dyn KeyMetadata> {
        &self.kmd
    }

    /// Allocate an empty block of the kind requested by the first caller.
    pub(super) fn new_empty(&self) -> Option<Box<dyn Block>> {
        let pending = self.pending.lock().unwrap();
        pending.waiters.first().map(|waiter| waiter.block.new_empty())
    }
}

/// Prefetch statuses of recently retrieved blocks.
#[derive(Default)]
struct Statuses {
    statuses: HashMap<BlockId, PrefetchStatus>,
    order: VecDeque<BlockId>,
}

impl Statuses {
    fn get(&self, id: &BlockId) -> PrefetchStatus {
        self.statuses.get(id).copied().unwrap_or_default()
    }

    /// Record `status` unless a more advanced status is already known.
    fn raise(&mut self, id: BlockId, status: PrefetchStatus) {
        if let Some(existing) = self.statuses.get_mut(&id) {
            *existing = (*existing).max(status);
            return;
        }
        if self.statuses.len() >= MAX_STATUSES {
            if let Some(oldest) = self.order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
        self.statuses.insert(id, status);
        self.order.push_back(id);
    }
}

/// Worker lane a signal is sent on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lane {
    OnDemand,
    Prefetch,
    Throttled,
}

struct State {
    lookup: HashMap<(BlockPointer, TypeId), Arc<Record>>,
    queued: HashMap<u64, Arc<Record>>,
    heap: Heap<u64, Rank>,
    next: u64,
    on_demand: mpsc::Sender<()>,
    prefetch: mpsc::Sender<()>,
    throttled: Option<mpsc::Sender<()>>,
    shutdown: Option<Drained>,
}

impl State {
    /// The lane serving retrievals of `priority`.
    fn lane(&self, priority: u32) -> Lane {
        if priority >= ON_DEMAND_PRIORITY {
            Lane::OnDemand
        } else if priority <= THROTTLE_PRIORITY && self.throttled.is_some() {
            Lane::Throttled
        } else {
            Lane::Prefetch
        }
    }

    fn pop(&mut self) -> Option<Arc<Record>> {
        let (seq, _) = self.heap.pop()?;
        self.queued.remove(&seq)
    }
}

#[derive(Default)]
struct Workers {
    stops: Vec<oneshot::Sender<()>>,
    handles: Vec<Handle<()>>,
}

struct Inner<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> {
    context: E,
    getter: G,
    memory: Arc<dyn MemoryCache>,
    disk: Option<D>,
    max_data_version: u32,
    factory: Option<Arc<dyn Factory>>,

    state: RwLock<State>,
    prefetcher: RwLock<Option<Arc<dyn Prefetcher>>>,
    statuses: Mutex<Statuses>,
    workers: Mutex<Workers>,

    metrics: Metrics,
}

/// Coalesces block requests and serves them from a pool of workers.
pub struct Retriever<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> {
    inner: Arc<Inner<E, G, D>>,
}

impl<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> Clone for Retriever<E, G, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> Retriever<E, G, D> {
    /// Create a new [Retriever] and start its workers.
    pub fn new(context: E, cfg: Config<G, D>) -> Self {
        let metrics = Metrics::init(&context);
        let (on_demand, on_demand_lane) = mpsc::channel(cfg.lane_capacity);
        let (prefetch, prefetch_lane) = mpsc::channel(cfg.lane_capacity);
        let (throttled, throttled_lane) = if cfg.prefetch_workers > 0 {
            let (sender, receiver) = mpsc::channel(cfg.lane_capacity);
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        let prefetcher = cfg.prefetcher.as_ref().map(|factory| factory.create(None));
        let retriever = Self {
            inner: Arc::new(Inner {
                context: context.clone(),
                getter: cfg.getter,
                memory: cfg.memory,
                disk: cfg.disk,
                max_data_version: cfg.max_data_version,
                factory: cfg.prefetcher,
                state: RwLock::new(State {
                    lookup: HashMap::new(),
                    queued: HashMap::new(),
                    heap: Heap::new(),
                    next: 0,
                    on_demand,
                    prefetch,
                    throttled,
                    shutdown: None,
                }),
                prefetcher: RwLock::new(prefetcher),
                statuses: Mutex::new(Statuses::default()),
                workers: Mutex::new(Workers::default()),
                metrics,
            }),
        };

        // Start workers
        let mut workers = Workers::default();
        for (label, lane, count) in [
            ("on_demand", on_demand_lane, cfg.on_demand_workers),
            ("prefetch", prefetch_lane, cfg.prefetch_workers),
        ] {
            let lane = Arc::new(async_lock::Mutex::new(lane));
            for _ in 0..count {
                let (stop, stopped) = oneshot::channel();
                let worker = Worker::new(retriever.clone(), lane.clone(), stopped);
                workers.stops.push(stop);
                workers
                    .handles
                    .push(context.with_label(label).spawn(move |_| worker.run()));
            }
        }
        if let Some(lane) = throttled_lane {
            let workers_count = u32::try_from(cfg.prefetch_workers).unwrap_or(u32::MAX);
            let period = cfg.throttle_period / workers_count;
            let (stop, stopped) = oneshot::channel();
            let releaser = retriever.clone();
            workers.stops.push(stop);
            workers.handles.push(context.with_label("throttle").spawn(move |context| {
                releaser.release_throttled(context, lane, period, stopped)
            }));
        }
        debug!(
            on_demand = cfg.on_demand_workers,
            prefetch = cfg.prefetch_workers,
            throttle_period = ?cfg.throttle_period,
            "started workers"
        );
        *retriever.inner.workers.lock().unwrap() = workers;
        retriever
    }

    /// Request the block referenced by `ptr`, to be copied into `block`.
    ///
    /// Requests for the same pointer and destination kind are coalesced into a single fetch. The
    /// returned [Retrieval] resolves once the block is available (or the retrieval fails).
    pub async fn request(
        &self,
        priority: u32,
        kmd: Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        mut block: Box<dyn Block>,
        lifetime: CacheLifetime,
    ) -> Retrieval {
        self.inner.metrics.requests.inc();
        if self.inner.state.read().unwrap().shutdown.is_some() {
            self.cancel_prefetch(&ptr);
            return Retrieval::ready(Err(Error::Shutdown));
        }

        // Serve from caches, if possible
        if let Some(status) = self.check_caches(&kmd, &ptr, block.as_mut()).await {
            trace!(id = ?ptr.id, ?status, "found block in caches");
            self.inner.metrics.cache_hits.inc();
            if let Some(prefetcher) = self.prefetcher() {
                prefetcher.process_block(&ptr, block.as_ref(), &kmd, priority, lifetime, status);
            }
            return Retrieval::ready(Ok(block));
        }
        if ptr.data_version > self.inner.max_data_version {
            self.cancel_prefetch(&ptr);
            return Retrieval::ready(Err(Error::NewDataVersion {
                id: ptr.id,
                version: ptr.data_version,
            }));
        }

        // Join (or create) the retrieval
        let key = (ptr, kind(block.as_ref()));
        let (sender, receiver) = oneshot::channel();
        let (retrieval, drained) = {
            let mut state = self.inner.state.write().unwrap();
            let (record, interest, created) = loop {
                let existing = state.lookup.get(&key).cloned();
                match existing {
                    Some(record) => match record.token.join() {
                        Some(interest) => {
                            self.inner.metrics.coalesced.inc();
                            break (record, interest, false);
                        }
                        None => {
                            // Every previous caller gave up, the stale retrieval finishes alone
                            state.lookup.remove(&key);
                        }
                    },
                    None => {
                        let seq = state.next;
                        state.next += 1;
                        let (token, interest) = Token::new();
                        let record = Arc::new(Record {
                            seq,
                            ptr,
                            kind: key.1,
                            kmd: kmd.clone(),
                            token,
                            pending: Mutex::new(Pending {
                                priority,
                                lifetime,
                                waiters: Vec::new(),
                            }),
                        });
                        state.lookup.insert(key, record.clone());
                        state.queued.insert(seq, record.clone());
                        state.heap.push(seq, Rank { priority, seq });
                        self.inner.metrics.pending.set(state.heap.len() as i64);
                        debug!(id = ?ptr.id, priority, "scheduled retrieval");
                        break (record, interest, true);
                    }
                }
            };

            // Register the caller
            let previous = {
                let mut pending = record.pending.lock().unwrap();
                pending.waiters.push(Waiter { block, sender });
                pending.lifetime = pending.lifetime.max(lifetime);
                let previous = pending.priority;
                if priority > previous {
                    pending.priority = priority;
                }
                previous
            };

            // Wake a worker for new retrievals (and for retrievals that just became urgent)
            let mut drained = None;
            if created {
                drained = self.notify_worker(&mut state, priority);
            } else if priority > previous
                && state
                    .heap
                    .fix(
                        &record.seq,
                        Rank {
                            priority,
                            seq: record.seq,
                        },
                    )
                    .is_ok()
                && state.lane(previous) != state.lane(priority)
            {
                trace!(id = ?ptr.id, from = previous, to = priority, "escalated retrieval");
                drained = self.notify_worker(&mut state, priority);
            }
            (Retrieval::new(receiver, interest), drained)
        };
        if let Some(record) = drained {
            self.finalize(&record, Err(Error::Shutdown)).await;
        }
        retrieval
    }

    /// Copy a cached block into `block`, returning its prefetch status.
    async fn check_caches(
        &self,
        kmd: &Arc<dyn KeyMetadata>,
        ptr: &BlockPointer,
        block: &mut dyn Block,
    ) -> Option<PrefetchStatus> {
        if let Some(cached) = self.inner.memory.get(ptr) {
            let Some(disk) = &self.inner.disk else {
                block.set(cached.as_ref());
                return Some(self.inner.statuses.lock().unwrap().get(&ptr.id));
            };
            if let Ok(metadata) = disk.get_metadata(&ptr.id).await {
                block.set(cached.as_ref());
                return Some(metadata.status());
            }

            // Read the full block so that it is refreshed in the disk cache
        }
        let disk = self.inner.disk.as_ref()?;
        let tlf = kmd.tlf();
        let (payload, half, status) = disk.get(&tlf, &ptr.id).await.ok()?;
        if payload.is_empty() {
            return None;
        }
        if let Err(err) = self.inner.getter.assemble(kmd, ptr, block, &payload, &half) {
            warn!(?err, id = ?ptr.id, "failed to assemble cached block");
            return None;
        }
        let _ = self
            .inner
            .memory
            .put(ptr, &tlf, block, CacheLifetime::Transient);
        Some(status)
    }

    /// Signal a worker on the lane serving `priority`.
    fn notify_worker(&self, state: &mut State, priority: u32) -> Option<Arc<Record>> {
        let lane = state.lane(priority);
        self.signal(state, lane)
    }

    /// Send a single signal on `lane`.
    ///
    /// After shutdown, no worker is left to answer. Instead, the next queued retrieval is
    /// dequeued and returned (to be finalized by the caller once the state lock is released).
    fn signal(&self, state: &mut State, lane: Lane) -> Option<Arc<Record>> {
        if state.shutdown.is_some() {
            let record = state.pop();
            self.inner.metrics.pending.set(state.heap.len() as i64);
            return record;
        }
        let metrics = &self.inner.metrics;
        let (sender, signals) = match lane {
            Lane::OnDemand => (&mut state.on_demand, &metrics.on_demand_signals),
            Lane::Prefetch => (&mut state.prefetch, &metrics.prefetch_signals),
            Lane::Throttled => match state.throttled.as_mut() {
                Some(sender) => (sender, &metrics.throttled_signals),
                None => (&mut state.prefetch, &metrics.prefetch_signals),
            },
        };
        match sender.try_send(()) {
            Ok(()) => {
                signals.inc();
            }
            Err(err) if err.is_full() => {
                panic!("worker lane full ({lane:?})");
            }
            Err(_) => {
                trace!(?lane, "no workers for lane");
            }
        }
        None
    }

    /// Forward throttled signals to the prefetch lane, one every `period`, until stopped.
    async fn release_throttled(
        self,
        context: E,
        mut lane: mpsc::Receiver<()>,
        period: Duration,
        mut stopped: oneshot::Receiver<()>,
    ) {
        loop {
            if !period.is_zero() {
                select! {
                    _ = &mut stopped => {
                        break;
                    },
                    _ = context.sleep(period) => {},
                }
            }
            select! {
                _ = &mut stopped => {
                    break;
                },
                signal = lane.next() => {
                    if signal.is_none() {
                        break;
                    }
                },
            }
            let drained = {
                let mut state = self.inner.state.write().unwrap();
                self.signal(&mut state, Lane::Prefetch)
            };
            if let Some(record) = drained {
                self.finalize(&record, Err(Error::Shutdown)).await;
            }
        }
        debug!("throttled release stopped");
    }

    pub(super) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(super) fn getter(&self) -> &G {
        &self.inner.getter
    }

    /// Claim the highest-priority queued retrieval.
    pub(super) fn pop(&self) -> Option<Arc<Record>> {
        let mut state = self.inner.state.write().unwrap();
        let record = state.pop();
        self.inner.metrics.pending.set(state.heap.len() as i64);
        record
    }

    /// Complete a retrieval, delivering `outcome` to every caller.
    ///
    /// The retrieval no longer accepts new callers once this is called.
    pub(super) async fn finalize(&self, record: &Arc<Record>, outcome: Outcome) {
        {
            let mut state = self.inner.state.write().unwrap();
            let key = (record.ptr, record.kind);
            if state
                .lookup
                .get(&key)
                .is_some_and(|current| current.seq == record.seq)
            {
                state.lookup.remove(&key);
            }
        }
        let (priority, lifetime, waiters) = {
            let mut pending = record.pending.lock().unwrap();
            (
                pending.priority,
                pending.lifetime,
                std::mem::take(&mut pending.waiters),
            )
        };

        match outcome {
            Ok(block) => {
                let tlf = record.kmd.tlf();
                if let Err(err) = self
                    .put_in_caches(
                        &record.ptr,
                        &tlf,
                        block.as_ref(),
                        lifetime,
                        PrefetchStatus::None,
                    )
                    .await
                {
                    debug!(?err, id = ?record.ptr.id, "failed to cache block");
                }
                if let Some(prefetcher) = self.prefetcher() {
                    prefetcher.process_block(
                        &record.ptr,
                        block.as_ref(),
                        &record.kmd,
                        priority,
                        lifetime,
                        PrefetchStatus::None,
                    );
                }
                for waiter in waiters {
                    let mut destination = waiter.block;
                    destination.set(block.as_ref());
                    let _ = waiter.sender.send(Ok(destination));
                }
            }
            Err(err) => {
                debug!(?err, id = ?record.ptr.id, "retrieval failed");
                self.inner.metrics.failures.inc();
                self.cancel_prefetch(&record.ptr);
                for waiter in waiters {
                    let _ = waiter.sender.send(Err(err.clone()));
                }
            }
        }
    }

    /// Store a retrieved block in the memory cache and record its prefetch status.
    ///
    /// A full memory cache is not an error.
    pub async fn put_in_caches(
        &self,
        ptr: &BlockPointer,
        tlf: &TlfId,
        block: &dyn Block,
        lifetime: CacheLifetime,
        status: PrefetchStatus,
    ) -> Result<(), Error> {
        match self.inner.memory.put(ptr, tlf, block, lifetime) {
            Ok(()) | Err(Error::CacheFull) => {}
            Err(err) => return Err(err),
        }
        let Some(disk) = &self.inner.disk else {
            self.inner.statuses.lock().unwrap().raise(ptr.id, status);
            return Ok(());
        };
        match disk.update_metadata(&ptr.id, status).await {
            Ok(()) => Ok(()),
            Err(err @ disk::Error::NotFound(_)) => {
                debug!(id = ?ptr.id, "block missing for metadata update");
                Err(err.into())
            }
            Err(err) => {
                warn!(?err, id = ?ptr.id, "failed to update metadata");
                Err(err.into())
            }
        }
    }

    /// The current prefetcher, if enabled.
    pub fn prefetcher(&self) -> Option<Arc<dyn Prefetcher>> {
        self.inner.prefetcher.read().unwrap().clone()
    }

    fn cancel_prefetch(&self, ptr: &BlockPointer) {
        if let Some(prefetcher) = self.prefetcher() {
            prefetcher.cancel(ptr);
        }
    }

    /// Shut down the current prefetcher and, if `enable`, replace it with a fresh one.
    ///
    /// Returns a signal that fires once the previous prefetcher has drained.
    pub fn toggle_prefetcher(&self, enable: bool, sync: Option<Signal>) -> Drained {
        let mut slot = self.inner.prefetcher.write().unwrap();
        let drained = match slot.take() {
            Some(previous) => previous.shutdown(),
            None => fired(),
        };
        if enable {
            *slot = self
                .inner
                .factory
                .as_ref()
                .map(|factory| factory.create(sync));
        }
        debug!(enabled = slot.is_some(), "toggled prefetcher");
        drained
    }

    /// Stop accepting requests, fail all queued retrievals, and stop every worker.
    ///
    /// Returns a signal that fires once all workers have exited and the prefetcher has drained.
    /// Workers finish any fetch they have already started.
    pub async fn shutdown(&self) -> Drained {
        let (sender, receiver) = oneshot::channel();
        let drained = receiver.shared();
        let records = {
            let mut state = self.inner.state.write().unwrap();
            if let Some(drained) = &state.shutdown {
                warn!("retriever already shut down");
                return drained.clone();
            }
            state.shutdown = Some(drained.clone());
            let records: Vec<_> = std::iter::from_fn(|| state.pop()).collect();
            self.inner.metrics.pending.set(0);
            records
        };

        // Stop workers
        let workers = std::mem::take(&mut *self.inner.workers.lock().unwrap());
        for stop in workers.stops {
            let _ = stop.send(());
        }

        // Fail everything left
        debug!(queued = records.len(), "draining retrievals");
        for record in records {
            self.finalize(&record, Err(Error::Shutdown)).await;
        }

        // Wait for workers and the prefetcher
        let prefetcher = self.prefetcher().map(|prefetcher| prefetcher.shutdown());
        self.inner
            .context
            .with_label("shutdown")
            .spawn(move |_| async move {
                join_all(workers.handles).await;
                if let Some(prefetcher) = prefetcher {
                    let _ = prefetcher.await;
                }
                let _ = sender.send(());
            });
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk::{Cache, Config as DiskConfig, SyncedTlfs},
        limiter::{ByteLimiter, Category},
        retriever::mocks::{self, Data, Event, Folder, Indirect, Recorder},
        store::Memory,
        KeyHalf, PREFETCH_PRIORITY, THROTTLE_PRIORITY,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics, Runner};
    use std::time::Duration;

    type Disk = Cache<deterministic::Context, Memory>;

    struct Setup {
        retriever: Retriever<deterministic::Context, mocks::Getter, Disk>,
        getter: mocks::Getter,
        memory: Arc<mocks::Memory>,
        recorder: Arc<Recorder>,
    }

    fn setup(
        context: &deterministic::Context,
        label: &str,
        getter: mocks::Getter,
        disk: Option<Disk>,
        on_demand_workers: usize,
        prefetch_workers: usize,
    ) -> Setup {
        setup_throttled(
            context,
            label,
            getter,
            disk,
            on_demand_workers,
            prefetch_workers,
            Duration::ZERO,
        )
    }

    fn setup_throttled(
        context: &deterministic::Context,
        label: &str,
        getter: mocks::Getter,
        disk: Option<Disk>,
        on_demand_workers: usize,
        prefetch_workers: usize,
        throttle_period: Duration,
    ) -> Setup {
        let memory = Arc::new(mocks::Memory::default());
        let recorder = Arc::new(Recorder::default());
        let retriever = Retriever::new(
            context.with_label(label),
            Config {
                on_demand_workers,
                prefetch_workers,
                lane_capacity: 1_024,
                throttle_period,
                max_data_version: 1,
                memory: memory.clone(),
                disk,
                getter: getter.clone(),
                prefetcher: Some(recorder.clone()),
            },
        );
        Setup {
            retriever,
            getter,
            memory,
            recorder,
        }
    }

    fn folder(context: &mut deterministic::Context) -> Arc<dyn KeyMetadata> {
        Arc::new(Folder::new(TlfId::random(context)))
    }

    fn pointer(context: &mut deterministic::Context, getter: &mocks::Getter) -> BlockPointer {
        let id = BlockId::random(context);
        getter.insert(id, id.as_ref().to_vec());
        BlockPointer::new(id, 1)
    }

    async fn request(
        retriever: &Retriever<deterministic::Context, mocks::Getter, Disk>,
        priority: u32,
        kmd: &Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
    ) -> Retrieval {
        retriever
            .request(
                priority,
                kmd.clone(),
                ptr,
                Box::new(Data::default()),
                CacheLifetime::Transient,
            )
            .await
    }

    fn contents(outcome: Outcome) -> Vec<u8> {
        Data::contents(outcome.unwrap().as_ref()).unwrap()
    }

    #[test]
    fn test_rank_order() {
        let mut heap = Heap::new();
        for (seq, priority) in [(0, 5), (1, 20), (2, 20), (3, 1), (4, 5)] {
            heap.push(seq, Rank { priority, seq });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|(k, _)| k).collect();
        assert_eq!(order, vec![1, 2, 0, 4, 3]);
    }

    #[test]
    fn test_statuses_bounded() {
        let mut statuses = Statuses::default();
        let id = |i: u32| {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            BlockId::new(bytes)
        };
        statuses.raise(id(0), PrefetchStatus::Finished);
        statuses.raise(id(0), PrefetchStatus::Triggered);
        assert_eq!(statuses.get(&id(0)), PrefetchStatus::Finished);
        for i in 1..=MAX_STATUSES as u32 {
            statuses.raise(id(i), PrefetchStatus::Triggered);
        }
        assert_eq!(statuses.statuses.len(), MAX_STATUSES);
        assert_eq!(statuses.get(&id(0)), PrefetchStatus::None);
        assert_eq!(statuses.get(&id(1)), PrefetchStatus::Triggered);
    }

    #[test_traced]
    fn test_coalescing() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (getter, gate) = mocks::Getter::gated();
            let Setup {
                retriever,
                getter,
                memory,
                ..
            } = setup(&context, "retriever", getter, None, 2, 0);
            let kmd = folder(&mut context);
            let ptr = pointer(&mut context, &getter);

            let first = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            let second = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            context.sleep(Duration::from_millis(10)).await;
            let third = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;

            // A different destination kind is retrieved separately
            let indirect = retriever
                .request(
                    ON_DEMAND_PRIORITY,
                    kmd.clone(),
                    ptr,
                    Box::new(Indirect::default()),
                    CacheLifetime::Permanent,
                )
                .await;

            gate.send(()).unwrap();
            for retrieval in [first, second, third] {
                assert_eq!(contents(retrieval.await), ptr.id.as_ref());
            }
            let block = indirect.await.unwrap();
            assert_eq!(Indirect::contents(block.as_ref()).unwrap(), ptr.id.as_ref());
            assert_eq!(getter.fetched(), vec![ptr.id, ptr.id]);

            // Retrieved blocks are cached, so later requests don't fetch
            assert!(memory.contains(&ptr));
            let cached = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert_eq!(contents(cached.await), ptr.id.as_ref());
            assert_eq!(getter.fetched().len(), 2);

            let metrics = context.encode();
            assert!(metrics.contains("retriever_requests_total 5"));
            assert!(metrics.contains("retriever_coalesced_total 2"));
            assert!(metrics.contains("retriever_cache_hits_total 1"));
            assert!(metrics.contains("retriever_fetches_total 2"));
            assert!(metrics.contains("retriever_pending 0"));
            assert!(metrics.contains("retriever_workers 2"));
        });
    }

    #[test_traced]
    fn test_priority_order() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (getter, gate) = mocks::Getter::gated();
            let Setup {
                retriever, getter, ..
            } = setup(&context, "retriever", getter, None, 1, 0);
            let kmd = folder(&mut context);

            // Occupy the only worker
            let busy = pointer(&mut context, &getter);
            let busy_retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, busy).await;
            context.sleep(Duration::from_millis(10)).await;

            let ptrs: Vec<_> = (0..4).map(|_| pointer(&mut context, &getter)).collect();
            let priorities = [
                ON_DEMAND_PRIORITY + 5,
                ON_DEMAND_PRIORITY + 20,
                ON_DEMAND_PRIORITY + 20,
                ON_DEMAND_PRIORITY + 1,
            ];
            let mut retrievals = Vec::new();
            for (ptr, priority) in ptrs.iter().zip(priorities) {
                retrievals.push(request(&retriever, priority, &kmd, *ptr).await);
            }
            assert!(context.encode().contains("retriever_pending 4"));

            gate.send(()).unwrap();
            busy_retrieval.await.unwrap();
            for retrieval in retrievals {
                retrieval.await.unwrap();
            }

            // Highest priority first, FIFO among equals
            assert_eq!(
                getter.fetched(),
                vec![busy.id, ptrs[1].id, ptrs[2].id, ptrs[0].id, ptrs[3].id]
            );
        });
    }

    #[test_traced]
    fn test_escalation() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (getter, gate) = mocks::Getter::gated();
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", getter, None, 1, 1);
            let kmd = folder(&mut context);

            // Occupy the only prefetch worker
            let busy = pointer(&mut context, &getter);
            let busy_retrieval = request(&retriever, PREFETCH_PRIORITY, &kmd, busy).await;
            context.sleep(Duration::from_millis(10)).await;

            // Raising a queued retrieval within the prefetch range wakes no one
            let ptr = pointer(&mut context, &getter);
            let first = request(&retriever, PREFETCH_PRIORITY, &kmd, ptr).await;
            let second = request(&retriever, PREFETCH_PRIORITY + 15, &kmd, ptr).await;
            let metrics = context.encode();
            assert!(metrics.contains("retriever_prefetch_signals_total 2"));
            assert!(metrics.contains("retriever_on_demand_signals_total 0"));

            // Crossing into the on-demand range wakes an on-demand worker
            let third = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            let metrics = context.encode();
            assert!(metrics.contains("retriever_prefetch_signals_total 2"));
            assert!(metrics.contains("retriever_on_demand_signals_total 1"));
            context.sleep(Duration::from_millis(10)).await;
            assert!(context.encode().contains("retriever_pending 0"));

            // Raising a retrieval a worker already claimed wakes no one
            let fourth = request(&retriever, ON_DEMAND_PRIORITY + 1, &kmd, ptr).await;
            assert!(context
                .encode()
                .contains("retriever_on_demand_signals_total 1"));

            gate.send(()).unwrap();
            busy_retrieval.await.unwrap();
            for retrieval in [first, second, third, fourth] {
                assert_eq!(contents(retrieval.await), ptr.id.as_ref());
            }
            assert_eq!(getter.fetched(), vec![busy.id, ptr.id]);

            // The retrieval completed with its final priority
            assert!(recorder.events().contains(&Event::Process {
                id: ptr.id,
                priority: ON_DEMAND_PRIORITY + 1,
                status: PrefetchStatus::None,
            }));
        });
    }

    #[test_traced]
    fn test_throttled_release() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever, getter, ..
            } = setup_throttled(
                &context,
                "retriever",
                mocks::Getter::new(),
                None,
                1,
                2,
                Duration::from_secs(2),
            );
            let kmd = folder(&mut context);

            // Low-priority retrievals wait in the throttled lane
            let ptrs: Vec<_> = (0..3).map(|_| pointer(&mut context, &getter)).collect();
            let mut retrievals = Vec::new();
            for ptr in &ptrs {
                retrievals.push(request(&retriever, THROTTLE_PRIORITY, &kmd, *ptr).await);
            }
            let metrics = context.encode();
            assert!(metrics.contains("retriever_throttled_signals_total 3"));
            assert!(metrics.contains("retriever_prefetch_signals_total 0"));

            // Escalating above the threshold signals the prefetch lane right away
            let escalated = request(&retriever, PREFETCH_PRIORITY, &kmd, ptrs[2]).await;
            context.sleep(Duration::from_millis(10)).await;
            assert_eq!(getter.fetched(), vec![ptrs[2].id]);
            assert!(context
                .encode()
                .contains("retriever_prefetch_signals_total 1"));

            // The rest are released one per second (the period split across two workers)
            context.sleep(Duration::from_millis(500)).await;
            assert_eq!(getter.fetched(), vec![ptrs[2].id]);
            context.sleep(Duration::from_secs(1)).await;
            assert_eq!(getter.fetched(), vec![ptrs[2].id, ptrs[0].id]);
            context.sleep(Duration::from_secs(1)).await;
            assert_eq!(getter.fetched(), vec![ptrs[2].id, ptrs[0].id, ptrs[1].id]);

            // The final release finds nothing left to retrieve
            context.sleep(Duration::from_secs(1)).await;
            assert!(context
                .encode()
                .contains("retriever_prefetch_signals_total 4"));
            assert_eq!(getter.fetched().len(), 3);

            assert_eq!(contents(escalated.await), ptrs[2].id.as_ref());
            for (retrieval, ptr) in retrievals.into_iter().zip(&ptrs) {
                assert_eq!(contents(retrieval.await), ptr.id.as_ref());
            }
        });
    }

    #[test_traced]
    fn test_throttled_without_prefetch_workers() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever, getter, ..
            } = setup_throttled(
                &context,
                "retriever",
                mocks::Getter::new(),
                None,
                1,
                0,
                Duration::from_secs(1),
            );
            let kmd = folder(&mut context);

            // Without prefetch workers there is no throttled lane, so nothing serves the request
            let ptr = pointer(&mut context, &getter);
            let retrieval = request(&retriever, THROTTLE_PRIORITY, &kmd, ptr).await;
            context.sleep(Duration::from_secs(5)).await;
            assert!(getter.fetched().is_empty());
            let metrics = context.encode();
            assert!(metrics.contains("retriever_throttled_signals_total 0"));
            assert!(metrics.contains("retriever_pending 1"));

            // Until it is escalated to on-demand
            let escalated = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert_eq!(contents(escalated.await), ptr.id.as_ref());
            assert_eq!(contents(retrieval.await), ptr.id.as_ref());
        });
    }

    #[test_traced]
    fn test_cancellation() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (getter, gate) = mocks::Getter::gated();
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", getter, None, 1, 0);
            let kmd = folder(&mut context);

            // Abandoning an in-flight fetch
            let abandoned = pointer(&mut context, &getter);
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, abandoned).await;
            context.sleep(Duration::from_millis(10)).await;
            assert_eq!(getter.fetched(), vec![abandoned.id]);
            retrieval.cancel();
            context.sleep(Duration::from_millis(10)).await;
            assert!(context.encode().contains("retriever_failures_total 1"));
            assert_eq!(recorder.events(), vec![Event::Cancel(abandoned.id)]);

            // Occupy the worker
            let busy = pointer(&mut context, &getter);
            let busy_retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, busy).await;
            context.sleep(Duration::from_millis(10)).await;

            // One caller leaving doesn't affect the other
            let shared = pointer(&mut context, &getter);
            let leaving = request(&retriever, ON_DEMAND_PRIORITY, &kmd, shared).await;
            let staying = request(&retriever, ON_DEMAND_PRIORITY, &kmd, shared).await;
            drop(leaving);

            // Every caller leaving a queued retrieval, then a new caller arriving
            let stale = pointer(&mut context, &getter);
            request(&retriever, ON_DEMAND_PRIORITY, &kmd, stale)
                .await
                .cancel();
            let fresh = request(&retriever, ON_DEMAND_PRIORITY, &kmd, stale).await;

            gate.send(()).unwrap();
            busy_retrieval.await.unwrap();
            assert_eq!(contents(staying.await), shared.id.as_ref());
            assert_eq!(contents(fresh.await), stale.id.as_ref());

            // The stale retrieval was never fetched
            assert_eq!(
                getter.fetched(),
                vec![abandoned.id, busy.id, shared.id, stale.id]
            );
            assert!(context.encode().contains("retriever_failures_total 2"));
        });
    }

    #[test_traced]
    fn test_shutdown() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (getter, gate) = mocks::Getter::gated();
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", getter, None, 1, 1);
            let kmd = folder(&mut context);

            // Occupy the on-demand worker
            let busy = pointer(&mut context, &getter);
            let busy_retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, busy).await;
            context.sleep(Duration::from_millis(10)).await;

            let queued = pointer(&mut context, &getter);
            let queued_retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, queued).await;
            let drained = retriever.shutdown().await;
            assert!(matches!(queued_retrieval.await, Err(Error::Shutdown)));

            // Requests fail fast
            let late = pointer(&mut context, &getter);
            let late_retrieval = request(&retriever, PREFETCH_PRIORITY, &kmd, late).await;
            assert!(matches!(late_retrieval.await, Err(Error::Shutdown)));
            assert!(recorder.events().contains(&Event::Cancel(late.id)));

            // In-flight fetches complete before workers exit
            assert!(drained.clone().now_or_never().is_none());
            gate.send(()).unwrap();
            assert_eq!(contents(busy_retrieval.await), busy.id.as_ref());
            drained.await.unwrap();
            assert!(context.encode().contains("retriever_workers 0"));
            assert!(recorder.events().contains(&Event::Shutdown));

            // Shutdown is idempotent
            retriever.shutdown().await.await.unwrap();
            assert_eq!(getter.fetched(), vec![busy.id]);
        });
    }

    #[test_traced]
    fn test_data_version() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", mocks::Getter::new(), None, 1, 1);
            let kmd = folder(&mut context);
            let mut ptr = pointer(&mut context, &getter);
            ptr.data_version = 2;
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert!(matches!(
                retrieval.await,
                Err(Error::NewDataVersion { version: 2, .. })
            ));
            assert_eq!(recorder.events(), vec![Event::Cancel(ptr.id)]);
            assert!(getter.fetched().is_empty());
        });
    }

    #[test_traced]
    fn test_fetch_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever,
                getter,
                recorder,
                memory,
            } = setup(&context, "retriever", mocks::Getter::new(), None, 1, 1);
            let kmd = folder(&mut context);
            let ptr = BlockPointer::new(BlockId::random(&mut context), 1);
            let retrieval = request(&retriever, PREFETCH_PRIORITY, &kmd, ptr).await;
            assert!(matches!(retrieval.await, Err(Error::Fetch(_))));
            assert_eq!(getter.fetched(), vec![ptr.id]);
            assert_eq!(recorder.events(), vec![Event::Cancel(ptr.id)]);
            assert!(!memory.contains(&ptr));
            assert!(context.encode().contains("retriever_failures_total 1"));
        });
    }

    #[test_traced]
    fn test_memory_hit_without_disk() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", mocks::Getter::new(), None, 1, 1);
            let kmd = folder(&mut context);
            let ptr = BlockPointer::new(BlockId::random(&mut context), 1);

            // Statuses are remembered locally (and only ever raised)
            let block = Data::new(b"cached".to_vec());
            retriever
                .put_in_caches(
                    &ptr,
                    &kmd.tlf(),
                    &block,
                    CacheLifetime::Transient,
                    PrefetchStatus::Finished,
                )
                .await
                .unwrap();
            retriever
                .put_in_caches(
                    &ptr,
                    &kmd.tlf(),
                    &block,
                    CacheLifetime::Transient,
                    PrefetchStatus::Triggered,
                )
                .await
                .unwrap();

            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert_eq!(contents(retrieval.await), b"cached");
            assert!(getter.fetched().is_empty());
            assert_eq!(
                recorder.events(),
                vec![Event::Process {
                    id: ptr.id,
                    priority: ON_DEMAND_PRIORITY,
                    status: PrefetchStatus::Finished,
                }]
            );
        });
    }

    #[test_traced]
    fn test_disk_hit() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let kmd = folder(&mut context);
            let tlf = kmd.tlf();
            let policy = Arc::new(SyncedTlfs::default());
            policy.enable(tlf);
            let disk = Cache::new(
                context.with_label("disk"),
                DiskConfig::new(
                    Category::Sync,
                    policy,
                    Arc::new(ByteLimiter::new(1 << 20, 0)),
                    Memory::new(),
                    Memory::new(),
                    Memory::new(),
                ),
            );
            disk.wait_until_started().await.unwrap();
            let Setup {
                retriever,
                getter,
                recorder,
                memory,
            } = setup(
                &context,
                "retriever",
                mocks::Getter::new(),
                Some(disk.clone()),
                1,
                1,
            );

            // Assembled from the disk cache and promoted to memory
            let ptr = BlockPointer::new(BlockId::random(&mut context), 1);
            disk.put(&tlf, &ptr.id, b"encrypted", &KeyHalf::default())
                .await
                .unwrap();
            disk.update_metadata(&ptr.id, PrefetchStatus::Triggered)
                .await
                .unwrap();
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert_eq!(contents(retrieval.await), b"encrypted");
            assert!(memory.contains(&ptr));

            // Memory hits take their status from the disk cache
            retriever
                .put_in_caches(
                    &ptr,
                    &tlf,
                    &Data::new(b"encrypted".to_vec()),
                    CacheLifetime::Transient,
                    PrefetchStatus::Finished,
                )
                .await
                .unwrap();
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            assert_eq!(contents(retrieval.await), b"encrypted");
            assert_eq!(
                recorder.events(),
                vec![
                    Event::Process {
                        id: ptr.id,
                        priority: ON_DEMAND_PRIORITY,
                        status: PrefetchStatus::Triggered,
                    },
                    Event::Process {
                        id: ptr.id,
                        priority: ON_DEMAND_PRIORITY,
                        status: PrefetchStatus::Finished,
                    },
                ]
            );
            assert!(getter.fetched().is_empty());

            // Fetched blocks that never reached the disk can't be updated there
            let missing = pointer(&mut context, &getter);
            assert!(matches!(
                retriever
                    .put_in_caches(
                        &missing,
                        &tlf,
                        &Data::default(),
                        CacheLifetime::Transient,
                        PrefetchStatus::Triggered,
                    )
                    .await,
                Err(Error::Disk(_))
            ));
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, missing).await;
            assert_eq!(contents(retrieval.await), missing.id.as_ref());
            assert_eq!(getter.fetched(), vec![missing.id]);
        });
    }

    #[test_traced]
    fn test_toggle_prefetcher() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Setup {
                retriever,
                getter,
                recorder,
                ..
            } = setup(&context, "retriever", mocks::Getter::new(), None, 1, 1);
            assert_eq!(recorder.created(), 1);

            retriever.toggle_prefetcher(false, None).await.unwrap();
            assert!(retriever.prefetcher().is_none());
            assert_eq!(recorder.events(), vec![Event::Shutdown]);

            // Retrievals proceed without a prefetcher
            let kmd = folder(&mut context);
            let ptr = pointer(&mut context, &getter);
            let retrieval = request(&retriever, ON_DEMAND_PRIORITY, &kmd, ptr).await;
            retrieval.await.unwrap();
            assert_eq!(recorder.events(), vec![Event::Shutdown]);

            // Disabling twice drains immediately
            retriever.toggle_prefetcher(false, None).await.unwrap();

            retriever.toggle_prefetcher(true, None).await.unwrap();
            assert!(retriever.prefetcher().is_some());
            assert_eq!(recorder.created(), 2);
        });
    }
}
