//! A single disk cache over three [Store]s.

use super::{
    metadata::{Entry, Metadata, MAX_TAG_LEN},
    metrics::Metrics,
    Config, DiskCache, Error, EvictionPriority, StartState, Status, SyncPolicy,
};
use crate::{
    limiter::{Category, Limiter},
    store::{Batch, Store},
    BlockId, KeyHalf, PrefetchStatus, TlfId,
};
use async_lock::RwLock;
use commonware_codec::{DecodeExt, Encode, EncodeSize, Error as CodecError, FixedSize};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use commonware_utils::SystemTimeExt;
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use rand::Rng;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Share of the byte budget above which a cache reports that it has no space.
const FULL_FRACTION: f64 = 0.99;

/// Eviction visits folders in this order.
const PRIORITIES: [EvictionPriority; 3] = [
    EvictionPriority::NotHome,
    EvictionPriority::PublicHome,
    EvictionPriority::PrivateHome,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Closed,
    Failed,
}

#[derive(Clone)]
struct Stores<S: Store> {
    blocks: S,
    metadata: S,
    tlfs: S,
}

struct State<S: Store> {
    phase: Phase,
    stores: Option<Stores<S>>,

    tlf_counts: HashMap<TlfId, u64>,
    tlf_sizes: HashMap<TlfId, u64>,
    home: HashMap<TlfId, EvictionPriority>,
    blocks: u64,
    bytes: u64,
}

impl<S: Store> State<S> {
    fn stores(&self) -> Result<Stores<S>, Error> {
        match self.phase {
            Phase::Starting => Err(Error::Starting),
            Phase::Running => self.stores.clone().ok_or(Error::Closed),
            Phase::Closed | Phase::Failed => Err(Error::Closed),
        }
    }

    /// Drop `count` blocks totalling `size` bytes of `tlf` from the counters.
    fn forget(&mut self, tlf: &TlfId, count: u64, size: u64) {
        if let Some(tlf_count) = self.tlf_counts.get_mut(tlf) {
            *tlf_count = tlf_count.saturating_sub(count);
            if *tlf_count == 0 {
                self.tlf_counts.remove(tlf);
            }
        }
        if let Some(tlf_size) = self.tlf_sizes.get_mut(tlf) {
            *tlf_size = tlf_size.saturating_sub(size);
            if *tlf_size == 0 {
                self.tlf_sizes.remove(tlf);
            }
        }
        self.blocks = self.blocks.saturating_sub(count);
        self.bytes = self.bytes.saturating_sub(size);
    }
}

struct Inner<E: Spawner + Clock + Rng + RuntimeMetrics, S: Store> {
    context: E,
    category: Category,
    policy: Arc<dyn SyncPolicy>,
    limiter: Arc<dyn Limiter>,
    eviction_batch: usize,
    max_eviction_rounds: usize,
    eviction_oversample: usize,
    unmarked_batch: usize,

    state: RwLock<State<S>>,
    started: Shared<oneshot::Receiver<()>>,

    metrics: Metrics,
}

/// A [DiskCache] backed by three [Store]s.
///
/// Clones share the same underlying cache.
pub struct Cache<E: Spawner + Clock + Rng + RuntimeMetrics, S: Store> {
    inner: Arc<Inner<E, S>>,
}

impl<E: Spawner + Clock + Rng + RuntimeMetrics, S: Store> Clone for Cache<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn tlf_key(tlf: &TlfId, id: &BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(TlfId::SIZE + BlockId::SIZE);
    key.extend_from_slice(tlf.as_ref());
    key.extend_from_slice(id.as_ref());
    key
}

/// Extract the block id from a `tlf || id` index key.
fn indexed_id(key: &[u8]) -> Option<BlockId> {
    match BlockId::try_from(key.get(TlfId::SIZE..)?) {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(?err, "skipping invalid block id");
            None
        }
    }
}

impl<E: Spawner + Clock + Rng + RuntimeMetrics, S: Store> Cache<E, S> {
    /// Create a new [Cache] and start counting the blocks it already holds.
    ///
    /// Until the count completes, calls fail with [Error::Starting].
    pub fn new(context: E, cfg: Config<S>) -> Self {
        let metrics = Metrics::init(&context);
        let (started, ready) = oneshot::channel();
        let cache = Self {
            inner: Arc::new(Inner {
                context: context.clone(),
                category: cfg.category,
                policy: cfg.policy,
                limiter: cfg.limiter,
                eviction_batch: cfg.eviction_batch,
                max_eviction_rounds: cfg.max_eviction_rounds,
                eviction_oversample: cfg.eviction_oversample,
                unmarked_batch: cfg.unmarked_batch,
                state: RwLock::new(State {
                    phase: Phase::Starting,
                    stores: Some(Stores {
                        blocks: cfg.blocks,
                        metadata: cfg.metadata,
                        tlfs: cfg.tlfs,
                    }),
                    tlf_counts: HashMap::new(),
                    tlf_sizes: HashMap::new(),
                    home: HashMap::new(),
                    blocks: 0,
                    bytes: 0,
                }),
                started: ready.shared(),
                metrics,
            }),
        };

        context.with_label("recount").spawn({
            let cache = cache.clone();
            move |_| async move {
                cache.recount().await;
                let _ = started.send(());
            }
        });
        cache
    }

    /// Rebuild counters from the metadata store.
    async fn recount(&self) {
        let mut state = self.inner.state.write().await;
        let Some(stores) = state.stores.clone() else {
            return;
        };
        let entries = match stores.metadata.scan().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, "failed to scan metadata");
                state.phase = Phase::Failed;
                return;
            }
        };

        let mut tlf_counts: HashMap<TlfId, u64> = HashMap::new();
        let mut tlf_sizes: HashMap<TlfId, u64> = HashMap::new();
        let mut blocks = 0;
        let mut bytes = 0;
        for (key, value) in entries {
            let metadata = match Metadata::decode(value.as_slice()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(key = %commonware_utils::hex(&key), ?err, "failed to decode metadata");
                    state.phase = Phase::Failed;
                    return;
                }
            };
            *tlf_counts.entry(metadata.tlf).or_default() += 1;
            *tlf_sizes.entry(metadata.tlf).or_default() += metadata.size as u64;
            blocks += 1;
            bytes += metadata.size as u64;
        }
        state.tlf_counts = tlf_counts;
        state.tlf_sizes = tlf_sizes;
        state.blocks = blocks;
        state.bytes = bytes;
        state.phase = Phase::Running;
        self.update_gauges(&state);
        self.inner.limiter.on_enable(self.inner.category, bytes);
        debug!(
            category = self.inner.category.name(),
            blocks, bytes, "started disk cache"
        );
    }

    fn check_started(&self) -> Result<(), Error> {
        match self.inner.started.peek() {
            Some(_) => Ok(()),
            None => Err(Error::Starting),
        }
    }

    fn update_gauges(&self, state: &State<S>) {
        self.inner.metrics.blocks.set(state.blocks as i64);
        self.inner.metrics.bytes.set(state.bytes as i64);
    }

    async fn read_metadata(
        &self,
        stores: &Stores<S>,
        id: &BlockId,
    ) -> Result<Option<Metadata>, Error> {
        let Some(value) = stores.metadata.get(id.as_ref()).await? else {
            return Ok(None);
        };
        let mut metadata = Metadata::decode(value.as_slice())?;
        if self.inner.category == Category::WorkingSet {
            metadata.demote_finished();
        }
        Ok(Some(metadata))
    }

    /// Persist `metadata` with a last access time of now.
    async fn write_metadata(
        &self,
        stores: &Stores<S>,
        id: &BlockId,
        mut metadata: Metadata,
    ) -> Result<(), Error> {
        metadata.lru = self.inner.context.current().epoch_millis();
        if let Err(err) = stores.metadata.put(id.as_ref(), &metadata.encode()).await {
            warn!(?id, ?err, "failed to write metadata");
            return Err(err.into());
        }
        Ok(())
    }

    /// Reserve `size` bytes for a new block, evicting if allowed.
    async fn reserve(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        id: &BlockId,
        size: u64,
    ) -> Result<(), Error> {
        let category = self.inner.category;
        if category == Category::Sync {
            if self.inner.limiter.reserve(category, size)? < 0 {
                return Err(Error::CacheFull(*id));
            }
            return Ok(());
        }

        for _ in 0..self.inner.max_eviction_rounds {
            let remaining = self.inner.limiter.reserve(category, size)?;
            if remaining >= 0 {
                return Ok(());
            }
            debug!(?id, remaining, "evicting to make room");
            let (removed, _) = self
                .evict(state, stores, self.inner.eviction_batch)
                .await?;
            if removed == 0 {
                return Err(Error::NothingToEvict);
            }
        }
        Err(Error::CacheFull(*id))
    }

    /// Pick where to start scanning so that `wanted` of `total` entries are expected to follow.
    fn pivot(&self, wanted: usize, total: u64) -> Result<BlockId, Error> {
        if total == 0 {
            return Err(Error::Empty);
        }
        if wanted as u64 >= total {
            return Ok(BlockId::default());
        }
        let mut rng = self.inner.context.clone();
        Ok(BlockId::random_below(
            &mut rng,
            1.0 - wanted as f64 / total as f64,
        ))
    }

    /// Folders at `priority`, shuffled so that folders holding more blocks tend to come first.
    fn shuffle(&self, state: &State<S>, priority: EvictionPriority) -> Vec<TlfId> {
        let mut tlfs: Vec<_> = state
            .tlf_counts
            .iter()
            .filter(|(tlf, _)| state.home.get(*tlf).copied().unwrap_or_default() == priority)
            .map(|(tlf, count)| (*tlf, *count))
            .collect();
        tlfs.sort_unstable();

        // A key of u^(1/count) orders folders like a draw weighted by count
        let mut rng = self.inner.context.clone();
        let mut weighted: Vec<_> = tlfs
            .into_iter()
            .map(|(tlf, count)| (rng.gen::<f64>().powf(1.0 / count.max(1) as f64), tlf))
            .collect();
        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        weighted.into_iter().map(|(_, tlf)| tlf).collect()
    }

    /// Add up to `wanted` eviction candidates from a random range of `tlf`'s index.
    ///
    /// Indexed blocks without usable metadata are removed on the way. Returns the number of
    /// blocks and bytes removed that way.
    async fn sample(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        tlf: &TlfId,
        wanted: usize,
        candidates: &mut Vec<(BlockId, u64)>,
    ) -> Result<(usize, u64), Error> {
        let total = state.tlf_counts.get(tlf).copied().unwrap_or_default();
        let pivot = self.pivot(wanted, total)?;
        let entries = stores
            .tlfs
            .range(&tlf_key(tlf, &pivot), &tlf_key(tlf, &BlockId::MAX), wanted)
            .await?;
        let mut removed = 0;
        let mut bytes = 0;
        for (key, _) in entries {
            let Some(id) = indexed_id(&key) else {
                continue;
            };
            let value = stores.metadata.get(id.as_ref()).await?;
            match value.map(|value| Metadata::decode(value.as_slice())) {
                Some(Ok(metadata)) => {
                    candidates.push((id, metadata.lru));
                    continue;
                }
                Some(Err(err)) => warn!(?tlf, ?id, ?err, "removing block with invalid metadata"),
                None => warn!(?tlf, ?id, "removing block without metadata"),
            }
            bytes += self.remove_broken(state, stores, tlf, &id).await?;
            removed += 1;
        }
        Ok((removed, bytes))
    }

    /// Remove every key of a block whose metadata is unusable, returning its stored size.
    async fn remove_broken(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        tlf: &TlfId,
        id: &BlockId,
    ) -> Result<u64, Error> {
        let size = stores
            .blocks
            .get(id.as_ref())
            .await?
            .map(|value| value.len() as u64);

        let mut batch = Batch::new();
        batch.delete(id.as_ref().to_vec());
        stores.metadata.write(batch).await?;
        let mut batch = Batch::new();
        batch.delete(tlf_key(tlf, id));
        stores.tlfs.write(batch).await?;
        let mut batch = Batch::new();
        batch.delete(id.as_ref().to_vec());
        stores.blocks.write(batch).await?;

        let Some(size) = size else {
            return Ok(0);
        };
        state.forget(tlf, 1, size);
        self.update_gauges(state);
        self.inner.limiter.release(self.inner.category, size);
        Ok(size)
    }

    /// Delete the `count` least recently used of `candidates`.
    async fn evict_oldest(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        mut candidates: Vec<(BlockId, u64)>,
        count: usize,
    ) -> Result<(usize, u64), Error> {
        // Only sort if we need to pick a subset
        if candidates.len() > count {
            candidates.sort_by_key(|(_, lru)| *lru);
            candidates.truncate(count);
        }
        let ids: Vec<_> = candidates.into_iter().map(|(id, _)| id).collect();
        self.remove(state, stores, &ids).await
    }

    fn record_eviction(&self, requested: usize, removed: usize, bytes: u64) {
        let now = self.inner.context.current();
        self.inner.metrics.evicted_blocks.mark(removed as u64, now);
        self.inner.metrics.evicted_bytes.mark(bytes, now);
        debug!(requested, removed, bytes, "evicted blocks");
    }

    /// Evict up to `count` approximately least recently used blocks.
    ///
    /// Folders that are not home are sampled first. Home folders are only sampled when the
    /// folders of lower priority could not supply `count` blocks.
    async fn evict(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        count: usize,
    ) -> Result<(usize, u64), Error> {
        let mut removed = 0;
        let mut bytes = 0;
        for priority in PRIORITIES {
            if removed >= count {
                break;
            }
            let sample = (count - removed) * self.inner.eviction_oversample;
            let mut candidates = Vec::with_capacity(sample);
            for tlf in self.shuffle(state, priority) {
                if candidates.len() >= sample {
                    break;
                }
                let wanted = sample - candidates.len();
                let (broken, broken_bytes) = self
                    .sample(state, stores, &tlf, wanted, &mut candidates)
                    .await?;
                removed += broken;
                bytes += broken_bytes;
            }
            let left = count.saturating_sub(removed);
            let (evicted, evicted_bytes) = self
                .evict_oldest(state, stores, candidates, left)
                .await?;
            trace!(?priority, evicted, "evicted at priority");
            removed += evicted;
            bytes += evicted_bytes;
        }
        self.record_eviction(count, removed, bytes);
        Ok((removed, bytes))
    }

    /// Evict up to `count` approximately least recently used blocks of `tlf`.
    async fn evict_tlf(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        tlf: &TlfId,
        count: usize,
    ) -> Result<(usize, u64), Error> {
        let sample = count * self.inner.eviction_oversample;
        let mut candidates = Vec::with_capacity(sample);
        let (mut removed, mut bytes) = self
            .sample(state, stores, tlf, sample, &mut candidates)
            .await?;
        let left = count.saturating_sub(removed);
        let (evicted, evicted_bytes) = self.evict_oldest(state, stores, candidates, left).await?;
        removed += evicted;
        bytes += evicted_bytes;
        self.record_eviction(count, removed, bytes);
        Ok((removed, bytes))
    }

    /// Remove `ids` from all stores and update counters.
    async fn remove(
        &self,
        state: &mut State<S>,
        stores: &Stores<S>,
        ids: &[BlockId],
    ) -> Result<(usize, u64), Error> {
        if ids.is_empty() {
            return Ok((0, 0));
        }
        let mut blocks = Batch::new();
        let mut metadata_batch = Batch::new();
        let mut tlfs = Batch::new();
        let mut removals: HashMap<TlfId, (u64, u64)> = HashMap::new();
        let mut seen = HashSet::new();
        let mut removed = 0;
        let mut bytes = 0;
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let Some(value) = stores.metadata.get(id.as_ref()).await? else {
                continue;
            };
            let metadata = Metadata::decode(value.as_slice())?;
            blocks.delete(id.as_ref().to_vec());
            metadata_batch.delete(id.as_ref().to_vec());
            tlfs.delete(tlf_key(&metadata.tlf, id));

            let removal = removals.entry(metadata.tlf).or_default();
            removal.0 += 1;
            removal.1 += metadata.size as u64;
            removed += 1;
            bytes += metadata.size as u64;
        }
        stores.metadata.write(metadata_batch).await?;
        stores.tlfs.write(tlfs).await?;
        stores.blocks.write(blocks).await?;

        for (tlf, (count, size)) in removals {
            state.forget(&tlf, count, size);
        }
        self.update_gauges(state);
        if bytes > 0 {
            self.inner.limiter.release(self.inner.category, bytes);
        }
        Ok((removed, bytes))
    }

    /// Remove every block of `tlf`, one eviction batch at a time.
    pub async fn clear_tlf(&self, tlf: &TlfId) -> Result<(), Error> {
        self.check_started()?;
        loop {
            let mut state = self.inner.state.write().await;
            let stores = state.stores()?;
            let left = state.tlf_counts.get(tlf).copied().unwrap_or_default();
            if left == 0 {
                debug!(?tlf, "cleared tlf");
                return Ok(());
            }
            trace!(?tlf, left, "clearing tlf");
            let (removed, _) = self
                .evict_tlf(&mut state, &stores, tlf, self.inner.eviction_batch)
                .await?;
            if removed == 0 {
                return Err(Error::NothingToEvict);
            }
        }
    }

    /// Bytes held for `tlf`.
    pub async fn tlf_size(&self, tlf: &TlfId) -> u64 {
        let state = self.inner.state.read().await;
        state.tlf_sizes.get(tlf).copied().unwrap_or_default()
    }

    /// Folders with at least one cached block.
    pub async fn tlf_ids(&self) -> Vec<TlfId> {
        let state = self.inner.state.read().await;
        state.tlf_sizes.keys().copied().collect()
    }

    /// Whether less than 99% of the byte budget is used.
    pub async fn has_space(&self) -> bool {
        let status = self.inner.limiter.status(self.inner.category);
        if status.limit == 0 {
            return false;
        }

        // Blocks of synced folders are never throttled, so rely on local usage
        let used = match self.inner.category {
            Category::Sync => self.inner.state.read().await.bytes,
            Category::WorkingSet => status.used,
        };
        used as f64 / status.limit as f64 <= FULL_FRACTION
    }
}

impl<E: Spawner + Clock + Rng + RuntimeMetrics, S: Store> DiskCache for Cache<E, S> {
    async fn get(
        &self,
        tlf: &TlfId,
        id: &BlockId,
    ) -> Result<(Vec<u8>, KeyHalf, PrefetchStatus), Error> {
        self.check_started()?;
        let state = self.inner.state.read().await;
        let stores = state.stores()?;
        let now = self.inner.context.current();
        let Some(value) = stores.blocks.get(id.as_ref()).await? else {
            self.inner.metrics.misses.mark(1, now);
            trace!(?tlf, ?id, "miss");
            return Err(Error::NotFound(*id));
        };
        self.inner.metrics.hits.mark(1, now);

        let metadata = self
            .read_metadata(&stores, id)
            .await?
            .ok_or(Error::NotFound(*id))?;
        let status = metadata.status();
        self.write_metadata(&stores, id, metadata).await?;
        let entry = Entry::decode(value.as_slice())?;
        trace!(?tlf, ?id, ?status, "hit");
        Ok((entry.payload, entry.half, status))
    }

    async fn get_metadata(&self, id: &BlockId) -> Result<Metadata, Error> {
        self.check_started()?;
        let state = self.inner.state.read().await;
        let stores = state.stores()?;
        self.read_metadata(&stores, id)
            .await?
            .ok_or(Error::NotFound(*id))
    }

    async fn put(
        &self,
        tlf: &TlfId,
        id: &BlockId,
        payload: &[u8],
        half: &KeyHalf,
    ) -> Result<(), Error> {
        self.check_started()?;
        let mut state = self.inner.state.write().await;
        let stores = state.stores()?;
        let entry = Entry {
            payload: payload.to_vec(),
            half: *half,
        };
        let size = entry.encode_size() as u64;

        if !stores.blocks.has(id.as_ref()).await? {
            let synced = self.inner.policy.is_synced(tlf);
            match self.inner.category {
                Category::Sync if !synced => return Err(Error::NotSynced(*tlf)),
                Category::WorkingSet if synced => return Err(Error::Synced(*tlf)),
                _ => {}
            }
            self.reserve(&mut state, &stores, id, size).await?;

            let category = self.inner.category;
            if let Err(err) = stores.blocks.put(id.as_ref(), &entry.encode()).await {
                self.inner.limiter.commit_or_rollback(category, size, false);
                warn!(?id, ?err, "failed to write block");
                return Err(err.into());
            }
            self.inner.limiter.commit_or_rollback(category, size, true);

            *state.tlf_counts.entry(*tlf).or_default() += 1;
            *state.tlf_sizes.entry(*tlf).or_default() += size;
            state.blocks += 1;
            state.bytes += size;
            self.update_gauges(&state);
            self.inner
                .metrics
                .puts
                .mark(1, self.inner.context.current());
        }

        let key = tlf_key(tlf, id);
        match stores.tlfs.has(&key).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = stores.tlfs.put(&key, &[]).await {
                    warn!(?tlf, ?id, ?err, "failed to index block");
                }
            }
            Err(err) => warn!(?tlf, ?id, ?err, "failed to read block index"),
        }

        // New blocks start without prefetch progress
        let metadata = match self.read_metadata(&stores, id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => Metadata::new(*tlf, size as u32),
            Err(err) => {
                warn!(?id, ?err, "replacing invalid metadata");
                Metadata::new(*tlf, size as u32)
            }
        };
        self.write_metadata(&stores, id, metadata).await?;
        debug!(?tlf, ?id, size, "put block");
        Ok(())
    }

    async fn delete(&self, ids: &[BlockId]) -> Result<(usize, u64), Error> {
        self.check_started()?;
        let mut state = self.inner.state.write().await;
        let stores = state.stores()?;
        let (removed, bytes) = self.remove(&mut state, &stores, ids).await?;

        let now = self.inner.context.current();
        self.inner.metrics.deleted_blocks.mark(removed as u64, now);
        self.inner.metrics.deleted_bytes.mark(bytes, now);
        debug!(requested = ids.len(), removed, bytes, "deleted blocks");
        Ok((removed, bytes))
    }

    async fn update_metadata(&self, id: &BlockId, status: PrefetchStatus) -> Result<(), Error> {
        self.check_started()?;
        let state = self.inner.state.write().await;
        let stores = state.stores()?;
        let mut metadata = self
            .read_metadata(&stores, id)
            .await?
            .ok_or(Error::NotFound(*id))?;
        metadata.set_status(status);
        self.write_metadata(&stores, id, metadata).await?;
        self.inner
            .metrics
            .metadata_updates
            .mark(1, self.inner.context.current());
        trace!(?id, ?status, "updated metadata");
        Ok(())
    }

    async fn mark(&self, id: &BlockId, tag: &str) -> Result<(), Error> {
        self.check_started()?;
        if tag.len() > MAX_TAG_LEN {
            return Err(CodecError::Invalid("Metadata", "tag").into());
        }
        let state = self.inner.state.write().await;
        let stores = state.stores()?;
        let Some(value) = stores.metadata.get(id.as_ref()).await? else {
            return Err(Error::NotFound(*id));
        };

        // Marking is not an access
        let mut metadata = Metadata::decode(value.as_slice())?;
        metadata.tag = tag.to_string();
        stores.metadata.put(id.as_ref(), &metadata.encode()).await?;
        trace!(?id, tag, "marked block");
        Ok(())
    }

    async fn delete_unmarked(&self, tlf: &TlfId, tag: &str) -> Result<(usize, u64), Error> {
        self.check_started()?;
        let mut start = tlf_key(tlf, &BlockId::default());
        let end = tlf_key(tlf, &BlockId::MAX);
        let mut removed = 0;
        let mut bytes = 0;
        loop {
            let mut state = self.inner.state.write().await;
            let stores = state.stores()?;
            let entries = stores
                .tlfs
                .range(&start, &end, self.inner.unmarked_batch)
                .await?;
            let Some((last, _)) = entries.last() else {
                break;
            };

            // The next batch starts right after the last key seen
            start = last.clone();
            start.push(0);
            let full = entries.len() == self.inner.unmarked_batch;

            let mut unmarked = Vec::new();
            for (key, _) in entries {
                let Some(id) = indexed_id(&key) else {
                    continue;
                };
                let value = stores.metadata.get(id.as_ref()).await?;
                match value.map(|value| Metadata::decode(value.as_slice())) {
                    Some(Ok(metadata)) => {
                        if metadata.tag != tag {
                            unmarked.push(id);
                        }
                    }
                    Some(Err(_)) | None => {
                        bytes += self.remove_broken(&mut state, &stores, tlf, &id).await?;
                        removed += 1;
                    }
                }
            }
            let (batch_removed, batch_bytes) = self.remove(&mut state, &stores, &unmarked).await?;
            removed += batch_removed;
            bytes += batch_bytes;
            if !full {
                break;
            }
        }

        let now = self.inner.context.current();
        self.inner.metrics.deleted_blocks.mark(removed as u64, now);
        self.inner.metrics.deleted_bytes.mark(bytes, now);
        debug!(?tlf, tag, removed, bytes, "deleted unmarked blocks");
        Ok((removed, bytes))
    }

    async fn last_unref_rev(&self, tlf: &TlfId) -> Result<Option<u64>, Error> {
        self.check_started()?;
        let state = self.inner.state.read().await;
        let stores = state.stores()?;
        let Some(value) = stores.tlfs.get(tlf.as_ref()).await? else {
            return Ok(None);
        };
        Ok(Some(u64::decode(value.as_slice())?))
    }

    async fn put_last_unref_rev(&self, tlf: &TlfId, rev: u64) -> Result<(), Error> {
        self.check_started()?;
        let state = self.inner.state.write().await;
        let stores = state.stores()?;
        if let Some(value) = stores.tlfs.get(tlf.as_ref()).await? {
            let current = u64::decode(value.as_slice())?;
            if current >= rev {
                trace!(?tlf, current, rev, "ignoring older revision");
                return Ok(());
            }
        }
        stores.tlfs.put(tlf.as_ref(), &rev.encode()).await?;
        debug!(?tlf, rev, "stored last unreferenced revision");
        Ok(())
    }

    async fn add_home_tlf(&self, tlf: TlfId, priority: EvictionPriority) {
        let mut state = self.inner.state.write().await;
        state.home.insert(tlf, priority);
        debug!(?tlf, ?priority, "added home tlf");
    }

    async fn clear_home_tlfs(&self) {
        self.inner.state.write().await.home.clear();
    }

    async fn status(&self) -> BTreeMap<String, Status> {
        let name = self.inner.category.name().to_string();
        let limit = self.inner.limiter.status(self.inner.category).limit;
        if self.check_started().is_err() {
            let status = Status {
                limit,
                ..Default::default()
            };
            return BTreeMap::from([(name, status)]);
        }

        let state = self.inner.state.read().await;
        let now = self.inner.context.current();
        let metrics = &self.inner.metrics;
        let status = Status {
            state: match state.phase {
                Phase::Starting => StartState::Starting,
                Phase::Failed => StartState::Failed,
                Phase::Running | Phase::Closed => StartState::Started,
            },
            blocks: state.blocks,
            bytes: state.bytes,
            limit,
            hits: metrics.hits.status(now),
            misses: metrics.misses.status(now),
            puts: metrics.puts.status(now),
            metadata_updates: metrics.metadata_updates.status(now),
            evicted_blocks: metrics.evicted_blocks.status(now),
            evicted_bytes: metrics.evicted_bytes.status(now),
            deleted_blocks: metrics.deleted_blocks.status(now),
            deleted_bytes: metrics.deleted_bytes.status(now),
        };
        BTreeMap::from([(name, status)])
    }

    async fn wait_until_started(&self) -> Result<(), Error> {
        let _ = self.inner.started.clone().await;
        match self.inner.state.read().await.phase {
            Phase::Running => Ok(()),
            Phase::Starting => Err(Error::Starting),
            Phase::Closed | Phase::Failed => Err(Error::Closed),
        }
    }

    async fn shutdown(&self) {
        let _ = self.inner.started.clone().await;
        let mut state = self.inner.state.write().await;
        match state.phase {
            Phase::Closed => {
                warn!("shutdown called more than once");
                return;
            }
            Phase::Failed => {
                state.phase = Phase::Closed;
                state.stores = None;
                return;
            }
            Phase::Starting | Phase::Running => {}
        }
        state.phase = Phase::Closed;
        state.stores = None;
        self.inner
            .limiter
            .on_disable(self.inner.category, state.bytes);
        debug!(category = self.inner.category.name(), "shutdown disk cache");
    }
}
