//! Route blocks between a sync cache and a working set cache.
//!
//! Blocks of folders that a [SyncPolicy] marks as synced belong in the sync cache (which never
//! evicts). All other blocks belong in the working set cache. Because a folder may start or stop
//! being synced at any time, a block may be found in the "wrong" cache. Reads fall back to the
//! other cache and move the block to where it belongs, and writes lazily remove the block from the
//! cache it no longer belongs in.
//!
//! Removals from the other cache run in the background. [Dual::wait_for_deletes] resolves once
//! none are pending, and [DiskCache::shutdown] waits for them before closing either cache.

use super::{metadata::Metadata, DiskCache, Error, EvictionPriority, Status, SyncPolicy};
use crate::{BlockId, KeyHalf, PrefetchStatus, TlfId};
use async_lock::Mutex;
use commonware_runtime::{Metrics, Spawner};
use futures::channel::oneshot;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, trace, warn};

/// Selects one of the caches of a [Dual].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Which {
    Sync,
    WorkingSet,
}

#[derive(Default)]
struct Deletes {
    pending: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

/// A [DiskCache] that combines a working set cache with an optional sync cache.
pub struct Dual<E: Spawner + Metrics, C: DiskCache> {
    context: E,
    policy: Arc<dyn SyncPolicy>,
    working_set: C,
    sync: Arc<RwLock<Option<C>>>,
    deletes: Arc<Mutex<Deletes>>,
}

impl<E: Spawner + Metrics, C: DiskCache> Clone for Dual<E, C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            policy: self.policy.clone(),
            working_set: self.working_set.clone(),
            sync: self.sync.clone(),
            deletes: self.deletes.clone(),
        }
    }
}

impl<E: Spawner + Metrics, C: DiskCache> Dual<E, C> {
    /// Create a router over `working_set` and (optionally) `sync`.
    pub fn new(context: E, policy: Arc<dyn SyncPolicy>, working_set: C, sync: Option<C>) -> Self {
        Self {
            context,
            policy,
            working_set,
            sync: Arc::new(RwLock::new(sync)),
            deletes: Arc::new(Mutex::new(Deletes::default())),
        }
    }

    /// Replace the sync cache, returning the previous one.
    ///
    /// The caller is responsible for shutting down the returned cache.
    pub fn set_sync(&self, sync: Option<C>) -> Option<C> {
        let enabled = sync.is_some();
        let previous = std::mem::replace(&mut *self.sync.write().unwrap(), sync);
        debug!(enabled, "replaced sync cache");
        previous
    }

    /// The current sync cache, if any.
    pub fn sync(&self) -> Option<C> {
        self.sync.read().unwrap().clone()
    }

    /// The working set cache.
    pub fn working_set(&self) -> &C {
        &self.working_set
    }

    /// The cache selected by `which`.
    pub fn instance(&self, which: Which) -> Result<C, Error> {
        match which {
            Which::WorkingSet => Ok(self.working_set.clone()),
            Which::Sync => self.sync().ok_or(Error::NoSyncCache),
        }
    }

    /// Order the caches by preference for `tlf`.
    ///
    /// Without a sync cache, blocks of synced folders are still sent to the working set (which
    /// rejects them with [Error::Synced]).
    fn rank(&self, tlf: &TlfId) -> (C, Option<C>) {
        match self.sync() {
            Some(sync) if self.policy.is_synced(tlf) => (sync, Some(self.working_set.clone())),
            Some(sync) => (self.working_set.clone(), Some(sync)),
            None => (self.working_set.clone(), None),
        }
    }

    /// Remove `id` from `cache` in the background.
    async fn delete_in_background(&self, cache: C, id: BlockId) {
        self.deletes.lock().await.pending += 1;
        let deletes = self.deletes.clone();
        self.context.with_label("migrate").spawn(move |_| async move {
            match cache.delete(&[id]).await {
                Ok((removed, _)) => trace!(?id, removed, "removed migrated block"),
                Err(err) => warn!(?id, ?err, "failed to remove migrated block"),
            }
            let mut deletes = deletes.lock().await;
            deletes.pending -= 1;
            if deletes.pending == 0 {
                for waiter in deletes.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        });
    }

    /// Resolves once no background removal is pending.
    pub async fn wait_for_deletes(&self) {
        let waiter = {
            let mut deletes = self.deletes.lock().await;
            if deletes.pending == 0 {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            deletes.waiters.push(sender);
            receiver
        };
        let _ = waiter.await;
    }

    /// Copy a block found in `from` into `to`, then remove it from `from`.
    ///
    /// A failed copy leaves the block where it is.
    #[allow(clippy::too_many_arguments)]
    async fn relocate(
        &self,
        to: &C,
        from: &C,
        tlf: &TlfId,
        id: &BlockId,
        payload: &[u8],
        half: &KeyHalf,
        status: PrefetchStatus,
    ) {
        if let Err(err) = to.put(tlf, id, payload, half).await {
            warn!(?tlf, ?id, ?err, "failed to move block");
            return;
        }

        // The descendants may not have moved along with the block
        let status = match status {
            PrefetchStatus::Finished => PrefetchStatus::Triggered,
            status => status,
        };
        if status != PrefetchStatus::None {
            if let Err(err) = to.update_metadata(id, status).await {
                warn!(?tlf, ?id, ?err, "failed to carry prefetch status");
            }
        }
        self.delete_in_background(from.clone(), *id).await;
        debug!(?tlf, ?id, ?status, "moved block");
    }

    /// The prefetch status of a block, as recorded by the cache it belongs in.
    ///
    /// A block only found in the other cache is moved first.
    pub async fn prefetch_status(
        &self,
        tlf: &TlfId,
        id: &BlockId,
    ) -> Result<PrefetchStatus, Error> {
        let (primary, secondary) = self.rank(tlf);
        match (primary.get_metadata(id).await, secondary) {
            (Err(Error::NotFound(_)), Some(secondary)) => {
                let (payload, half, status) = secondary.get(tlf, id).await?;
                self.relocate(&primary, &secondary, tlf, id, &payload, &half, status)
                    .await;
                Ok(primary
                    .get_metadata(id)
                    .await
                    .map(|metadata| metadata.status())
                    .unwrap_or(status))
            }
            (result, _) => result.map(|metadata| metadata.status()),
        }
    }
}

impl<E: Spawner + Metrics, C: DiskCache> DiskCache for Dual<E, C> {
    async fn get(
        &self,
        tlf: &TlfId,
        id: &BlockId,
    ) -> Result<(Vec<u8>, KeyHalf, PrefetchStatus), Error> {
        let (primary, secondary) = self.rank(tlf);
        match (primary.get(tlf, id).await, secondary) {
            (Err(Error::NotFound(_)), Some(secondary)) => {
                trace!(?tlf, ?id, "falling back to secondary cache");
                let (payload, half, status) = secondary.get(tlf, id).await?;
                self.relocate(&primary, &secondary, tlf, id, &payload, &half, status)
                    .await;
                Ok((payload, half, status))
            }
            (result, _) => result,
        }
    }

    async fn get_metadata(&self, id: &BlockId) -> Result<Metadata, Error> {
        if let Some(sync) = self.sync() {
            match sync.get_metadata(id).await {
                Err(Error::NotFound(_)) => {}
                result => return result,
            }
        }
        self.working_set.get_metadata(id).await
    }

    async fn put(
        &self,
        tlf: &TlfId,
        id: &BlockId,
        payload: &[u8],
        half: &KeyHalf,
    ) -> Result<(), Error> {
        let (primary, secondary) = self.rank(tlf);
        primary.put(tlf, id, payload, half).await?;
        if let Some(secondary) = secondary {
            self.delete_in_background(secondary, *id).await;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[BlockId]) -> Result<(usize, u64), Error> {
        let (mut removed, mut bytes) = self.working_set.delete(ids).await?;
        if let Some(sync) = self.sync() {
            let (sync_removed, sync_bytes) = sync.delete(ids).await?;
            removed += sync_removed;
            bytes += sync_bytes;
        }
        Ok((removed, bytes))
    }

    async fn update_metadata(&self, id: &BlockId, status: PrefetchStatus) -> Result<(), Error> {
        let Some(sync) = self.sync() else {
            return self.working_set.update_metadata(id, status).await;
        };
        match sync.update_metadata(id, status).await {
            Err(Error::NotFound(_)) => {}
            result => return result,
        }
        match self.working_set.update_metadata(id, status).await {
            Err(Error::NotFound(_)) => {}
            result => return result,
        }

        // The block may have moved into the sync cache while we were looking elsewhere
        sync.update_metadata(id, status).await
    }

    async fn mark(&self, id: &BlockId, tag: &str) -> Result<(), Error> {
        if let Some(sync) = self.sync() {
            match sync.mark(id, tag).await {
                Err(Error::NotFound(_)) => {}
                result => return result,
            }
        }
        self.working_set.mark(id, tag).await
    }

    async fn delete_unmarked(&self, tlf: &TlfId, tag: &str) -> Result<(usize, u64), Error> {
        let (mut removed, mut bytes) = self.working_set.delete_unmarked(tlf, tag).await?;
        if let Some(sync) = self.sync() {
            let (sync_removed, sync_bytes) = sync.delete_unmarked(tlf, tag).await?;
            removed += sync_removed;
            bytes += sync_bytes;
        }
        Ok((removed, bytes))
    }

    async fn last_unref_rev(&self, tlf: &TlfId) -> Result<Option<u64>, Error> {
        self.rank(tlf).0.last_unref_rev(tlf).await
    }

    async fn put_last_unref_rev(&self, tlf: &TlfId, rev: u64) -> Result<(), Error> {
        self.rank(tlf).0.put_last_unref_rev(tlf, rev).await
    }

    async fn add_home_tlf(&self, tlf: TlfId, priority: EvictionPriority) {
        self.working_set.add_home_tlf(tlf, priority).await;
        if let Some(sync) = self.sync() {
            sync.add_home_tlf(tlf, priority).await;
        }
    }

    async fn clear_home_tlfs(&self) {
        self.working_set.clear_home_tlfs().await;
        if let Some(sync) = self.sync() {
            sync.clear_home_tlfs().await;
        }
    }

    async fn status(&self) -> BTreeMap<String, Status> {
        let mut status = self.working_set.status().await;
        if let Some(sync) = self.sync() {
            status.extend(sync.status().await);
        }
        status
    }

    async fn wait_until_started(&self) -> Result<(), Error> {
        self.working_set.wait_until_started().await?;
        if let Some(sync) = self.sync() {
            sync.wait_until_started().await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.wait_for_deletes().await;
        self.working_set.shutdown().await;
        if let Some(sync) = self.sync() {
            sync.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk::{Cache, Config, SyncedTlfs},
        limiter::{ByteLimiter, Category, Limiter},
        store::Memory,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics, Runner};

    type Single = Cache<deterministic::Context, Memory>;

    struct Fixture {
        dual: Dual<deterministic::Context, Single>,
        policy: Arc<SyncedTlfs>,
        limiter: Arc<ByteLimiter>,

        /// Block stores of the working set and sync caches.
        working_blocks: Memory,
        sync_blocks: Memory,
    }

    async fn setup(context: &deterministic::Context) -> Fixture {
        let policy = Arc::new(SyncedTlfs::default());
        let limiter = Arc::new(ByteLimiter::new(1 << 20, 1 << 20));
        let working_blocks = Memory::new();
        let sync_blocks = Memory::new();
        let cache = |category: Category, blocks: &Memory| {
            Cache::new(
                context.with_label(category.name()),
                Config::new(
                    category,
                    policy.clone(),
                    limiter.clone(),
                    blocks.clone(),
                    Memory::new(),
                    Memory::new(),
                ),
            )
        };
        let dual = Dual::new(
            context.with_label("dual"),
            policy.clone(),
            cache(Category::WorkingSet, &working_blocks),
            Some(cache(Category::Sync, &sync_blocks)),
        );
        dual.wait_until_started().await.unwrap();
        Fixture {
            dual,
            policy,
            limiter,
            working_blocks,
            sync_blocks,
        }
    }

    #[test_traced]
    fn test_routes_by_policy() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture { dual, policy, .. } = setup(&context).await;
            let synced = TlfId::random(&mut context);
            let unsynced = TlfId::random(&mut context);
            policy.enable(synced);

            let half = KeyHalf::default();
            let a = BlockId::random(&mut context);
            let b = BlockId::random(&mut context);
            dual.put(&synced, &a, b"synced", &half).await.unwrap();
            dual.put(&unsynced, &b, b"unsynced", &half).await.unwrap();

            let sync = dual.sync().unwrap();
            assert_eq!(sync.get(&synced, &a).await.unwrap().0, b"synced");
            assert!(matches!(
                dual.working_set().get(&synced, &a).await,
                Err(Error::NotFound(_))
            ));
            assert_eq!(
                dual.working_set().get(&unsynced, &b).await.unwrap().0,
                b"unsynced"
            );
            assert_eq!(dual.get(&synced, &a).await.unwrap().0, b"synced");
            assert_eq!(dual.get(&unsynced, &b).await.unwrap().0, b"unsynced");

            let status = dual.status().await;
            assert_eq!(
                status.keys().collect::<Vec<_>>(),
                vec!["sync", "working_set"]
            );
            assert_eq!(status["sync"].blocks, 1);
            assert_eq!(status["working_set"].blocks, 1);

            // Delete fans out
            let (removed, _) = dual.delete(&[a, b]).await.unwrap();
            assert_eq!(removed, 2);
        });
    }

    #[test_traced]
    fn test_fallback_moves_block() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture { dual, policy, .. } = setup(&context).await;
            let tlf = TlfId::random(&mut context);
            let id = BlockId::random(&mut context);
            let half = KeyHalf::default();

            // Written while the folder was synced
            policy.enable(tlf);
            dual.put(&tlf, &id, b"block", &half).await.unwrap();
            dual.update_metadata(&id, PrefetchStatus::Finished)
                .await
                .unwrap();
            policy.disable(&tlf);

            // Reads fall back to the sync cache and move the block
            let (payload, _, status) = dual.get(&tlf, &id).await.unwrap();
            assert_eq!(payload, b"block");
            assert_eq!(status, PrefetchStatus::Finished);
            dual.wait_for_deletes().await;
            assert!(matches!(
                dual.sync().unwrap().get(&tlf, &id).await,
                Err(Error::NotFound(_))
            ));

            // Moved blocks resume their prefetch
            let metadata = dual.working_set().get_metadata(&id).await.unwrap();
            assert!(metadata.triggered);
            assert!(!metadata.finished);
            assert_eq!(
                dual.get(&tlf, &id).await.unwrap().2,
                PrefetchStatus::Triggered
            );

            // Metadata updates find the block wherever it lives
            dual.update_metadata(&id, PrefetchStatus::None)
                .await
                .unwrap();
            assert_eq!(dual.get_metadata(&id).await.unwrap().status(), PrefetchStatus::None);

            let missing = BlockId::random(&mut context);
            assert!(matches!(
                dual.update_metadata(&missing, PrefetchStatus::Finished).await,
                Err(Error::NotFound(_))
            ));
            assert!(matches!(
                dual.get_metadata(&missing).await,
                Err(Error::NotFound(_))
            ));
            assert!(matches!(
                dual.get(&tlf, &missing).await,
                Err(Error::NotFound(_))
            ));
        });
    }

    #[test_traced]
    fn test_prefetch_status_moves_block() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture { dual, policy, .. } = setup(&context).await;
            let tlf = TlfId::random(&mut context);
            let id = BlockId::random(&mut context);
            dual.put(&tlf, &id, b"block", &KeyHalf::default())
                .await
                .unwrap();
            dual.update_metadata(&id, PrefetchStatus::Triggered)
                .await
                .unwrap();

            // The folder becomes synced after the block was cached
            policy.enable(tlf);
            assert_eq!(
                dual.prefetch_status(&tlf, &id).await.unwrap(),
                PrefetchStatus::Triggered
            );
            let sync = dual.sync().unwrap();
            assert_eq!(
                sync.get_metadata(&id).await.unwrap().status(),
                PrefetchStatus::Triggered
            );
            dual.wait_for_deletes().await;
            assert!(matches!(
                dual.working_set().get_metadata(&id).await,
                Err(Error::NotFound(_))
            ));

            let missing = BlockId::random(&mut context);
            assert!(matches!(
                dual.prefetch_status(&tlf, &missing).await,
                Err(Error::NotFound(_))
            ));
        });
    }

    #[test_traced]
    fn test_shutdown_drains_migrations() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture {
                dual,
                policy,
                working_blocks,
                sync_blocks,
                ..
            } = setup(&context).await;
            let tlf = TlfId::random(&mut context);
            let id = BlockId::random(&mut context);
            let half = KeyHalf::default();
            dual.put(&tlf, &id, b"block", &half).await.unwrap();
            assert_eq!(working_blocks.len(), 1);

            // The write lands in the sync cache and leaves a removal pending
            policy.enable(tlf);
            dual.put(&tlf, &id, b"block", &half).await.unwrap();
            dual.shutdown().await;
            assert!(working_blocks.is_empty());
            assert_eq!(sync_blocks.len(), 1);

            // Nothing left to wait for
            dual.wait_for_deletes().await;
        });
    }

    #[test_traced]
    fn test_selects_instance() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture { dual, policy, .. } = setup(&context).await;
            let synced = TlfId::random(&mut context);
            let unsynced = TlfId::random(&mut context);
            policy.enable(synced);
            let half = KeyHalf::default();
            let a = BlockId::random(&mut context);
            let b = BlockId::random(&mut context);
            let c = BlockId::random(&mut context);
            dual.put(&synced, &a, b"a", &half).await.unwrap();
            dual.put(&synced, &b, b"b", &half).await.unwrap();
            dual.put(&unsynced, &c, b"c", &half).await.unwrap();

            // Marks find the block in either cache
            dual.mark(&a, "live").await.unwrap();
            dual.mark(&c, "live").await.unwrap();
            assert_eq!(
                dual.instance(Which::Sync)
                    .unwrap()
                    .get_metadata(&a)
                    .await
                    .unwrap()
                    .tag,
                "live"
            );
            let (removed, _) = dual.delete_unmarked(&synced, "live").await.unwrap();
            assert_eq!(removed, 1);
            assert!(dual.get(&synced, &a).await.is_ok());
            assert!(matches!(
                dual.get(&synced, &b).await,
                Err(Error::NotFound(_))
            ));

            // Revisions are kept by the cache the folder belongs in
            dual.put_last_unref_rev(&synced, 3).await.unwrap();
            let sync = dual.instance(Which::Sync).unwrap();
            assert_eq!(sync.last_unref_rev(&synced).await.unwrap(), Some(3));
            let working_set = dual.instance(Which::WorkingSet).unwrap();
            assert_eq!(working_set.last_unref_rev(&synced).await.unwrap(), None);
            assert_eq!(dual.last_unref_rev(&synced).await.unwrap(), Some(3));

            dual.add_home_tlf(unsynced, EvictionPriority::PublicHome)
                .await;
            dual.clear_home_tlfs().await;

            let sync = dual.set_sync(None).unwrap();
            assert!(matches!(
                dual.instance(Which::Sync),
                Err(Error::NoSyncCache)
            ));
            sync.shutdown().await;
        });
    }

    #[test_traced]
    fn test_synced_tlf_without_sync() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture {
                dual,
                policy,
                limiter,
                working_blocks,
                ..
            } = setup(&context).await;
            let tlf = TlfId::random(&mut context);
            policy.enable(tlf);
            let half = KeyHalf::default();
            let cached = BlockId::random(&mut context);
            dual.put(&tlf, &cached, b"cached", &half).await.unwrap();

            // Blocks of synced folders have nowhere to go
            let sync = dual.set_sync(None).unwrap();
            let id = BlockId::random(&mut context);
            assert!(matches!(
                dual.put(&tlf, &id, b"block", &half).await,
                Err(Error::Synced(_))
            ));
            assert!(working_blocks.is_empty());
            assert_eq!(limiter.status(Category::WorkingSet).reserved, 0);
            assert_eq!(limiter.status(Category::WorkingSet).used, 0);

            // Only the working set is consulted on reads
            assert!(matches!(
                dual.get(&tlf, &cached).await,
                Err(Error::NotFound(_))
            ));
            assert!(matches!(
                dual.get(&tlf, &id).await,
                Err(Error::NotFound(_))
            ));

            // Reattaching the sync cache restores access
            dual.set_sync(Some(sync));
            assert_eq!(dual.get(&tlf, &cached).await.unwrap().0, b"cached");
            dual.put(&tlf, &id, b"block", &half).await.unwrap();
            assert_eq!(dual.get(&tlf, &id).await.unwrap().0, b"block");
        });
    }

    #[test_traced]
    fn test_without_sync() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let Fixture { dual, .. } = setup(&context).await;
            let sync = dual.set_sync(None).unwrap();
            sync.shutdown().await;
            assert!(dual.sync().is_none());

            let tlf = TlfId::random(&mut context);
            let id = BlockId::random(&mut context);
            dual.put(&tlf, &id, b"block", &KeyHalf::default())
                .await
                .unwrap();
            assert!(dual.get(&tlf, &id).await.is_ok());
            assert_eq!(
                dual.status().await.keys().collect::<Vec<_>>(),
                vec!["working_set"]
            );
            assert!(matches!(
                dual.mark(&BlockId::random(&mut context), "tag").await,
                Err(Error::NotFound(_))
            ));

            // Missing sync cache is tolerated
            dual.shutdown().await;
            assert!(matches!(
                dual.get(&tlf, &id).await,
                Err(Error::Closed)
            ));
        });
    }
}
