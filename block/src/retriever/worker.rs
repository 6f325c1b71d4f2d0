//! Workers that claim retrievals from the heap and fetch them.

use super::{queue::Record, Error, Getter, Retriever};
use crate::disk::DiskCache;
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Serves retrievals whenever its lane is signaled.
pub(super) struct Worker<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> {
    retriever: Retriever<E, G, D>,
    lane: Arc<async_lock::Mutex<mpsc::Receiver<()>>>,
    stopped: oneshot::Receiver<()>,
}

impl<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> Worker<E, G, D> {
    pub(super) fn new(
        retriever: Retriever<E, G, D>,
        lane: Arc<async_lock::Mutex<mpsc::Receiver<()>>>,
        stopped: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            retriever,
            lane,
            stopped,
        }
    }

    pub(super) async fn run(self) {
        let Self {
            retriever,
            lane,
            mut stopped,
        } = self;
        retriever.metrics().workers.inc();
        loop {
            let lane = lane.clone();
            select! {
                _ = &mut stopped => {
                    debug!("worker stopped");
                    break;
                },
                signal = async move { lane.lock().await.next().await } => {
                    if signal.is_none() {
                        debug!("lane closed");
                        break;
                    }

                    // Another worker may have emptied the heap already
                    let Some(record) = retriever.pop() else {
                        trace!("nothing to retrieve");
                        continue;
                    };
                    retriever.process(record).await;
                },
            }
        }
        retriever.metrics().workers.dec();
    }
}

impl<E: Spawner + Clock + RuntimeMetrics, G: Getter, D: DiskCache> Retriever<E, G, D> {
    /// Fetch a claimed retrieval and finalize it.
    async fn process(&self, record: Arc<Record>) {
        let token = record.token();
        if token.is_canceled() {
            self.finalize(&record, Err(Error::Canceled)).await;
            return;
        }
        let Some(mut block) = record.new_empty() else {
            self.finalize(&record, Err(Error::Canceled)).await;
            return;
        };

        // Give up as soon as every caller does
        self.metrics().fetches.inc();
        let mut fetched = None;
        select! {
            _ = token.canceled() => {
                trace!(id = ?record.ptr().id, "fetch canceled");
            },
            result = self.getter().fetch(record.kmd(), record.ptr(), block.as_mut()) => {
                fetched = Some(result);
            },
        }
        let outcome = match fetched {
            Some(Ok(())) => Ok(block),
            Some(Err(err)) => Err(err),
            None => Err(Error::Canceled),
        };
        self.finalize(&record, outcome).await;
    }
}
