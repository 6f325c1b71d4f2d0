//! Mock collaborators for testing a [super::Retriever].

use super::{fired, Drained, Error, Factory, MemoryCache, Prefetcher, Signal};
use crate::{
    Block, BlockId, BlockPointer, CacheLifetime, KeyHalf, KeyMetadata, PrefetchStatus, TlfId,
};
use futures::{channel::oneshot, FutureExt};
use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// A block holding raw contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data {
    contents: Vec<u8>,
}

impl Data {
    /// Create a block holding `contents`.
    pub fn new(contents: Vec<u8>) -> Self {
        Self { contents }
    }

    /// The contents of a [Data] block (or [None] if `block` is of another kind).
    pub fn contents(block: &dyn Block) -> Option<Vec<u8>> {
        block
            .as_any()
            .downcast_ref::<Self>()
            .map(|data| data.contents.clone())
    }
}

impl Block for Data {
    fn new_empty(&self) -> Box<dyn Block> {
        Box::new(Self::default())
    }

    fn set(&mut self, other: &dyn Block) {
        if let Some(contents) = Self::contents(other).or_else(|| Indirect::contents(other)) {
            self.contents = contents;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A second kind of block, to exercise requests for the same pointer with different kinds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Indirect {
    contents: Vec<u8>,
}

impl Indirect {
    /// The contents of an [Indirect] block (or [None] if `block` is of another kind).
    pub fn contents(block: &dyn Block) -> Option<Vec<u8>> {
        block
            .as_any()
            .downcast_ref::<Self>()
            .map(|indirect| indirect.contents.clone())
    }
}

impl Block for Indirect {
    fn new_empty(&self) -> Box<dyn Block> {
        Box::new(Self::default())
    }

    fn set(&mut self, other: &dyn Block) {
        if let Some(contents) = Self::contents(other).or_else(|| Data::contents(other)) {
            self.contents = contents;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Key metadata of a single folder.
#[derive(Clone, Debug, Default)]
pub struct Folder {
    tlf: TlfId,
}

impl Folder {
    /// Create key metadata for the folder `tlf`.
    pub fn new(tlf: TlfId) -> Self {
        Self { tlf }
    }
}

impl KeyMetadata for Folder {
    fn tlf(&self) -> TlfId {
        self.tlf
    }
}

/// A getter serving blocks from memory.
///
/// Payloads read from the disk cache are treated as plaintext.
#[derive(Clone)]
pub struct Getter {
    blocks: Arc<Mutex<HashMap<BlockId, Vec<u8>>>>,
    fetched: Arc<Mutex<Vec<BlockId>>>,
    gate: Signal,
}

impl Default for Getter {
    fn default() -> Self {
        Self::new()
    }
}

impl Getter {
    /// Create a getter that serves fetches immediately.
    pub fn new() -> Self {
        Self {
            blocks: Arc::default(),
            fetched: Arc::default(),
            gate: fired(),
        }
    }

    /// Create a getter that holds every fetch until the returned sender fires (or is dropped).
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (sender, receiver) = oneshot::channel();
        let getter = Self {
            gate: receiver.shared(),
            ..Self::new()
        };
        (getter, sender)
    }

    /// Make a block available for fetching.
    pub fn insert(&self, id: BlockId, contents: Vec<u8>) {
        self.blocks.lock().unwrap().insert(id, contents);
    }

    /// Blocks fetched so far, in the order fetches started.
    pub fn fetched(&self) -> Vec<BlockId> {
        self.fetched.lock().unwrap().clone()
    }
}

impl super::Getter for Getter {
    async fn fetch(
        &self,
        _: &Arc<dyn KeyMetadata>,
        ptr: &BlockPointer,
        block: &mut dyn Block,
    ) -> Result<(), Error> {
        self.fetched.lock().unwrap().push(ptr.id);
        let _ = self.gate.clone().await;
        let contents = self.blocks.lock().unwrap().get(&ptr.id).cloned();
        let contents = contents.ok_or_else(|| Error::Fetch(format!("unknown block {}", ptr.id)))?;
        block.set(&Data::new(contents));
        Ok(())
    }

    fn assemble(
        &self,
        _: &Arc<dyn KeyMetadata>,
        _: &BlockPointer,
        block: &mut dyn Block,
        payload: &[u8],
        _: &KeyHalf,
    ) -> Result<(), Error> {
        block.set(&Data::new(payload.to_vec()));
        Ok(())
    }
}

/// An unbounded [MemoryCache].
#[derive(Default)]
pub struct Memory {
    blocks: Mutex<HashMap<BlockPointer, Vec<u8>>>,
}

impl Memory {
    /// Whether the block referenced by `ptr` is cached.
    pub fn contains(&self, ptr: &BlockPointer) -> bool {
        self.blocks.lock().unwrap().contains_key(ptr)
    }
}

impl MemoryCache for Memory {
    fn get(&self, ptr: &BlockPointer) -> Option<Box<dyn Block>> {
        let contents = self.blocks.lock().unwrap().get(ptr).cloned()?;
        Some(Box::new(Data::new(contents)))
    }

    fn put(
        &self,
        ptr: &BlockPointer,
        _: &TlfId,
        block: &dyn Block,
        _: CacheLifetime,
    ) -> Result<(), Error> {
        let contents = Data::contents(block)
            .or_else(|| Indirect::contents(block))
            .unwrap_or_default();
        self.blocks.lock().unwrap().insert(*ptr, contents);
        Ok(())
    }
}

/// A notification received by a [Recorder].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Process {
        id: BlockId,
        priority: u32,
        status: PrefetchStatus,
    },
    Cancel(BlockId),
    Shutdown,
}

/// A [Factory] whose prefetchers record every notification they receive.
#[derive(Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    created: Mutex<usize>,
}

impl Recorder {
    /// Notifications received by all prefetchers created so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of prefetchers created.
    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

impl Factory for Recorder {
    fn create(&self, _: Option<Signal>) -> Arc<dyn Prefetcher> {
        *self.created.lock().unwrap() += 1;
        Arc::new(Recording {
            events: self.events.clone(),
        })
    }
}

struct Recording {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Prefetcher for Recording {
    fn process_block(
        &self,
        ptr: &BlockPointer,
        _: &dyn Block,
        _: &Arc<dyn KeyMetadata>,
        priority: u32,
        _: CacheLifetime,
        status: PrefetchStatus,
    ) {
        self.events.lock().unwrap().push(Event::Process {
            id: ptr.id,
            priority,
            status,
        });
    }

    fn cancel(&self, ptr: &BlockPointer) {
        self.events.lock().unwrap().push(Event::Cancel(ptr.id));
    }

    fn shutdown(&self) -> Drained {
        self.events.lock().unwrap().push(Event::Shutdown);
        fired()
    }
}
