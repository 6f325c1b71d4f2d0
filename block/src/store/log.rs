//! A [Store] persisted as an append-only log of checksummed batches.
//!
//! Every call to [Store::put] or [Store::write] appends one record to the current blob of a
//! [Storage] partition:
//!
//! ```text
//! +---+---+---+---+------------ ... ------------+---+---+---+---+
//! |   body len    |             body             |  crc32(body)  |
//! +---+---+---+---+------------ ... ------------+---+---+---+---+
//! ```
//!
//! A body holds the changes of one batch (`count | (key_len | key | op | [value_len | value])*`),
//! so a batch is applied completely or not at all. Keys and the location of their value are kept
//! in an ordered in-memory index, which serves [Store::range] and [Store::scan] without touching
//! the log.
//!
//! Blobs are named by their generation (a big-endian `u64`). Once the dead bytes of the current
//! generation exceed both the configured threshold and the live bytes, all live entries are
//! rewritten as a single record into the next generation and the old blob is removed. On
//! [Log::init], the newest generation holding at least one valid record wins, trailing bytes
//! that do not form a valid record are truncated, and every other generation is removed.

use super::{Batch, Error, Store};
use async_lock::Mutex;
use commonware_runtime::{Blob, Error as RError, Storage};
use commonware_utils::hex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Default number of dead bytes tolerated before compacting.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 1 << 20;

const LEN: usize = 4;
const CHECKSUM: usize = 4;
const OP_DELETE: u8 = 0;
const OP_PUT: u8 = 1;

/// Configuration for [Log].
#[derive(Clone, Debug)]
pub struct Config {
    /// Partition holding the log blobs.
    pub partition: String,

    /// Dead bytes tolerated before compacting (compaction also requires dead bytes to exceed
    /// live bytes).
    pub compaction_threshold: u64,
}

impl Config {
    /// Create a configuration for `partition` with the default compaction threshold.
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Location {
    offset: u64,
    len: u32,
}

/// A change decoded from (or encoded into) a record: the key and, for puts, the position of
/// the value relative to the start of the record.
type Change = (Vec<u8>, Option<(usize, u32)>);

struct State<B: Blob> {
    blob: B,
    generation: u64,
    size: u64,
    index: BTreeMap<Vec<u8>, Location>,
    live: u64,
}

impl<B: Blob> State<B> {
    fn apply(&mut self, base: u64, changes: Vec<Change>) {
        for (key, value) in changes {
            if let Some(old) = self.index.remove(&key) {
                self.live -= key.len() as u64 + old.len as u64;
            }
            if let Some((position, len)) = value {
                self.live += key.len() as u64 + len as u64;
                self.index.insert(
                    key,
                    Location {
                        offset: base + position as u64,
                        len,
                    },
                );
            }
        }
    }

    fn dead(&self) -> u64 {
        self.size.saturating_sub(self.live)
    }

    async fn read(&self, location: Location) -> Result<Vec<u8>, Error> {
        let buf = self
            .blob
            .read_at(vec![0u8; location.len as usize], location.offset)
            .await?;
        Ok(buf.as_ref().to_vec())
    }
}

/// A [Store] backed by a [Storage] partition.
pub struct Log<E: Storage> {
    context: E,
    partition: String,
    threshold: u64,
    state: Arc<Mutex<State<E::Blob>>>,
}

impl<E: Storage> Clone for Log<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            partition: self.partition.clone(),
            threshold: self.threshold,
            state: self.state.clone(),
        }
    }
}

/// Encode `changes` as a record, returning the record and the decoded form of its changes.
fn encode(changes: &[(Vec<u8>, Option<Vec<u8>>)]) -> (Vec<u8>, Vec<Change>) {
    let mut record = vec![0u8; LEN];
    let mut decoded = Vec::with_capacity(changes.len());
    record.extend_from_slice(&(changes.len() as u32).to_be_bytes());
    for (key, value) in changes {
        record.extend_from_slice(&(key.len() as u32).to_be_bytes());
        record.extend_from_slice(key);
        match value {
            Some(value) => {
                record.push(OP_PUT);
                record.extend_from_slice(&(value.len() as u32).to_be_bytes());
                decoded.push((key.clone(), Some((record.len(), value.len() as u32))));
                record.extend_from_slice(value);
            }
            None => {
                record.push(OP_DELETE);
                decoded.push((key.clone(), None));
            }
        }
    }
    let body_len = (record.len() - LEN) as u32;
    record[..LEN].copy_from_slice(&body_len.to_be_bytes());
    let checksum = crc32fast::hash(&record[LEN..]);
    record.extend_from_slice(&checksum.to_be_bytes());
    (record, decoded)
}

fn take_u32(buf: &[u8], cursor: &mut usize) -> Option<u32> {
    let bytes = buf.get(*cursor..*cursor + 4)?;
    *cursor += 4;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Decode the record at the start of `buf`, returning its changes and its length.
///
/// Returns `None` if `buf` does not start with a complete record whose checksum matches.
fn decode(buf: &[u8]) -> Option<(Vec<Change>, usize)> {
    let mut cursor = 0;
    let body_len = take_u32(buf, &mut cursor)? as usize;
    let end = LEN.checked_add(body_len)?;
    let checksum = buf.get(end..end.checked_add(CHECKSUM)?)?;
    let body = &buf[LEN..end];
    if crc32fast::hash(body).to_be_bytes() != checksum {
        return None;
    }

    // Positions are relative to the start of the record
    let record = &buf[..end];
    let count = take_u32(record, &mut cursor)?;
    let mut changes = Vec::new();
    for _ in 0..count {
        let key_len = take_u32(record, &mut cursor)? as usize;
        let key = record.get(cursor..cursor.checked_add(key_len)?)?.to_vec();
        cursor += key_len;
        let op = *record.get(cursor)?;
        cursor += 1;
        match op {
            OP_PUT => {
                let len = take_u32(record, &mut cursor)?;
                if cursor.checked_add(len as usize)? > end {
                    return None;
                }
                changes.push((key, Some((cursor, len))));
                cursor += len as usize;
            }
            OP_DELETE => changes.push((key, None)),
            _ => return None,
        }
    }
    if cursor != end {
        return None;
    }
    Some((changes, end + CHECKSUM))
}

impl<E: Storage> Log<E> {
    /// Open (or create) the log stored in `cfg.partition`.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let names = match context.scan(&cfg.partition).await {
            Ok(names) => names,
            Err(RError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut generations = Vec::with_capacity(names.len());
        for name in names {
            let Ok(bytes) = <[u8; 8]>::try_from(name.as_slice()) else {
                return Err(Error::InvalidBlobName(hex(&name)));
            };
            generations.push(u64::from_be_bytes(bytes));
        }
        generations.sort_unstable_by(|a, b| b.cmp(a));

        // Pick the newest generation holding a valid record
        let mut state = None;
        for generation in generations {
            if state.is_some() {
                context
                    .remove(&cfg.partition, Some(&generation.to_be_bytes()))
                    .await?;
                debug!(generation, "removed stale generation");
                continue;
            }
            let (blob, len) = context
                .open(&cfg.partition, &generation.to_be_bytes())
                .await?;
            match Self::replay(blob, generation, len).await? {
                Some(replayed) => state = Some(replayed),
                None => {
                    context
                        .remove(&cfg.partition, Some(&generation.to_be_bytes()))
                        .await?;
                    debug!(generation, "removed generation without records");
                }
            }
        }
        let state = match state {
            Some(state) => state,
            None => {
                let (blob, _) = context.open(&cfg.partition, &0u64.to_be_bytes()).await?;
                blob.resize(0).await?;
                State {
                    blob,
                    generation: 0,
                    size: 0,
                    index: BTreeMap::new(),
                    live: 0,
                }
            }
        };
        debug!(
            partition = %cfg.partition,
            generation = state.generation,
            entries = state.index.len(),
            "opened log"
        );

        Ok(Self {
            context,
            partition: cfg.partition,
            threshold: cfg.compaction_threshold,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Rebuild the index of `blob`, truncating any invalid tail.
    ///
    /// Returns `None` if the blob holds no valid record.
    async fn replay(
        blob: E::Blob,
        generation: u64,
        len: u64,
    ) -> Result<Option<State<E::Blob>>, Error> {
        let buf = if len == 0 {
            Vec::new()
        } else {
            blob.read_at(vec![0u8; len as usize], 0)
                .await?
                .as_ref()
                .to_vec()
        };

        let mut state = State {
            blob,
            generation,
            size: 0,
            index: BTreeMap::new(),
            live: 0,
        };
        let mut records = 0;
        while let Some((changes, record_len)) = decode(&buf[state.size as usize..]) {
            state.apply(state.size, changes);
            state.size += record_len as u64;
            records += 1;
        }
        if records == 0 {
            return Ok(None);
        }
        if state.size < len {
            warn!(
                generation,
                valid = state.size,
                len,
                "truncating invalid tail"
            );
            state.blob.resize(state.size).await?;
            state.blob.sync().await?;
        }
        Ok(Some(state))
    }

    /// Append `changes` as a single record.
    async fn append(&self, changes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<(), Error> {
        if changes.is_empty() {
            return Ok(());
        }
        let (record, decoded) = encode(&changes);
        let mut state = self.state.lock().await;
        let offset = state.size;
        let len = record.len() as u64;
        state.blob.write_at(record, offset).await?;
        state.blob.sync().await?;
        state.apply(offset, decoded);
        state.size += len;

        if state.dead() > self.threshold && state.dead() > state.live {
            self.compact(&mut state).await?;
        }
        Ok(())
    }

    /// Rewrite all live entries into the next generation.
    async fn compact(&self, state: &mut State<E::Blob>) -> Result<(), Error> {
        let mut changes = Vec::with_capacity(state.index.len());
        for (key, location) in state.index.iter() {
            changes.push((key.clone(), Some(state.read(*location).await?)));
        }
        let (record, decoded) = encode(&changes);

        let generation = state.generation + 1;
        let (blob, _) = self
            .context
            .open(&self.partition, &generation.to_be_bytes())
            .await?;
        blob.resize(0).await?;
        let len = record.len() as u64;
        blob.write_at(record, 0).await?;
        blob.sync().await?;

        let old = state.generation;
        let reclaimed = state.dead();
        state.blob = blob;
        state.generation = generation;
        state.size = 0;
        state.index.clear();
        state.live = 0;
        state.apply(0, decoded);
        state.size = len;
        self.context
            .remove(&self.partition, Some(&old.to_be_bytes()))
            .await?;
        debug!(generation, reclaimed, "compacted log");
        Ok(())
    }

    /// Current generation (incremented by each compaction).
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
}

impl<E: Storage> Store for Log<E> {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let state = self.state.lock().await;
        let Some(location) = state.index.get(key).copied() else {
            return Ok(None);
        };
        Ok(Some(state.read(location).await?))
    }

    async fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.state.lock().await.index.contains_key(key))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.append(vec![(key.to_vec(), Some(value.to_vec()))])
            .await
    }

    async fn write(&self, batch: Batch) -> Result<(), Error> {
        self.append(batch.into_iter().collect()).await
    }

    async fn range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        if start >= end {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        let locations: Vec<_> = state
            .index
            .range(start.to_vec()..end.to_vec())
            .take(limit)
            .map(|(key, location)| (key.clone(), *location))
            .collect();
        let mut entries = Vec::with_capacity(locations.len());
        for (key, location) in locations {
            entries.push((key, state.read(location).await?));
        }
        Ok(entries)
    }

    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let state = self.state.lock().await;
        let mut entries = Vec::with_capacity(state.index.len());
        for (key, location) in state.index.iter() {
            entries.push((key.clone(), state.read(*location).await?));
        }
        Ok(entries)
    }
}
