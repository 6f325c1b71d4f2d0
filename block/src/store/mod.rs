//! Ordered key-value stores that back a [crate::disk::Cache].
//!
//! A disk cache needs point lookups, atomic batches of writes and deletes, and ordered range
//! iteration (to sample eviction candidates starting from a random pivot). Any store offering
//! those operations can implement [Store].
//!
//! [Log] persists entries in a blob of a [commonware_runtime::Storage] partition, so a cache
//! built on it survives restarts. [Memory] keeps all entries in an ordered in-memory map (and can
//! be shared across cache restarts within a process by cloning it).

use std::{collections::BTreeMap, future::Future};
use thiserror::Error;

mod log;
pub use log::{Config as LogConfig, Log, DEFAULT_COMPACTION_THRESHOLD};
mod memory;
pub use memory::Memory;

/// Errors that can occur when interacting with a [Store].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("invalid blob name: {0}")]
    InvalidBlobName(String),
}

/// A set of changes applied atomically by [Store::write].
///
/// If a value is `Some`, the key is being created or updated. If a value is `None`, the key
/// is being deleted.
#[derive(Debug, Default)]
pub struct Batch {
    diff: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value` once the batch is written.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.diff.insert(key, Some(value));
    }

    /// Delete `key` once the batch is written.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.diff.insert(key, None);
    }

    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.diff.len()
    }

    /// Whether the batch contains no changes.
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = (Vec<u8>, Option<Vec<u8>>);
    type IntoIter = std::collections::btree_map::IntoIter<Vec<u8>, Option<Vec<u8>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.diff.into_iter()
    }
}

/// An ordered key-value store.
pub trait Store: Clone + Send + Sync + 'static {
    /// Get the value stored at `key`.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    /// Whether a value is stored at `key`.
    fn has(&self, key: &[u8]) -> impl Future<Output = Result<bool, Error>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Set `key` to `value`.
    fn put(&self, key: &[u8], value: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Apply all changes in `batch` atomically.
    fn write(&self, batch: Batch) -> impl Future<Output = Result<(), Error>> + Send;

    /// Return up to `limit` entries with keys in `[start, end)`, in key order.
    fn range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>, Error>> + Send;

    /// Return every entry, in key order.
    fn scan(&self) -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>, Error>> + Send;
}
