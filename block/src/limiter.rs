//! Byte accounting shared by every disk cache on a device.
//!
//! A disk cache never decides on its own whether it has room for a block. Before writing, it
//! reserves the block's encoded size with a [Limiter] and, once the write has succeeded or
//! failed, commits or rolls back that reservation. The limiter is the sole source of
//! backpressure: a negative remaining value means "make room first" (for an evictable cache) or
//! "give up" (for a cache that must never drop blocks).
//!
//! [ByteLimiter] enforces a fixed byte budget per [Category].

use std::sync::Mutex;
use thiserror::Error;

/// Errors that can occur when interacting with a [Limiter].
#[derive(Debug, Error)]
pub enum Error {
    #[error("zero-byte reservation")]
    ZeroReservation,
}

/// Which budget an operation draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Blocks of folders that must remain available locally.
    Sync,
    /// Blocks recently used by any folder.
    WorkingSet,
}

impl Category {
    /// Name used to label the category in status maps and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Sync => "sync",
            Category::WorkingSet => "working_set",
        }
    }

    fn index(&self) -> usize {
        match self {
            Category::Sync => 0,
            Category::WorkingSet => 1,
        }
    }
}

/// Snapshot of a [Category]'s budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// Maximum number of bytes the category may hold.
    pub limit: u64,

    /// Bytes held by committed writes.
    pub used: u64,

    /// Bytes reserved by writes that have not yet completed.
    pub reserved: u64,
}

/// Tracks byte usage against a budget.
pub trait Limiter: Send + Sync {
    /// Reserve `bytes` for an upcoming write.
    ///
    /// Returns the number of bytes that would remain after the reservation. If negative, nothing
    /// was reserved and the caller must make room (or give up) before trying again.
    fn reserve(&self, category: Category, bytes: u64) -> Result<i64, Error>;

    /// Complete a successful [Limiter::reserve], either committing the bytes as used or returning
    /// them to the budget.
    fn commit_or_rollback(&self, category: Category, bytes: u64, commit: bool);

    /// Return bytes of deleted blocks to the budget.
    fn release(&self, category: Category, bytes: u64);

    /// Account for `bytes` already held by a cache that just started.
    fn on_enable(&self, category: Category, bytes: u64);

    /// Stop accounting for `bytes` held by a cache that is shutting down.
    fn on_disable(&self, category: Category, bytes: u64);

    /// Snapshot the budget of `category`.
    fn status(&self, category: Category) -> Status;
}

#[derive(Default)]
struct Tracker {
    limit: u64,
    used: u64,
    reserved: u64,
}

impl Tracker {
    fn remaining(&self, bytes: u64) -> i64 {
        self.limit as i64 - self.used as i64 - self.reserved as i64 - bytes as i64
    }
}

/// A [Limiter] with a fixed byte budget per [Category].
pub struct ByteLimiter {
    trackers: Mutex<[Tracker; 2]>,
}

impl ByteLimiter {
    /// Create a limiter that allows up to `sync` bytes for [Category::Sync] and up to
    /// `working_set` bytes for [Category::WorkingSet].
    pub fn new(sync: u64, working_set: u64) -> Self {
        Self {
            trackers: Mutex::new([
                Tracker {
                    limit: sync,
                    ..Default::default()
                },
                Tracker {
                    limit: working_set,
                    ..Default::default()
                },
            ]),
        }
    }
}

impl Limiter for ByteLimiter {
    fn reserve(&self, category: Category, bytes: u64) -> Result<i64, Error> {
        if bytes == 0 {
            return Err(Error::ZeroReservation);
        }
        let mut trackers = self.trackers.lock().unwrap();
        let tracker = &mut trackers[category.index()];
        let remaining = tracker.remaining(bytes);
        if remaining >= 0 {
            tracker.reserved += bytes;
        }
        Ok(remaining)
    }

    fn commit_or_rollback(&self, category: Category, bytes: u64, commit: bool) {
        let mut trackers = self.trackers.lock().unwrap();
        let tracker = &mut trackers[category.index()];
        tracker.reserved = tracker.reserved.saturating_sub(bytes);
        if commit {
            tracker.used += bytes;
        }
    }

    fn release(&self, category: Category, bytes: u64) {
        let mut trackers = self.trackers.lock().unwrap();
        let tracker = &mut trackers[category.index()];
        tracker.used = tracker.used.saturating_sub(bytes);
    }

    fn on_enable(&self, category: Category, bytes: u64) {
        self.trackers.lock().unwrap()[category.index()].used += bytes;
    }

    fn on_disable(&self, category: Category, bytes: u64) {
        self.release(category, bytes);
    }

    fn status(&self, category: Category) -> Status {
        let trackers = self.trackers.lock().unwrap();
        let tracker = &trackers[category.index()];
        Status {
            limit: tracker.limit,
            used: tracker.used,
            reserved: tracker.reserved,
        }
    }
}
