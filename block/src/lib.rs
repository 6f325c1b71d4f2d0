//! Retrieve, coalesce, and cache encrypted blocks.
//!
//! A content-addressed file system client rarely asks for a block only once. Many readers may
//! race for the same block, prefetchers speculatively request descendants, and blocks that were
//! recently fetched should survive restarts. This crate provides the machinery to do all of that
//! efficiently:
//!
//! * [retriever::Retriever] coalesces concurrent requests for the same block into a single fetch,
//!   orders outstanding work by priority, and drives a bounded pool of workers.
//! * [disk::Cache] persists encrypted blocks across three key-value stores, tracks their usage
//!   against an external [limiter::Limiter], and evicts approximately least-recently-used blocks
//!   when space runs out.
//! * [disk::dual::Dual] routes blocks between a "sync" cache (for folders that must always be
//!   available locally) and an evictable "working set" cache.
//!
//! # Status
//!
//! `commonware-block` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_utils::hex;
use rand::RngCore;
use std::{
    any::{Any, TypeId},
    fmt::{Debug, Display, Formatter},
};

pub mod cancel;
pub mod disk;
pub mod heap;
pub mod limiter;
pub mod retriever;
pub mod store;

/// Requests at or above this priority are served by on-demand workers.
pub const ON_DEMAND_PRIORITY: u32 = 1 << 30;

/// Default priority of prefetch requests.
pub const PREFETCH_PRIORITY: u32 = 1 << 20;

/// Requests at or below this priority are released to prefetch workers at a throttled rate.
pub const THROTTLE_PRIORITY: u32 = 1 << 15;

macro_rules! fixed_bytes {
    ($name:ident, $size:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $size]);

        impl $name {
            /// Create a new instance from raw bytes.
            pub const fn new(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }

            /// Generate a uniformly random instance.
            pub fn random<R: RngCore>(rng: &mut R) -> Self {
                let mut bytes = [0u8; $size];
                rng.fill_bytes(&mut bytes);
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = CodecError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                let bytes: [u8; $size] = value
                    .try_into()
                    .map_err(|_| CodecError::Invalid(stringify!($name), "wrong length"))?;
                Ok(Self(bytes))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }

        impl FixedSize for $name {
            const SIZE: usize = $size;
        }

        impl Write for $name {
            fn write(&self, buf: &mut impl BufMut) {
                buf.put_slice(&self.0);
            }
        }

        impl Read for $name {
            type Cfg = ();

            fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
                <[u8; $size]>::read(buf).map(Self)
            }
        }
    };
}

fixed_bytes!(BlockId, 32, "Content-derived identifier of an encrypted block.");
fixed_bytes!(TlfId, 16, "Identifier of a top-level folder (the unit of sync policy).");
fixed_bytes!(
    KeyHalf,
    32,
    "Server-side half of the key needed to decrypt a block."
);

impl BlockId {
    /// The largest possible block identifier.
    pub const MAX: Self = Self([0xff; 32]);

    /// Generate a random identifier that falls in `[0, fraction)` of the identifier space.
    ///
    /// Used to pick an eviction pivot such that scanning forward from it is expected to
    /// observe a given share of all stored blocks.
    pub fn random_below<R: RngCore>(rng: &mut R, fraction: f64) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);

        // Bound the leading word, the remaining bytes never carry into it
        let bound = (fraction.clamp(0.0, 1.0) * u64::MAX as f64) as u64;
        let prefix = if bound == 0 {
            0
        } else {
            rng.next_u64() % bound
        };
        bytes[..8].copy_from_slice(&prefix.to_be_bytes());
        Self(bytes)
    }
}

/// A reference to an encrypted block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockPointer {
    /// Identifier of the referenced block.
    pub id: BlockId,

    /// Key generation used to encrypt the block.
    pub key_gen: u32,

    /// Format version of the block's contents.
    pub data_version: u32,
}

impl BlockPointer {
    /// Create a pointer at the given data version.
    pub fn new(id: BlockId, data_version: u32) -> Self {
        Self {
            id,
            key_gen: 1,
            data_version,
        }
    }
}

/// Progress of the background readahead of a block's descendants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrefetchStatus {
    /// No prefetch has been started.
    #[default]
    None,
    /// A prefetch has been started but not completed.
    Triggered,
    /// The block and all of its descendants have been fetched.
    Finished,
}

/// How long a block should be retained by the in-memory cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheLifetime {
    /// Do not retain the block.
    #[default]
    None,
    /// Retain the block until it is evicted.
    Transient,
    /// Retain the block until it is explicitly removed.
    Permanent,
}

/// A decrypted block that can be filled by a fetch.
pub trait Block: Any + Send + Sync {
    /// Allocate an empty block of the same kind.
    fn new_empty(&self) -> Box<dyn Block>;

    /// Overwrite this block with the contents of `other`.
    ///
    /// Callers only ever pass blocks of the same kind.
    fn set(&mut self, other: &dyn Block);

    /// Access the block as [Any] (to downcast in [Block::set]).
    fn as_any(&self) -> &dyn Any;
}

/// The dynamic kind of a block, used to keep requests for differently-typed
/// destinations apart.
pub fn kind(block: &dyn Block) -> TypeId {
    block.as_any().type_id()
}

/// Metadata describing how to decrypt blocks of a folder.
pub trait KeyMetadata: Send + Sync {
    /// The folder the metadata belongs to.
    fn tlf(&self) -> TlfId;
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_random_below() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1_000 {
            let id = BlockId::random_below(&mut rng, 0.25);
            assert!(id.as_ref()[0] < 0x40);
        }
        for _ in 0..10 {
            assert_eq!(BlockId::random_below(&mut rng, 0.0).as_ref()[..8], [0u8; 8]);
        }
    }

    #[test]
    fn test_codec() {
        let id = BlockId::random(&mut StdRng::seed_from_u64(1));
        let encoded = id.encode();
        assert_eq!(encoded.len(), BlockId::SIZE);
        assert_eq!(BlockId::decode(encoded).unwrap(), id);
        assert!(TlfId::try_from(&[0u8; 3][..]).is_err());
    }

    #[test]
    fn test_prefetch_status_order() {
        assert!(PrefetchStatus::Finished > PrefetchStatus::Triggered);
        assert!(PrefetchStatus::Triggered > PrefetchStatus::None);
    }
}
