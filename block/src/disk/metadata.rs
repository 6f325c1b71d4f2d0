//! Records persisted by a [super::Cache].

use crate::{KeyHalf, PrefetchStatus, TlfId};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};

/// Longest tag [Metadata] can persist.
pub const MAX_TAG_LEN: usize = u16::MAX as usize;

/// Per-block bookkeeping stored in the metadata store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Folder that owns the block.
    pub tlf: TlfId,

    /// Encoded size of the block's [Entry].
    pub size: u32,

    /// Last access, in milliseconds since the UNIX epoch.
    pub lru: u64,

    /// Whether a prefetch of the block's descendants was started.
    pub triggered: bool,

    /// Whether the block and all of its descendants have been fetched.
    pub finished: bool,

    /// Tag set by the last mark (empty if never marked).
    pub tag: String,
}

impl Metadata {
    /// Create metadata for a newly stored block.
    pub fn new(tlf: TlfId, size: u32) -> Self {
        Self {
            tlf,
            size,
            ..Default::default()
        }
    }

    /// The [PrefetchStatus] derived from the stored flags.
    pub fn status(&self) -> PrefetchStatus {
        if self.finished {
            PrefetchStatus::Finished
        } else if self.triggered {
            PrefetchStatus::Triggered
        } else {
            PrefetchStatus::None
        }
    }

    /// Overwrite the stored flags with `status`.
    pub fn set_status(&mut self, status: PrefetchStatus) {
        self.triggered = status >= PrefetchStatus::Triggered;
        self.finished = status == PrefetchStatus::Finished;
    }

    /// Older working set caches may have persisted `finished` for blocks whose prefetch only
    /// started. Demote such records on read.
    pub(super) fn demote_finished(&mut self) {
        if self.finished {
            self.triggered = true;
        }
        self.finished = false;
    }
}

impl Write for Metadata {
    fn write(&self, buf: &mut impl BufMut) {
        self.tlf.write(buf);
        buf.put_u32(self.size);
        buf.put_u64(self.lru);
        self.triggered.write(buf);
        self.finished.write(buf);
        buf.put_u16(self.tag.len() as u16);
        buf.put_slice(self.tag.as_bytes());
    }
}

impl EncodeSize for Metadata {
    fn encode_size(&self) -> usize {
        TlfId::SIZE + u32::SIZE + u64::SIZE + bool::SIZE + bool::SIZE + u16::SIZE + self.tag.len()
    }
}

impl Read for Metadata {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let tlf = TlfId::read(buf)?;
        let size = u32::read(buf)?;
        let lru = u64::read(buf)?;
        let triggered = bool::read(buf)?;
        let finished = bool::read(buf)?;
        let len = u16::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        let mut tag = vec![0u8; len];
        buf.copy_to_slice(&mut tag);
        let tag = String::from_utf8(tag).map_err(|_| CodecError::Invalid("Metadata", "tag"))?;
        Ok(Self {
            tlf,
            size,
            lru,
            triggered,
            finished,
            tag,
        })
    }
}

/// An encrypted block as stored in the block store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Encrypted block contents.
    pub payload: Vec<u8>,

    /// Server half of the block's decryption key.
    pub half: KeyHalf,
}

impl Write for Entry {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        self.half.write(buf);
    }
}

impl EncodeSize for Entry {
    fn encode_size(&self) -> usize {
        u32::SIZE + self.payload.len() + KeyHalf::SIZE
    }
}

impl Read for Entry {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let len = u32::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        let mut payload = vec![0u8; len];
        buf.copy_to_slice(&mut payload);
        let half = KeyHalf::read(buf)?;
        Ok(Self { payload, half })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_codec::{DecodeExt, Encode};

    #[test]
    fn test_metadata_codec() {
        let mut metadata = Metadata::new(TlfId::new([7; 16]), 600);
        metadata.lru = 1_700_000_000_000;
        metadata.set_status(PrefetchStatus::Triggered);

        let encoded = metadata.encode();
        assert_eq!(encoded.len(), 32);
        assert_eq!(Metadata::decode(encoded).unwrap(), metadata);

        metadata.tag = "gc-1".into();
        let encoded = metadata.encode();
        assert_eq!(encoded.len(), 36);
        assert_eq!(metadata.encode_size(), 36);
        assert_eq!(Metadata::decode(encoded).unwrap(), metadata);

        // Truncated tag
        let encoded = metadata.encode();
        assert!(matches!(
            Metadata::decode(&encoded[..35]),
            Err(CodecError::EndOfBuffer)
        ));
    }

    #[test]
    fn test_metadata_rejects_invalid_fields() {
        // Flags
        let mut encoded = Metadata::new(TlfId::default(), 1).encode().to_vec();
        encoded[29] = 2;
        assert!(Metadata::decode(Bytes::from(encoded)).is_err());

        // Tags must be utf-8
        let mut metadata = Metadata::new(TlfId::default(), 1);
        metadata.tag = "ab".into();
        let mut encoded = metadata.encode().to_vec();
        *encoded.last_mut().unwrap() = 0xff;
        assert!(matches!(
            Metadata::decode(Bytes::from(encoded)),
            Err(CodecError::Invalid("Metadata", "tag"))
        ));
    }

    #[test]
    fn test_status_flags() {
        let mut metadata = Metadata::default();
        for status in [
            PrefetchStatus::Finished,
            PrefetchStatus::None,
            PrefetchStatus::Triggered,
        ] {
            metadata.set_status(status);
            assert_eq!(metadata.status(), status);
        }

        metadata.set_status(PrefetchStatus::Finished);
        metadata.demote_finished();
        assert_eq!(metadata.status(), PrefetchStatus::Triggered);
        assert!(!metadata.finished);
    }

    #[test]
    fn test_entry_codec() {
        let entry = Entry {
            payload: vec![0xab; 564],
            half: KeyHalf::new([3; 32]),
        };
        let encoded = entry.encode();
        assert_eq!(encoded.len(), 600);
        assert_eq!(entry.encode_size(), 600);
        assert_eq!(Entry::decode(encoded).unwrap(), entry);

        // Length prefix larger than the remaining payload
        let mut truncated = entry.encode().to_vec();
        truncated.truncate(100);
        assert!(matches!(
            Entry::decode(Bytes::from(truncated)),
            Err(CodecError::EndOfBuffer)
        ));
    }
}
