//! Key and value codecs.
//!
//! Codecs are implemented directly on the key/value types. Each codec has a
//! stable one-byte id that is recorded in a tree's root bucket when the tree
//! is created; loading a tree verifies the recorded ids against the codecs
//! the caller compiled in and rejects mismatches.

use std::fmt;

use crate::error::{BonsaiError, Result};

/// Codec for key types. Keys are compared through their natural `Ord`, and
/// the encoding must be self-delimiting: [`encoded_len_at`] recovers an
/// encoded key's length from the byte stream so entries can be unpacked from
/// a bucket payload.
///
/// [`encoded_len_at`]: KeyCodec::encoded_len_at
pub trait KeyCodec: Ord + Clone + Send + Sync + 'static {
    /// Stable on-disk id of this codec.
    const CODEC_ID: u8;

    /// Length of this key's encoding in bytes.
    fn encoded_len(&self) -> usize;

    /// Appends the encoding to `dst`.
    fn encode_into(&self, dst: &mut Vec<u8>);

    /// Decodes one key from the front of `src`.
    fn decode(src: &[u8]) -> Result<Self>;

    /// Length in bytes of the encoded key at the front of `src`.
    fn encoded_len_at(src: &[u8]) -> Result<usize>;
}

/// Codec for value types. Same contract as [`KeyCodec`] minus ordering.
pub trait ValCodec: Clone + PartialEq + Send + Sync + 'static {
    /// Stable on-disk id of this codec.
    const CODEC_ID: u8;

    /// Length of this value's encoding in bytes.
    fn encoded_len(&self) -> usize;

    /// Appends the encoding to `dst`.
    fn encode_into(&self, dst: &mut Vec<u8>);

    /// Decodes one value from the front of `src`.
    fn decode(src: &[u8]) -> Result<Self>;

    /// Length in bytes of the encoded value at the front of `src`.
    fn encoded_len_at(src: &[u8]) -> Result<usize>;
}

fn take<const N: usize>(src: &[u8], what: &'static str) -> Result<[u8; N]> {
    src.get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(BonsaiError::Corruption(what))
}

impl KeyCodec for u64 {
    const CODEC_ID: u8 = 10;

    fn encoded_len(&self) -> usize {
        8
    }

    fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(take::<8>(src, "u64 key truncated")?))
    }

    fn encoded_len_at(src: &[u8]) -> Result<usize> {
        if src.len() < 8 {
            return Err(BonsaiError::Corruption("u64 key truncated"));
        }
        Ok(8)
    }
}

impl ValCodec for u64 {
    const CODEC_ID: u8 = 10;

    fn encoded_len(&self) -> usize {
        8
    }

    fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(take::<8>(src, "u64 value truncated")?))
    }

    fn encoded_len_at(src: &[u8]) -> Result<usize> {
        if src.len() < 8 {
            return Err(BonsaiError::Corruption("u64 value truncated"));
        }
        Ok(8)
    }
}

impl ValCodec for i32 {
    const CODEC_ID: u8 = 8;

    fn encoded_len(&self) -> usize {
        4
    }

    fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(i32::from_be_bytes(take::<4>(src, "i32 value truncated")?))
    }

    fn encoded_len_at(src: &[u8]) -> Result<usize> {
        if src.len() < 4 {
            return Err(BonsaiError::Corruption("i32 value truncated"));
        }
        Ok(4)
    }
}

/// Length-prefixed byte strings (`u16` length, then the bytes).
impl ValCodec for Vec<u8> {
    const CODEC_ID: u8 = 17;

    fn encoded_len(&self) -> usize {
        2 + self.len()
    }

    fn encode_into(&self, dst: &mut Vec<u8>) {
        let len = u16::try_from(self.len()).expect("byte string longer than u16");
        dst.extend_from_slice(&len.to_be_bytes());
        dst.extend_from_slice(self);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let len = u16::from_be_bytes(take::<2>(src, "byte string truncated")?) as usize;
        src.get(2..2 + len)
            .map(<[u8]>::to_vec)
            .ok_or(BonsaiError::Corruption("byte string truncated"))
    }

    fn encoded_len_at(src: &[u8]) -> Result<usize> {
        let len = u16::from_be_bytes(take::<2>(src, "byte string truncated")?) as usize;
        if src.len() < 2 + len {
            return Err(BonsaiError::Corruption("byte string truncated"));
        }
        Ok(2 + len)
    }
}

/// Identity of a record in the canonical graph-database client: the cluster
/// the record lives in plus its position within that cluster. Used as the
/// key type of per-vertex edge bags.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId {
    pub cluster: i16,
    pub position: i64,
}

impl RecordId {
    pub const fn new(cluster: i16, position: i64) -> Self {
        Self { cluster, position }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl KeyCodec for RecordId {
    const CODEC_ID: u8 = 16;

    fn encoded_len(&self) -> usize {
        10
    }

    fn encode_into(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.cluster.to_be_bytes());
        dst.extend_from_slice(&self.position.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 10 {
            return Err(BonsaiError::Corruption("record id truncated"));
        }
        let cluster = i16::from_be_bytes(src[0..2].try_into().unwrap());
        let position = i64::from_be_bytes(src[2..10].try_into().unwrap());
        Ok(Self { cluster, position })
    }

    fn encoded_len_at(src: &[u8]) -> Result<usize> {
        if src.len() < 10 {
            return Err(BonsaiError::Corruption("record id truncated"));
        }
        Ok(10)
    }
}
