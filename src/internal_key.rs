//! Internal key format and ordering.
//!
//! Entries are ordered by the tuple `(user_key ASC, seqno DESC, kind)`, so a
//! forward scan from a seek point meets the newest visible version of a user
//! key first. On disk a key is `len u32 ∥ user_key ∥ tag u64` where the tag
//! packs `(seqno << 8) | kind`, leaving 56 bits for the sequence counter.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Largest sequence number representable in a tag.
pub const MAX_SEQNO: u64 = (1 << 56) - 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,

    #[error("unknown key kind: {0}")]
    UnknownKind(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyKind {
    /// A tombstone for a point key.
    Del = 0,
    /// A point key/value.
    Put = 1,
    /// Seek sentinel, never stored.
    Seek = 2,
}

impl KeyKind {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Del),
            1 => Ok(Self::Put),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub fn is_tombstone(self) -> bool {
        matches!(self, Self::Del)
    }
}

/// Internal key `(user_key, seqno, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key,
            seqno,
            kind,
        }
    }

    /// Seek target that sorts before every stored entry for `user_key`.
    pub fn seek_to(user_key: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(user_key), u64::MAX, KeyKind::Seek)
    }

    /// `(seqno << 8) | kind`, the MVCC tag.
    pub fn tag(&self) -> u64 {
        (self.seqno << 8) | self.kind as u64
    }

    pub fn tag_bytes(&self) -> [u8; 8] {
        self.tag().to_le_bytes()
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.user_key.len() + 8
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        debug_assert!(self.seqno <= MAX_SEQNO, "seqno exceeds the 56-bit tag");
        debug_assert!(self.kind != KeyKind::Seek, "seek keys are never stored");
        let user_key_len: u32 = self
            .user_key
            .len()
            .try_into()
            .expect("user_key too large to encode");
        buf.extend_from_slice(&user_key_len.to_le_bytes());
        buf.extend_from_slice(self.user_key.as_ref());
        buf.extend_from_slice(&self.tag_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        if input.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let user_key_len = u32::from_le_bytes(input[0..4].try_into().unwrap()) as usize;
        let needed = 4 + user_key_len + 8;
        if input.len() < needed {
            return Err(DecodeError::Truncated);
        }

        let user_key = Bytes::copy_from_slice(&input[4..(4 + user_key_len)]);
        let tag = u64::from_le_bytes(input[(4 + user_key_len)..needed].try_into().unwrap());
        let kind = KeyKind::from_u8((tag & 0xff) as u8)?;

        Ok((
            Self {
                user_key,
                seqno: tag >> 8,
                kind,
            },
            needed,
        ))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seqno.cmp(&self.seqno))
            .then_with(|| (other.kind as u8).cmp(&(self.kind as u8)))
    }
}
