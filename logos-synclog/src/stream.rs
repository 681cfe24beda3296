//! Stream identity.
//!
//! A stream is one collaborative document instance, named by its room and an
//! optional sub-document guid. Storage never sees the names directly; it keys
//! everything by a fixed 16-byte [`StreamId`] so per-stream update rows share
//! a fixed-length prefix:
//!
//! ```text
//! updates key: ┌──────────────┬──────────────┐
//!              │ stream_id    │ seq (BE)     │
//!              │ 16 bytes     │ 8 bytes      │
//!              └──────────────┴──────────────┘
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of a stream id in bytes.
pub const STREAM_ID_LEN: usize = 16;

/// Domain separator for stream id derivation.
const STREAM_ID_DOMAIN: &[u8] = b"logos-synclog/stream/v1";

/// Human-facing stream name: `(room_id, guid)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub room_id: String,
    /// Sub-document id within the room (None = the room's root document)
    pub guid: Option<String>,
}

impl StreamKey {
    pub fn new(room_id: impl Into<String>, guid: Option<String>) -> Self {
        Self {
            room_id: room_id.into(),
            guid,
        }
    }

    /// The room's root document.
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::new(room_id, None)
    }

    /// A sub-document of a room.
    pub fn subdoc(room_id: impl Into<String>, guid: impl Into<String>) -> Self {
        Self::new(room_id, Some(guid.into()))
    }

    /// Derive the storage id.
    ///
    /// Every component is length-prefixed and the guid carries a presence
    /// tag, so `("a", None)`, `("a", Some(""))` and `("a\0", None)` all map to
    /// different ids.
    pub fn id(&self) -> StreamId {
        let mut hasher = Sha256::new();
        hasher.update(STREAM_ID_DOMAIN);
        hasher.update((self.room_id.len() as u64).to_be_bytes());
        hasher.update(self.room_id.as_bytes());
        match &self.guid {
            Some(guid) => {
                hasher.update([1u8]);
                hasher.update((guid.len() as u64).to_be_bytes());
                hasher.update(guid.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        let digest = hasher.finalize();
        let mut id = [0u8; STREAM_ID_LEN];
        id.copy_from_slice(&digest[..STREAM_ID_LEN]);
        StreamId(id)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.guid {
            Some(guid) => write!(f, "{}/{}", self.room_id, guid),
            None => write!(f, "{}", self.room_id),
        }
    }
}

/// Fixed-width storage id of a stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }

    /// Key of the update row at `seq`: stream id followed by big-endian seq,
    /// so lexicographic key order is sequence order within a stream.
    pub fn update_key(&self, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(STREAM_ID_LEN + 8);
        key.extend_from_slice(&self.0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Split an update key back into `(stream id, seq)`.
    pub fn parse_update_key(key: &[u8]) -> Option<(StreamId, u64)> {
        if key.len() != STREAM_ID_LEN + 8 {
            return None;
        }
        let mut id = [0u8; STREAM_ID_LEN];
        id.copy_from_slice(&key[..STREAM_ID_LEN]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&key[STREAM_ID_LEN..]);
        Some((StreamId(id), u64::from_be_bytes(seq)))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", hex::encode(self.0))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
