//! Head store: the compacted snapshot of each stream.
//!
//! One row per stream under its `StreamId`. The stored form keeps the
//! snapshot LZ4-compressed; [`HeadRow`] is the decompressed view.

use serde::{Deserialize, Serialize};

use crate::engine::DocumentEngine;
use crate::error::StoreError;
use crate::storage::rocks::{decode_row, encode_row, now_millis, DocumentStore, WriteSet, CF_HEADS};
use crate::stream::{StreamId, StreamKey};

/// Current head of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadRow {
    /// Stream this head belongs to
    pub stream: StreamKey,
    /// Sequence of the last update merged into `snapshot`
    pub seq: u64,
    /// Merged document state as of `seq`
    pub snapshot: Vec<u8>,
    /// Engine hash of `snapshot`
    pub hash: String,
    /// Creation timestamp (ms since epoch)
    pub created_at: u64,
    /// Last modified timestamp (ms since epoch)
    pub updated_at: u64,
}

impl HeadRow {
    /// Sequence-0 head for a stream that has never been written.
    pub fn seed(stream: StreamKey, snapshot: Vec<u8>, hash: String) -> Self {
        let now = now_millis();
        Self {
            stream,
            seq: 0,
            snapshot,
            hash,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed a head from the engine's empty document.
    pub fn empty<E: DocumentEngine + ?Sized>(
        stream: StreamKey,
        engine: &E,
    ) -> Result<Self, crate::error::EngineError> {
        let snapshot = engine.empty_state();
        let hash = engine.hash(&snapshot)?;
        Ok(Self::seed(stream, snapshot, hash))
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: HeadPatch) {
        if let Some(seq) = patch.seq {
            self.seq = seq;
        }
        if let Some(snapshot) = patch.snapshot {
            self.snapshot = snapshot;
        }
        if let Some(hash) = patch.hash {
            self.hash = hash;
        }
        self.updated_at = patch.updated_at.unwrap_or_else(now_millis);
    }
}

/// Partial head update. `None` fields are left as they are; a missing
/// `updated_at` is stamped with the current time.
#[derive(Debug, Clone, Default)]
pub struct HeadPatch {
    pub seq: Option<u64>,
    pub snapshot: Option<Vec<u8>>,
    pub hash: Option<String>,
    pub updated_at: Option<u64>,
}

impl HeadPatch {
    /// Patch that advances a head to a newly merged state.
    pub fn advance(seq: u64, snapshot: Vec<u8>, hash: String) -> Self {
        Self {
            seq: Some(seq),
            snapshot: Some(snapshot),
            hash: Some(hash),
            updated_at: None,
        }
    }
}

/// On-disk head row.
#[derive(Debug, Serialize, Deserialize)]
struct StoredHead {
    stream: StreamKey,
    seq: u64,
    hash: String,
    created_at: u64,
    updated_at: u64,
    /// Uncompressed snapshot size in bytes
    snapshot_size: u64,
    /// LZ4-compressed snapshot (size-prepended)
    snapshot: Vec<u8>,
}

impl StoredHead {
    fn from_row(row: &HeadRow) -> Self {
        Self {
            stream: row.stream.clone(),
            seq: row.seq,
            hash: row.hash.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            snapshot_size: row.snapshot.len() as u64,
            snapshot: lz4_flex::compress_prepend_size(&row.snapshot),
        }
    }

    fn into_row(self) -> Result<HeadRow, StoreError> {
        let snapshot = lz4_flex::decompress_size_prepended(&self.snapshot)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(HeadRow {
            stream: self.stream,
            seq: self.seq,
            snapshot,
            hash: self.hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Head metadata without the snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub stream: StreamKey,
    pub seq: u64,
    pub hash: String,
    pub snapshot_size: u64,
    pub updated_at: u64,
}

impl DocumentStore {
    // ─── Heads ────────────────────────────────────────────────────────

    /// Load the head of a stream, if it has one.
    pub fn get_head(&self, stream: &StreamKey) -> Result<Option<HeadRow>, StoreError> {
        self.load_stored_head(stream.id())?
            .map(StoredHead::into_row)
            .transpose()
    }

    /// Load the head, creating a sequence-0 head from the engine's empty
    /// document if the stream has none.
    ///
    /// Creation is a compare-and-swap against "no head", so when two callers
    /// race the loser simply re-reads the winner's row.
    pub fn get_or_create_head<E: DocumentEngine + ?Sized>(
        &self,
        stream: &StreamKey,
        engine: &E,
    ) -> Result<HeadRow, StoreError> {
        if let Some(head) = self.get_head(stream)? {
            return Ok(head);
        }

        let seed = HeadRow::empty(stream.clone(), engine)
            .map_err(|e| StoreError::Seed(e.to_string()))?;
        let mut writes = WriteSet::new();
        self.stage_head(&mut writes, &seed)?;
        if self.commit_if_head(stream.id(), None, writes)? {
            log::info!("Created head for stream {stream}");
        }

        self.get_head(stream)?.ok_or_else(|| {
            StoreError::Database(format!("head for {stream} vanished after creation"))
        })
    }

    /// Partially update an existing head. Returns the patched row, or `None`
    /// if the stream has no head.
    pub fn patch_head(
        &self,
        stream: &StreamKey,
        patch: HeadPatch,
    ) -> Result<Option<HeadRow>, StoreError> {
        let id = stream.id();
        let _guard = self.lock_head(id);
        let Some(mut head) = self.get_head(stream)? else {
            return Ok(None);
        };
        head.apply(patch);
        let mut writes = WriteSet::new();
        self.stage_head(&mut writes, &head)?;
        self.commit(writes)?;
        Ok(Some(head))
    }

    /// Stage a full head write (upsert) into a write set.
    pub fn stage_head(&self, writes: &mut WriteSet, head: &HeadRow) -> Result<(), StoreError> {
        let cf = self.cf(CF_HEADS)?;
        let value = encode_row(&StoredHead::from_row(head))?;
        writes.batch.put_cf(&cf, head.stream.id().as_bytes(), value);
        Ok(())
    }

    /// Head metadata for every stream in the store.
    pub fn list_streams(&self) -> Result<Vec<HeadInfo>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        let mut streams = Vec::new();

        for item in self.db().iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let stored: StoredHead = decode_row(&value)?;
            streams.push(HeadInfo {
                stream: stored.stream,
                seq: stored.seq,
                hash: stored.hash,
                snapshot_size: stored.snapshot_size,
                updated_at: stored.updated_at,
            });
        }

        Ok(streams)
    }

    /// Sequence of the stored head, without decompressing the snapshot.
    pub(crate) fn head_seq(&self, stream: StreamId) -> Result<Option<u64>, StoreError> {
        Ok(self.load_stored_head(stream)?.map(|h| h.seq))
    }

    fn load_stored_head(&self, stream: StreamId) -> Result<Option<StoredHead>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db().get_cf(&cf, stream.as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }
}
