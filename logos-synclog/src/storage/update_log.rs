//! Update log: append-only ledger of raw updates per stream.
//!
//! Rows are never rewritten. The only writes are [`DocumentStore::insert_update`]
//! (or its staged form, used by submit) and deletions issued by the
//! retention compactor.

use rocksdb::{Direction, IteratorMode};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage::rocks::{
    decode_row, encode_row, now_millis, DocumentStore, WriteSet, CF_UPDATES,
};
use crate::stream::StreamId;

/// One incremental update as submitted by a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRow {
    /// Sequence assigned at submit
    pub seq: u64,
    /// Raw update bytes, exactly as submitted
    pub update: Vec<u8>,
    /// Session that authored the update
    pub session_id: String,
    /// Head hash right after this update was merged
    pub hash: String,
    /// Creation timestamp (ms since epoch)
    pub created_at: u64,
}

impl UpdateRow {
    pub fn new(
        seq: u64,
        update: Vec<u8>,
        session_id: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            seq,
            update,
            session_id: session_id.into(),
            hash: hash.into(),
            created_at: now_millis(),
        }
    }
}

/// Scan direction over a stream's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Oldest first
    Ascending,
    /// Newest first
    Descending,
}

/// On-disk update row. The sequence lives in the key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredUpdate {
    session_id: String,
    hash: String,
    created_at: u64,
    /// LZ4-compressed update payload (size-prepended)
    payload: Vec<u8>,
}

impl StoredUpdate {
    fn from_row(row: &UpdateRow) -> Self {
        Self {
            session_id: row.session_id.clone(),
            hash: row.hash.clone(),
            created_at: row.created_at,
            payload: lz4_flex::compress_prepend_size(&row.update),
        }
    }

    fn into_row(self, seq: u64) -> Result<UpdateRow, StoreError> {
        let update = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(UpdateRow {
            seq,
            update,
            session_id: self.session_id,
            hash: self.hash,
            created_at: self.created_at,
        })
    }
}

impl DocumentStore {
    // ─── Update log ───────────────────────────────────────────────────

    /// Append an update row on its own.
    pub fn insert_update(&self, stream: StreamId, row: &UpdateRow) -> Result<(), StoreError> {
        let mut writes = WriteSet::new();
        self.stage_update(&mut writes, stream, row)?;
        self.commit(writes)
    }

    /// Stage an update row append into a write set.
    pub fn stage_update(
        &self,
        writes: &mut WriteSet,
        stream: StreamId,
        row: &UpdateRow,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let value = encode_row(&StoredUpdate::from_row(row))?;
        writes.batch.put_cf(&cf, stream.update_key(row.seq), value);
        Ok(())
    }

    /// Up to `limit` rows of a stream in the given order.
    pub fn scan_updates(
        &self,
        stream: StreamId,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        match order {
            ScanOrder::Ascending => self.scan_from(stream, 0, Direction::Forward, limit),
            ScanOrder::Descending => self.scan_from(stream, u64::MAX, Direction::Reverse, limit),
        }
    }

    /// Up to `limit` rows with `seq <= max_seq`, newest first.
    pub fn scan_updates_upto(
        &self,
        stream: StreamId,
        max_seq: u64,
        limit: usize,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        self.scan_from(stream, max_seq, Direction::Reverse, limit)
    }

    fn scan_from(
        &self,
        stream: StreamId,
        start_seq: u64,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        let mut rows = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(rows);
        }

        let start_key = stream.update_key(start_seq);
        for item in self.prefix_iter(IteratorMode::From(&start_key, direction))? {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(seq) = Self::seq_in_stream(stream, &key)? else {
                break;
            };
            let stored: StoredUpdate = decode_row(&value)?;
            rows.push(stored.into_row(seq)?);
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// All rows with `seq > since`, oldest first.
    pub fn updates_since(
        &self,
        stream: StreamId,
        since: u64,
    ) -> Result<Vec<UpdateRow>, StoreError> {
        let start_key = stream.update_key(since.saturating_add(1));
        let mut rows = Vec::new();
        if since == u64::MAX {
            return Ok(rows);
        }

        for item in self.prefix_iter(IteratorMode::From(&start_key, Direction::Forward))? {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(seq) = Self::seq_in_stream(stream, &key)? else {
                break;
            };
            let stored: StoredUpdate = decode_row(&value)?;
            rows.push(stored.into_row(seq)?);
        }

        Ok(rows)
    }

    /// Sequences of up to `limit` rows with `seq < threshold`, oldest first.
    pub fn seqs_below(
        &self,
        stream: StreamId,
        threshold: u64,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let start_key = stream.update_key(0);
        let mut seqs = Vec::new();
        if limit == 0 {
            return Ok(seqs);
        }

        for item in self.prefix_iter(IteratorMode::From(&start_key, Direction::Forward))? {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(seq) = Self::seq_in_stream(stream, &key)? else {
                break;
            };
            if seq >= threshold {
                break;
            }
            seqs.push(seq);
            if seqs.len() >= limit {
                break;
            }
        }

        Ok(seqs)
    }

    /// Delete the given rows of a stream in one batch. Returns how many
    /// deletions were issued.
    pub fn delete_updates(&self, stream: StreamId, seqs: &[u64]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let mut writes = WriteSet::new();
        for seq in seqs {
            writes.batch.delete_cf(&cf, stream.update_key(*seq));
        }
        self.commit(writes)?;
        Ok(seqs.len() as u64)
    }

    /// Number of rows currently held for a stream.
    pub fn count_updates(&self, stream: StreamId) -> Result<u64, StoreError> {
        let start_key = stream.update_key(0);
        let mut count = 0u64;
        for item in self.prefix_iter(IteratorMode::From(&start_key, Direction::Forward))? {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if Self::seq_in_stream(stream, &key)?.is_none() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Sequence encoded in `key` if it belongs to `stream`, `None` once the
    /// iterator has left the stream's prefix.
    fn seq_in_stream(stream: StreamId, key: &[u8]) -> Result<Option<u64>, StoreError> {
        if !key.starts_with(stream.as_bytes()) {
            return Ok(None);
        }
        match StreamId::parse_update_key(key) {
            Some((_, seq)) => Ok(Some(seq)),
            None => Err(StoreError::CorruptKey(key.len())),
        }
    }
}
