//! Sync service: fetch / submit / tail over the head store and update log.
//!
//! Architecture:
//! ```text
//!  submit ──► stream lock ──► head ──merge──► head' ─┐
//!                                                    ├─ one WriteBatch (CAS on head seq)
//!                              update row (raw) ─────┘
//!                                   │
//!                                   └──► compactor (seq % interval == 0)
//!
//!  fetch  ──► head ──diff(client vector)──► {diff, server vector, hash, seq}
//!  tail   ──► head ──► last N rows ≤ head.seq ──► drop own session ──► ascending
//! ```
//!
//! `submit` is the only mutating path. It holds a per-stream async lock for
//! the whole read-merge-write, so two submits on one stream never derive the
//! same next sequence. `fetch` and `tail` take no lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::compactor::{CompactionReport, RetentionCompactor};
use crate::config::SyncConfig;
use crate::engine::{DocumentEngine, YrsEngine};
use crate::error::{EngineError, StoreError, SyncError};
use crate::storage::{DocumentStore, HeadPatch, HeadRow, UpdateRow, WriteSet};
use crate::stream::{StreamId, StreamKey};

/// Attempts at the head compare-and-swap before a submit gives up.
///
/// The stream lock already serializes submits; a conflict means a head was
/// patched or deleted out of band.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Result of [`SyncService::fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Update that brings the client's replica up to the head
    pub diff: Vec<u8>,
    /// State vector of the head
    pub server_state_vector: Vec<u8>,
    pub remote_hash: String,
    pub latest_seq: u64,
}

/// Result of [`SyncService::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub latest_seq: u64,
    pub remote_hash: String,
}

/// One row returned by [`SyncService::tail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailUpdate {
    pub seq: u64,
    pub update: Vec<u8>,
    pub session_id: String,
    pub hash: String,
}

impl From<UpdateRow> for TailUpdate {
    fn from(row: UpdateRow) -> Self {
        Self {
            seq: row.seq,
            update: row.update,
            session_id: row.session_id,
            hash: row.hash,
        }
    }
}

/// Result of [`SyncService::tail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailResult {
    pub latest_seq: u64,
    pub remote_hash: String,
    /// Ascending by seq, none above `latest_seq`
    pub updates: Vec<TailUpdate>,
}

/// Service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub fetches: u64,
    pub submits: u64,
    pub rejected_submits: u64,
    pub tails: u64,
    pub compactions: u64,
    pub pruned_rows: u64,
}

/// Atomic counters behind [`SyncStats`], lock-free on the hot path.
#[derive(Default)]
struct AtomicSyncStats {
    fetches: AtomicU64,
    submits: AtomicU64,
    rejected_submits: AtomicU64,
    tails: AtomicU64,
    compactions: AtomicU64,
    pruned_rows: AtomicU64,
}

impl AtomicSyncStats {
    fn record_compaction(&self, report: &CompactionReport) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.pruned_rows.fetch_add(report.deleted, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            submits: self.submits.load(Ordering::Relaxed),
            rejected_submits: self.rejected_submits.load(Ordering::Relaxed),
            tails: self.tails.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            pruned_rows: self.pruned_rows.load(Ordering::Relaxed),
        }
    }
}

// ─── Stream locks ─────────────────────────────────────────────────────

/// Per-stream async mutation locks. Entries exist only while some task holds
/// or waits on them.
#[derive(Default)]
struct StreamLocks {
    table: Mutex<HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StreamLocks {
    async fn lock(&self, stream: StreamId) -> StreamLease<'_> {
        let mut lease = StreamLease {
            locks: self,
            stream,
            guard: None,
        };
        let entry = self.table().entry(stream).or_default().clone();
        // Declared after `lease` so a cancelled wait releases its reference
        // to the entry before the lease checks for idleness
        let acquire = entry.lock_owned();
        tokio::pin!(acquire);
        lease.guard = Some(acquire.as_mut().await);
        lease
    }

    fn len(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>> {
        // The map is always left consistent, so a poisoned lock is still usable
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held lock on one stream. Dropping it releases the lock and forgets the
/// table entry once nobody else references it.
struct StreamLease<'a> {
    locks: &'a StreamLocks,
    stream: StreamId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StreamLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table();
        let idle = table
            .get(&self.stream)
            .is_some_and(|entry| Arc::strong_count(entry) == 1);
        if idle {
            table.remove(&self.stream);
            log::trace!("Released lock entry for {}", self.stream);
        }
    }
}

// ─── Service ──────────────────────────────────────────────────────────

/// Server-authoritative sync log over a [`DocumentStore`].
pub struct SyncService<E: DocumentEngine = YrsEngine> {
    store: Arc<DocumentStore>,
    engine: E,
    compactor: RetentionCompactor,
    locks: StreamLocks,
    stats: AtomicSyncStats,
}

impl<E: DocumentEngine> SyncService<E> {
    pub fn new(store: Arc<DocumentStore>, engine: E, config: SyncConfig) -> Self {
        let compactor = RetentionCompactor::new(store.clone(), config.compaction.clone());
        Self {
            store,
            engine,
            compactor,
            locks: StreamLocks::default(),
            stats: AtomicSyncStats::default(),
        }
    }

    /// Diff between the head and the client's state vector.
    ///
    /// A stream that has never been written reads as an empty document at
    /// seq 0; nothing is persisted. An empty `client_state_vector` means the
    /// client has nothing yet.
    pub async fn fetch(
        &self,
        stream: &StreamKey,
        client_state_vector: &[u8],
    ) -> Result<FetchResult, SyncError> {
        let head = self.head_or_empty(stream)?;

        let diff = self
            .engine
            .diff(&head.snapshot, client_state_vector)
            .map_err(|e| match e {
                EngineError::MalformedStateVector(_) => SyncError::InvalidStateVector(e),
                other => SyncError::Engine(other),
            })?;
        let server_state_vector = self.engine.state_vector(&head.snapshot)?;

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Fetch {stream}: seq {} diff {} bytes",
            head.seq,
            diff.len()
        );

        Ok(FetchResult {
            diff,
            server_state_vector,
            remote_hash: head.hash,
            latest_seq: head.seq,
        })
    }

    /// Merge `update` into the head and append it to the log as the next
    /// sequence.
    ///
    /// On a merge failure the stream is left untouched. A stream that did
    /// not exist stays absent.
    pub async fn submit(
        &self,
        stream: &StreamKey,
        update: &[u8],
        session_id: &str,
    ) -> Result<SubmitResult, SyncError> {
        let lease = self.locks.lock(stream.id()).await;
        let result = self.submit_locked(stream, update, session_id);
        drop(lease);

        let submitted = match result {
            Ok(submitted) => submitted,
            Err(e) => {
                if matches!(e, SyncError::MergeRejected(_)) {
                    self.stats.rejected_submits.fetch_add(1, Ordering::Relaxed);
                }
                log::warn!("Submit to {stream} from session {session_id} failed: {e}");
                return Err(e);
            }
        };
        self.stats.submits.fetch_add(1, Ordering::Relaxed);

        // Best-effort: the update is already durable
        match self.compactor.maybe_compact(stream, submitted.latest_seq) {
            Ok(Some(report)) => self.stats.record_compaction(&report),
            Ok(None) => {}
            Err(e) => log::warn!(
                "Compaction of {stream} at seq {} failed: {e}",
                submitted.latest_seq
            ),
        }

        Ok(submitted)
    }

    fn submit_locked(
        &self,
        stream: &StreamKey,
        update: &[u8],
        session_id: &str,
    ) -> Result<SubmitResult, SyncError> {
        let id = stream.id();

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            // A missing head is seeded in memory and committed together with
            // the first update
            let (mut head, expected_seq) = match self.store.get_head(stream)? {
                Some(head) => {
                    let seq = head.seq;
                    (head, Some(seq))
                }
                None => (HeadRow::empty(stream.clone(), &self.engine)?, None),
            };

            let merged = self
                .engine
                .merge(&head.snapshot, update)
                .map_err(SyncError::MergeRejected)?;
            let hash = self.engine.hash(&merged)?;
            let seq = head.seq + 1;

            head.apply(HeadPatch::advance(seq, merged, hash.clone()));
            let row = UpdateRow::new(seq, update.to_vec(), session_id, hash.clone());

            let mut writes = WriteSet::new();
            self.store.stage_head(&mut writes, &head)?;
            self.store.stage_update(&mut writes, id, &row)?;

            if self.store.commit_if_head(id, expected_seq, writes)? {
                if expected_seq.is_none() {
                    log::info!("Created stream {stream}");
                }
                log::debug!("Submit {stream}: seq {seq} from session {session_id}");
                return Ok(SubmitResult {
                    latest_seq: seq,
                    remote_hash: hash,
                });
            }

            log::debug!("Head of {stream} moved during submit (attempt {attempt})");
        }

        Err(StoreError::HeadConflict(stream.to_string()).into())
    }

    /// The most recent `limit` updates, oldest first, without those authored
    /// by `exclude_session_id`.
    ///
    /// The head is read first and only rows it already covers are returned,
    /// so `latest_seq` is never behind the rows.
    pub async fn tail(
        &self,
        stream: &StreamKey,
        limit: usize,
        exclude_session_id: Option<&str>,
    ) -> Result<TailResult, SyncError> {
        let (latest_seq, remote_hash) = match self.store.get_head(stream)? {
            Some(head) => (head.seq, head.hash),
            None => (0, self.engine.hash(&self.engine.empty_state())?),
        };

        let mut rows = if latest_seq == 0 {
            Vec::new()
        } else {
            self.store.scan_updates_upto(stream.id(), latest_seq, limit)?
        };
        rows.reverse();

        let updates: Vec<TailUpdate> = rows
            .into_iter()
            .filter(|row| Some(row.session_id.as_str()) != exclude_session_id)
            .map(TailUpdate::from)
            .collect();

        self.stats.tails.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Tail {stream}: seq {latest_seq}, {} rows (limit {limit})",
            updates.len()
        );

        Ok(TailResult {
            latest_seq,
            remote_hash,
            updates,
        })
    }

    /// Run one compaction pass against the stream's current head, regardless
    /// of the trigger interval.
    pub fn compact(&self, stream: &StreamKey) -> Result<CompactionReport, SyncError> {
        let Some(head) = self.store.get_head(stream)? else {
            return Ok(CompactionReport::default());
        };
        let report = self.compactor.compact(stream, head.seq)?;
        self.stats.record_compaction(&report);
        Ok(report)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Streams with a live lock entry (held or awaited).
    pub fn locked_streams(&self) -> usize {
        self.locks.len()
    }

    fn head_or_empty(&self, stream: &StreamKey) -> Result<HeadRow, SyncError> {
        match self.store.get_head(stream)? {
            Some(head) => Ok(head),
            None => Ok(HeadRow::empty(stream.clone(), &self.engine)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

    fn service(config: SyncConfig) -> (tempfile::TempDir, SyncService) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        (dir, SyncService::new(store, YrsEngine::new(), config))
    }

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_to_empty(update: &[u8]) -> Doc {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
        }
        doc
    }

    #[tokio::test]
    async fn test_fetch_absent_stream_is_empty() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("nothing");

        let fetched = service.fetch(&key, &[]).await.unwrap();
        assert_eq!(fetched.latest_seq, 0);
        assert_eq!(
            fetched.remote_hash,
            service.engine().hash(&service.engine().empty_state()).unwrap()
        );
        // Nothing was persisted
        assert!(service.store().get_head(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_advances_seq() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("doc");

        let first = service.submit(&key, &text_update("a"), "s1").await.unwrap();
        let second = service.submit(&key, &text_update("b"), "s2").await.unwrap();
        assert_eq!(first.latest_seq, 1);
        assert_eq!(second.latest_seq, 2);
        assert_ne!(first.remote_hash, second.remote_hash);

        let head = service.store().get_head(&key).unwrap().unwrap();
        assert_eq!(head.seq, 2);
        assert_eq!(head.hash, second.remote_hash);
        assert_eq!(service.store().count_updates(key.id()).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_submit_stores_raw_update() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("raw");
        let update = text_update("hello");

        let submitted = service.submit(&key, &update, "s1").await.unwrap();
        let tail = service.tail(&key, 10, None).await.unwrap();
        assert_eq!(tail.updates.len(), 1);
        assert_eq!(tail.updates[0].update, update);
        assert_eq!(tail.updates[0].hash, submitted.remote_hash);
        assert_eq!(tail.updates[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_rejected_first_submit_leaves_stream_absent() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("bad");

        let err = service.submit(&key, &[0xFF, 0xFF, 0xFF], "s1").await.unwrap_err();
        assert!(matches!(err, SyncError::MergeRejected(_)));
        assert_eq!(err.code(), "merge_rejected");
        assert!(service.store().get_head(&key).unwrap().is_none());
        assert_eq!(service.store().count_updates(key.id()).unwrap(), 0);
        assert_eq!(service.stats().rejected_submits, 1);
        assert_eq!(service.stats().submits, 0);
    }

    #[tokio::test]
    async fn test_fetch_diff_rebuilds_document() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("rebuild");
        service.submit(&key, &text_update("hello"), "s1").await.unwrap();

        let fetched = service.fetch(&key, &[]).await.unwrap();
        assert_eq!(fetched.latest_seq, 1);

        let doc = apply_to_empty(&fetched.diff);
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        assert_eq!(text.get_string(&txn), "hello");
        drop(txn);

        // Fetching at the server's own vector yields nothing new
        let again = service.fetch(&key, &fetched.server_state_vector).await.unwrap();
        let doc = apply_to_empty(&again.diff);
        let txn = doc.transact();
        assert_eq!(txn.state_vector().encode_v1(), StateVector::default().encode_v1());
    }

    #[tokio::test]
    async fn test_fetch_rejects_malformed_state_vector() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("sv");
        service.submit(&key, &text_update("x"), "s1").await.unwrap();

        let err = service.fetch(&key, &[0xFF, 0xFF, 0xFF]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateVector(_)));
    }

    #[tokio::test]
    async fn test_tail_excludes_session_and_orders_ascending() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("tail");
        for (i, session) in ["s1", "s2", "s1", "s2"].iter().enumerate() {
            service
                .submit(&key, &text_update(&format!("u{i}")), session)
                .await
                .unwrap();
        }

        let tail = service.tail(&key, 10, Some("s1")).await.unwrap();
        assert_eq!(tail.latest_seq, 4);
        let seqs: Vec<u64> = tail.updates.iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![2, 4]);

        // limit applies before the session filter
        let tail = service.tail(&key, 1, Some("s2")).await.unwrap();
        assert!(tail.updates.is_empty());

        assert!(service.tail(&key, 0, None).await.unwrap().updates.is_empty());
    }

    #[tokio::test]
    async fn test_tail_absent_stream() {
        let (_dir, service) = service(SyncConfig::default());
        let tail = service.tail(&StreamKey::room("none"), 10, None).await.unwrap();
        assert_eq!(tail.latest_seq, 0);
        assert!(tail.updates.is_empty());
    }

    #[tokio::test]
    async fn test_submit_triggers_compaction() {
        let (_dir, service) = service(SyncConfig::for_testing());
        let key = StreamKey::room("compact");

        // interval 5, keep 3, max 4
        for i in 0..10 {
            service
                .submit(&key, &text_update(&format!("{i}")), "s1")
                .await
                .unwrap();
        }

        let stats = service.stats();
        assert_eq!(stats.submits, 10);
        assert_eq!(stats.compactions, 2);
        // seq 5: threshold 2 prunes {1}; seq 10: threshold 7 prunes {2,3,4,5}
        assert_eq!(stats.pruned_rows, 5);
        assert_eq!(service.store().count_updates(key.id()).unwrap(), 5);

        // The head still carries the full document
        let fetched = service.fetch(&key, &[]).await.unwrap();
        assert_eq!(fetched.latest_seq, 10);
    }

    #[tokio::test]
    async fn test_manual_compact() {
        let (_dir, service) = service(SyncConfig {
            compaction: crate::config::CompactionConfig {
                compaction_interval: 0,
                keep_last_n: 2,
                max_deletes: 100,
            },
        });
        let key = StreamKey::room("manual");
        for i in 0..6 {
            service
                .submit(&key, &text_update(&format!("{i}")), "s1")
                .await
                .unwrap();
        }
        assert_eq!(service.store().count_updates(key.id()).unwrap(), 6);

        let report = service.compact(&key).unwrap();
        assert_eq!(report.threshold, 4);
        assert_eq!(report.deleted, 3);
        assert_eq!(service.compact(&StreamKey::room("none")).unwrap(), CompactionReport::default());
    }

    #[tokio::test]
    async fn test_lock_table_drains() {
        let (_dir, service) = service(SyncConfig::default());
        for i in 0..8 {
            let key = StreamKey::room(format!("room-{i}"));
            service.submit(&key, &text_update("x"), "s").await.unwrap();
        }
        assert_eq!(service.locked_streams(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_leaves_no_entry() {
        let locks = StreamLocks::default();
        let id = StreamKey::room("contended").id();

        let held = locks.lock(id).await;
        let mut waiter = Box::pin(locks.lock(id));
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), &mut waiter).await;
        assert!(timed_out.is_err());

        // The queued waiter keeps the entry alive past the holder
        drop(held);
        assert_eq!(locks.len(), 1);

        // Abandoning the wait before it is polled again cleans up
        drop(waiter);
        assert_eq!(locks.len(), 0);

        // The stream is still lockable afterwards
        drop(locks.lock(id).await);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_out_of_band_patch() {
        let (_dir, service) = service(SyncConfig::default());
        let key = StreamKey::room("patched");
        service.submit(&key, &text_update("a"), "s1").await.unwrap();

        service
            .store()
            .patch_head(&key, HeadPatch { seq: Some(41), ..HeadPatch::default() })
            .unwrap();

        let submitted = service.submit(&key, &text_update("b"), "s1").await.unwrap();
        assert_eq!(submitted.latest_seq, 42);
    }
}
