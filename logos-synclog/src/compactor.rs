//! Retention compactor: amortized pruning of the update log.
//!
//! The head snapshot already contains every update up to its own seq, so old
//! rows are redundant for convergence. The compactor trims them:
//!
//! ```text
//! seq:   1   2   3  ...  t-1 │  t  ...  latest
//!        └── prunable ───────┘  └─ keep_last_n ─┘
//!        (oldest first, at most max_deletes per pass)
//! ```
//!
//! It is not scheduled. The sync service calls [`RetentionCompactor::maybe_compact`]
//! right after a submit, and it only does work when the new seq lands on the
//! configured interval. One pass is best-effort: a burst of writes can leave
//! more than `keep_last_n` rows behind until the next trigger.

use std::sync::Arc;

use crate::config::CompactionConfig;
use crate::error::StoreError;
use crate::storage::DocumentStore;
use crate::stream::StreamKey;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Rows with `seq < threshold` were eligible (0 = no-op)
    pub threshold: u64,
    /// Rows deleted in this pass
    pub deleted: u64,
}

/// Prunes update rows that fall outside the retention window.
pub struct RetentionCompactor {
    store: Arc<DocumentStore>,
    config: CompactionConfig,
}

impl RetentionCompactor {
    pub fn new(store: Arc<DocumentStore>, config: CompactionConfig) -> Self {
        Self { store, config }
    }

    /// Compact if `latest_seq` lands on the trigger interval.
    pub fn maybe_compact(
        &self,
        stream: &StreamKey,
        latest_seq: u64,
    ) -> Result<Option<CompactionReport>, StoreError> {
        if !self.config.should_compact(latest_seq) {
            return Ok(None);
        }
        self.compact(stream, latest_seq).map(Some)
    }

    /// Delete up to `max_deletes` rows with `seq < latest_seq - keep_last_n`,
    /// oldest first, in one batch.
    pub fn compact(
        &self,
        stream: &StreamKey,
        latest_seq: u64,
    ) -> Result<CompactionReport, StoreError> {
        let Some(threshold) = self.config.threshold(latest_seq) else {
            log::debug!(
                "Compaction skipped for {stream}: seq {latest_seq} inside retention window"
            );
            return Ok(CompactionReport::default());
        };

        let id = stream.id();
        let seqs = self.store.seqs_below(id, threshold, self.config.max_deletes)?;
        if seqs.is_empty() {
            return Ok(CompactionReport { threshold, deleted: 0 });
        }

        let deleted = self.store.delete_updates(id, &seqs)?;
        log::info!(
            "Compacted {stream}: pruned {deleted} rows below seq {threshold} (latest {latest_seq})"
        );

        Ok(CompactionReport { threshold, deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StoreConfig, UpdateRow};

    fn setup(
        config: CompactionConfig,
    ) -> (tempfile::TempDir, Arc<DocumentStore>, RetentionCompactor) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let compactor = RetentionCompactor::new(store.clone(), config);
        (dir, store, compactor)
    }

    fn fill(store: &DocumentStore, key: &StreamKey, upto: u64) {
        for seq in 1..=upto {
            store
                .insert_update(key.id(), &UpdateRow::new(seq, vec![seq as u8], "s", "h"))
                .unwrap();
        }
    }

    #[test]
    fn test_noop_inside_window() {
        let (_dir, store, compactor) = setup(CompactionConfig {
            compaction_interval: 10,
            keep_last_n: 10,
            max_deletes: 100,
        });
        let key = StreamKey::room("young");
        fill(&store, &key, 10);

        let report = compactor.compact(&key, 10).unwrap();
        assert_eq!(report, CompactionReport::default());
        assert_eq!(store.count_updates(key.id()).unwrap(), 10);
    }

    #[test]
    fn test_prunes_below_threshold_only() {
        let (_dir, store, compactor) = setup(CompactionConfig {
            compaction_interval: 10,
            keep_last_n: 5,
            max_deletes: 100,
        });
        let key = StreamKey::room("old");
        fill(&store, &key, 20);

        let report = compactor.compact(&key, 20).unwrap();
        assert_eq!(report.threshold, 15);
        assert_eq!(report.deleted, 14);

        let left = store.seqs_below(key.id(), u64::MAX, 100).unwrap();
        assert_eq!(left, (15..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_respects_max_deletes() {
        let (_dir, store, compactor) = setup(CompactionConfig {
            compaction_interval: 10,
            keep_last_n: 2,
            max_deletes: 3,
        });
        let key = StreamKey::room("capped");
        fill(&store, &key, 20);

        let report = compactor.compact(&key, 20).unwrap();
        assert_eq!(report.deleted, 3);
        let left = store.seqs_below(key.id(), u64::MAX, 100).unwrap();
        assert_eq!(left.first(), Some(&4));

        // The next pass keeps chipping away
        let report = compactor.compact(&key, 20).unwrap();
        assert_eq!(report.deleted, 3);
        assert_eq!(store.count_updates(key.id()).unwrap(), 14);
    }

    #[test]
    fn test_maybe_compact_only_on_interval() {
        let (_dir, store, compactor) = setup(CompactionConfig {
            compaction_interval: 10,
            keep_last_n: 2,
            max_deletes: 100,
        });
        let key = StreamKey::room("interval");
        fill(&store, &key, 19);

        assert_eq!(compactor.maybe_compact(&key, 19).unwrap(), None);
        assert_eq!(store.count_updates(key.id()).unwrap(), 19);

        fill(&store, &key, 20);
        let report = compactor.maybe_compact(&key, 20).unwrap().unwrap();
        assert_eq!(report.deleted, 17);
    }
}
