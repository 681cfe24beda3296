//! Service configuration.
//!
//! Store tuning lives in [`StoreConfig`](crate::storage::StoreConfig); this
//! module holds the knobs of the sync service itself. Both deserialize with
//! defaults for missing fields, so a host can load them from its own config
//! file.

use serde::{Deserialize, Serialize};

/// Retention policy for the update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Run the compactor after every submit whose new seq is a multiple of
    /// this value. Zero disables automatic compaction.
    pub compaction_interval: u64,
    /// Rows within this distance of the latest seq are always retained
    pub keep_last_n: u64,
    /// Upper bound on rows deleted by a single compaction pass
    pub max_deletes: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compaction_interval: 50,
            keep_last_n: 100,
            max_deletes: 500,
        }
    }
}

impl CompactionConfig {
    /// Config for testing (small windows so pruning is observable).
    pub fn for_testing() -> Self {
        Self {
            compaction_interval: 5,
            keep_last_n: 3,
            max_deletes: 4,
        }
    }

    /// Whether a submit that produced `seq` should trigger compaction.
    pub fn should_compact(&self, seq: u64) -> bool {
        self.compaction_interval > 0 && seq > 0 && seq % self.compaction_interval == 0
    }

    /// Rows with `seq < threshold` are eligible for pruning. `None` when
    /// nothing is old enough.
    pub fn threshold(&self, latest_seq: u64) -> Option<u64> {
        latest_seq
            .checked_sub(self.keep_last_n)
            .filter(|threshold| *threshold > 0)
    }
}

/// Sync service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub compaction: CompactionConfig,
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            compaction: CompactionConfig::for_testing(),
        }
    }
}
