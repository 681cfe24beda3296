//! Persistent storage for stream heads and update rows.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   one WriteBatch   ┌──────────────────────────────────────┐
//! │ SyncService │ ─────────────────► │ DocumentStore (RocksDB)              │
//! │  submit     │   head + update    │                                      │
//! └─────────────┘                    │ CF "heads"   stream_id → head row    │
//!                                    │ CF "updates" stream_id|seq → update  │
//! ┌─────────────┐   delete batch     │                                      │
//! │ Compactor   │ ─────────────────► │                                      │
//! └─────────────┘                    └──────────────────────────────────────┘
//! ```
//!
//! - [`head`]: one compacted snapshot per stream, compare-and-swap on create
//! - [`update_log`]: append-only update rows, ordered scans, pruning support
//! - [`rocks`]: database handle, column families, atomic write sets
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod head;
pub mod rocks;
pub mod update_log;

pub use head::{HeadInfo, HeadPatch, HeadRow};
pub use rocks::{DocumentStore, StoreConfig, WriteSet};
pub use update_log::{ScanOrder, UpdateRow};
