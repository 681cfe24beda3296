//! # logos-synclog: Server-authoritative CRDT sync log for Logos
//!
//! Keeps one authoritative compacted snapshot per document stream plus an
//! append-only log of the raw updates that produced it. Clients converge by
//! fetching a diff against their state vector, submitting incremental
//! updates, and tailing updates authored by other sessions.
//!
//! ## Architecture
//!
//! ```text
//!  client session                SyncService                   RocksDB
//! ┌──────────────┐  fetch    ┌─────────────────┐   heads    ┌───────────┐
//! │ Yrs Doc      │ ────────► │ DocumentEngine  │ ◄────────► │ stream_id │
//! │ (local)      │  submit   │ (merge / diff)  │            └───────────┘
//! │              │ ────────► │                 │   updates  ┌───────────┐
//! │              │  tail     │ stream locks    │ ◄────────► │ id | seq  │
//! └──────────────┘ ◄──────── │ compactor       │            └───────────┘
//!                            └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: CRDT capability trait and the Yrs implementation
//! - [`stream`]: stream naming and storage keys
//! - [`storage`]: head store and update log on RocksDB
//! - [`service`]: fetch / submit / tail
//! - [`compactor`]: retention pruning of the update log
//! - [`protocol`]: bincode request/response envelope
//! - [`config`]: service configuration
//! - [`error`]: error types

pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod service;
pub mod storage;
pub mod stream;

// Re-exports for convenience
pub use compactor::{CompactionReport, RetentionCompactor};
pub use config::{CompactionConfig, SyncConfig};
pub use engine::{DocumentEngine, YrsEngine};
pub use error::{EngineError, ProtocolError, StoreError, SyncError};
pub use protocol::{SyncRequest, SyncResponse};
pub use service::{FetchResult, SubmitResult, SyncService, SyncStats, TailResult, TailUpdate};
pub use storage::{
    DocumentStore, HeadInfo, HeadPatch, HeadRow, ScanOrder, StoreConfig, UpdateRow, WriteSet,
};
pub use stream::{StreamId, StreamKey};
