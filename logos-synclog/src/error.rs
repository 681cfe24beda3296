//! Error types for the sync log.
//!
//! Each layer has its own enum; `SyncError` is what callers of
//! [`SyncService`](crate::service::SyncService) see.

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),

    /// Row serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Row deserialization failed
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// LZ4 decompression of a stored payload failed
    #[error("compression error: {0}")]
    Compression(String),

    /// A key in the updates column family has the wrong shape
    #[error("corrupt key of {0} bytes")]
    CorruptKey(usize),

    /// The head kept moving under a conditional commit
    #[error("head of {0} changed concurrently")]
    HeadConflict(String),

    /// The engine could not produce an empty document to seed a head
    #[error("failed to seed head: {0}")]
    Seed(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Document engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Update or snapshot bytes could not be decoded
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// State vector bytes could not be decoded
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),

    /// Decoded update could not be integrated
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Wire envelope errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors surfaced by the sync service.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The engine rejected the submitted update. The stream is unchanged.
    #[error("update rejected: {0}")]
    MergeRejected(#[source] EngineError),

    /// The client's state vector could not be decoded.
    #[error("invalid state vector: {0}")]
    InvalidStateVector(#[source] EngineError),

    /// The stored head could not be processed by the engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Stable code carried in protocol rejections.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::MergeRejected(_) => "merge_rejected",
            SyncError::InvalidStateVector(_) => "invalid_state_vector",
            SyncError::Engine(_) => "engine_error",
            SyncError::Store(_) => "store_error",
        }
    }
}
