//! Binary request/response envelope for the sync service.
//!
//! Transport-agnostic: a host reads a frame from whatever carries it (HTTP
//! body, WebSocket message, queue payload), hands it to
//! [`SyncService::handle_bytes`] and writes the reply back.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌─────────┬────────────┬─────────────┬──────────────────────────┐
//! │ variant │ request_id │ stream      │ operation fields         │
//! │ varint  │ 16 bytes   │ room + guid │ variable                 │
//! └─────────┴────────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! Every response echoes the request id. Failures come back as
//! [`SyncResponse::Rejected`] carrying [`SyncError::code`].
//!
//! Frames are capped at [`MAX_FRAME_BYTES`]. The cap also bounds every length
//! prefix inside a frame, so a forged length is rejected before anything is
//! allocated for it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::DocumentEngine;
use crate::error::{ProtocolError, SyncError};
use crate::service::{FetchResult, SubmitResult, SyncService, TailResult};
use crate::stream::StreamKey;

/// Largest frame accepted or produced (32MB).
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Request from a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    Fetch {
        request_id: Uuid,
        stream: StreamKey,
        /// Client state vector (empty = nothing yet)
        state_vector: Vec<u8>,
    },
    Submit {
        request_id: Uuid,
        stream: StreamKey,
        update: Vec<u8>,
        session_id: String,
    },
    Tail {
        request_id: Uuid,
        stream: StreamKey,
        limit: u32,
        exclude_session_id: Option<String>,
    },
}

impl SyncRequest {
    pub fn fetch(stream: StreamKey, state_vector: Vec<u8>) -> Self {
        Self::Fetch {
            request_id: Uuid::new_v4(),
            stream,
            state_vector,
        }
    }

    pub fn submit(stream: StreamKey, update: Vec<u8>, session_id: impl Into<String>) -> Self {
        Self::Submit {
            request_id: Uuid::new_v4(),
            stream,
            update,
            session_id: session_id.into(),
        }
    }

    pub fn tail(stream: StreamKey, limit: u32, exclude_session_id: Option<String>) -> Self {
        Self::Tail {
            request_id: Uuid::new_v4(),
            stream,
            limit,
            exclude_session_id,
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Fetch { request_id, .. }
            | Self::Submit { request_id, .. }
            | Self::Tail { request_id, .. } => *request_id,
        }
    }

    pub fn stream(&self) -> &StreamKey {
        match self {
            Self::Fetch { stream, .. }
            | Self::Submit { stream, .. }
            | Self::Tail { stream, .. } => stream,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Reply to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    Fetched {
        request_id: Uuid,
        result: FetchResult,
    },
    Submitted {
        request_id: Uuid,
        result: SubmitResult,
    },
    Tailed {
        request_id: Uuid,
        result: TailResult,
    },
    Rejected {
        request_id: Uuid,
        /// Stable machine-readable code
        code: String,
        message: String,
    },
}

impl SyncResponse {
    pub fn rejected(request_id: Uuid, error: &SyncError) -> Self {
        Self::Rejected {
            request_id,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Fetched { request_id, .. }
            | Self::Submitted { request_id, .. }
            | Self::Tailed { request_id, .. }
            | Self::Rejected { request_id, .. } => *request_id,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn frame_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, frame_config())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Decode(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_BYTES}",
            bytes.len()
        )));
    }
    let (frame, _) = bincode::serde::decode_from_slice(bytes, frame_config())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(frame)
}

impl<E: DocumentEngine> SyncService<E> {
    /// Dispatch a request to the matching operation. Errors become
    /// [`SyncResponse::Rejected`].
    pub async fn handle(&self, request: SyncRequest) -> SyncResponse {
        let request_id = request.request_id();
        let outcome = match request {
            SyncRequest::Fetch {
                stream,
                state_vector,
                ..
            } => self
                .fetch(&stream, &state_vector)
                .await
                .map(|result| SyncResponse::Fetched { request_id, result }),
            SyncRequest::Submit {
                stream,
                update,
                session_id,
                ..
            } => self
                .submit(&stream, &update, &session_id)
                .await
                .map(|result| SyncResponse::Submitted { request_id, result }),
            SyncRequest::Tail {
                stream,
                limit,
                exclude_session_id,
                ..
            } => self
                .tail(&stream, limit as usize, exclude_session_id.as_deref())
                .await
                .map(|result| SyncResponse::Tailed { request_id, result }),
        };

        outcome.unwrap_or_else(|e| {
            log::debug!("Request {request_id} rejected: {e}");
            SyncResponse::rejected(request_id, &e)
        })
    }

    /// Decode a request frame, handle it and encode the response frame.
    ///
    /// Fails only when the frame itself cannot be decoded or the reply cannot
    /// be encoded; operation errors travel inside the response.
    pub async fn handle_bytes(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request = SyncRequest::decode(frame)?;
        self.handle(request).await.encode()
    }
}
