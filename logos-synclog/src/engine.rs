//! Document engine: the CRDT capability the sync log is built on.
//!
//! The sync log never interprets update bytes itself. Everything it needs
//! from the CRDT goes through [`DocumentEngine`]:
//!
//! ```text
//! merge(state, update)  -> state'        commutative, associative, idempotent
//! diff(state, vector)   -> update        what a replica at `vector` is missing
//! state_vector(state)   -> vector
//! hash(state)           -> hex string    equal for equal states
//! ```
//!
//! [`YrsEngine`] is the production engine, backed by the same Yrs documents
//! the collaboration layer uses on the client side.

use sha2::{Digest, Sha256};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::EngineError;

/// Deterministic, side-effect-free CRDT operations over opaque byte strings.
pub trait DocumentEngine: Send + Sync + 'static {
    /// Snapshot of a document with no content.
    fn empty_state(&self) -> Vec<u8>;

    /// Merge `update` into `state`, returning the merged state.
    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Minimal update that brings a replica at `state_vector` up to `state`.
    fn diff(&self, state: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Summary of which updates `state` incorporates.
    fn state_vector(&self, state: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Content hash of `state`.
    fn hash(&self, state: &[u8]) -> Result<String, EngineError>;
}

/// Yrs-backed document engine (lib0 v1 encoding).
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsEngine;

impl YrsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Load one or more encoded updates into a fresh document.
    fn load(&self, updates: &[&[u8]]) -> Result<Doc, EngineError> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for bytes in updates {
                let update = Update::decode_v1(bytes)
                    .map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| EngineError::Apply(e.to_string()))?;
            }
        }
        Ok(doc)
    }

    fn encode_full(doc: &Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, EngineError> {
        // Clients that have never synced may send nothing at all
        if bytes.is_empty() {
            return Ok(StateVector::default());
        }
        StateVector::decode_v1(bytes).map_err(|e| EngineError::MalformedStateVector(e.to_string()))
    }
}

impl DocumentEngine for YrsEngine {
    fn empty_state(&self) -> Vec<u8> {
        Self::encode_full(&Doc::new())
    }

    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, EngineError> {
        let doc = self.load(&[state, update])?;
        Ok(Self::encode_full(&doc))
    }

    fn diff(&self, state: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let remote_sv = Self::decode_state_vector(state_vector)?;
        let doc = self.load(&[state])?;
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    fn state_vector(&self, state: &[u8]) -> Result<Vec<u8>, EngineError> {
        let doc = self.load(&[state])?;
        let txn = doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// SHA-256 over the re-encoded document, so two encodings of the same
    /// state hash identically.
    fn hash(&self, state: &[u8]) -> Result<String, EngineError> {
        let doc = self.load(&[state])?;
        Ok(sha256_hex(&Self::encode_full(&doc)))
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn client_update(root: &str, content: &str) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(root);
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn read_text(state: &[u8], root: &str) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(root);
        text.get_string(&txn)
    }

    #[test]
    fn test_empty_state_has_empty_vector() {
        let engine = YrsEngine::new();
        let empty = engine.empty_state();
        let sv = engine.state_vector(&empty).unwrap();
        assert_eq!(sv, StateVector::default().encode_v1());
    }

    #[test]
    fn test_merge_applies_update() {
        let engine = YrsEngine::new();
        let update = client_update("content", "hello");
        let merged = engine.merge(&engine.empty_state(), &update).unwrap();
        assert_eq!(read_text(&merged, "content"), "hello");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let engine = YrsEngine::new();
        let update = client_update("content", "once");
        let once = engine.merge(&engine.empty_state(), &update).unwrap();
        let twice = engine.merge(&once, &update).unwrap();
        assert_eq!(read_text(&twice, "content"), "once");
        assert_eq!(engine.hash(&once).unwrap(), engine.hash(&twice).unwrap());
    }

    #[test]
    fn test_hash_independent_of_merge_order() {
        let engine = YrsEngine::new();
        let a = client_update("left", "alpha");
        let b = client_update("right", "beta");

        let ab = engine.merge(&a, &b).unwrap();
        let ba = engine.merge(&b, &a).unwrap();
        assert_eq!(engine.hash(&ab).unwrap(), engine.hash(&ba).unwrap());
    }

    #[test]
    fn test_diff_against_empty_vector_is_full_state() {
        let engine = YrsEngine::new();
        let a = client_update("content", "abc");
        let state = engine.merge(&engine.empty_state(), &a).unwrap();

        let diff = engine.diff(&state, &[]).unwrap();
        let rebuilt = engine.merge(&engine.empty_state(), &diff).unwrap();
        assert_eq!(read_text(&rebuilt, "content"), "abc");
    }

    #[test]
    fn test_diff_against_current_vector_adds_nothing() {
        let engine = YrsEngine::new();
        let a = client_update("content", "abc");
        let state = engine.merge(&engine.empty_state(), &a).unwrap();
        let sv = engine.state_vector(&state).unwrap();

        let diff = engine.diff(&state, &sv).unwrap();
        let after = engine.merge(&state, &diff).unwrap();
        assert_eq!(engine.hash(&after).unwrap(), engine.hash(&state).unwrap());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let engine = YrsEngine::new();
        let result = engine.merge(&engine.empty_state(), &[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let engine = YrsEngine::new();
        let result = engine.diff(&engine.empty_state(), &[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(EngineError::MalformedStateVector(_))));
    }

    #[test]
    fn test_sha256_hex_shape() {
        let h = sha256_hex(b"logos");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
