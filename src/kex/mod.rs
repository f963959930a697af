//! Key exchange (KEX)
//!
//! Fresh pad bytes travel over the visual channel: a source device generates
//! random segments and rotates them across its screen as scannable payloads,
//! readers scan in whatever order they catch them, and a shared coordination
//! document tracks which peer has received which segment. When every
//! participant holds every segment the source finalizes and both sides build
//! the same keystream.

pub mod coordination;
pub mod session;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{KexSessionId, PeerId};

/// Fixed segment size carried by one visual payload
pub const SEGMENT_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KexStatus {
    Waiting,
    InProgress,
    Completed,
    Cancelled,
}

/// The shared coordination document at `kex/{sessionId}`.
///
/// Its last-update time is the server timestamp of the latest write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KexSessionDoc {
    pub id: KexSessionId,
    pub source_id: PeerId,
    pub participants: Vec<PeerId>,
    /// Sorted segment indices each peer has received
    #[serde(default)]
    pub segments_by_peer: BTreeMap<PeerId, Vec<u32>>,
    /// Bounds of the current attempt, in segment indices
    pub start_index: u32,
    pub end_index: u32,
    pub total_segments: u32,
    pub total_key_bytes: u64,
    pub status: KexStatus,
    pub created_at: u64,
}

impl KexSessionDoc {
    pub fn peer_has(&self, peer_id: &str, index: u32) -> bool {
        self.segments_by_peer
            .get(peer_id)
            .map(|indices| indices.binary_search(&index).is_ok())
            .unwrap_or(false)
    }

    /// Peer-agnostic completion: every participant has every segment
    pub fn is_complete(&self) -> bool {
        (0..self.total_segments).all(|index| {
            self.participants
                .iter()
                .all(|peer| self.peer_has(peer, index))
        })
    }
}

/// Visual-code payload: one segment of fresh key bytes.
///
/// Encoded as compact JSON (`{s, i, a, b, k}`), comfortably under 2 KB for a
/// 1024-byte segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrPayload {
    #[serde(rename = "s")]
    pub session_id: KexSessionId,
    #[serde(rename = "i")]
    pub index: u32,
    #[serde(rename = "a")]
    pub start_byte: u64,
    #[serde(rename = "b")]
    pub end_byte: u64,
    #[serde(rename = "k", with = "crate::utils::base64_bytes")]
    pub key_bytes: Vec<u8>,
}

impl QrPayload {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a scanned payload; the key length must match its byte bounds
    pub fn decode(text: &str) -> Result<Self> {
        let payload: QrPayload = serde_json::from_str(text)
            .map_err(|e| Error::Serialization(format!("unreadable visual payload: {}", e)))?;
        if payload.end_byte < payload.start_byte
            || payload.key_bytes.len() as u64 != payload.end_byte - payload.start_byte
        {
            return Err(Error::Serialization(format!(
                "visual payload carries {} key bytes for range [{}, {})",
                payload.key_bytes.len(),
                payload.start_byte,
                payload.end_byte
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let payload = QrPayload {
            session_id: "sess-1".into(),
            index: 2,
            start_byte: 2048,
            end_byte: 3072,
            key_bytes: vec![0xA5; 1024],
        };
        let text = payload.encode().unwrap();
        assert!(text.len() < 2048);
        assert!(text.contains("\"s\":"));
        assert_eq!(QrPayload::decode(&text).unwrap(), payload);
    }

    #[test]
    fn test_payload_length_mismatch_rejected() {
        let payload = QrPayload {
            session_id: "sess-1".into(),
            index: 0,
            start_byte: 0,
            end_byte: 1024,
            key_bytes: vec![1; 100],
        };
        let text = serde_json::to_string(&payload).unwrap();
        assert!(QrPayload::decode(&text).is_err());
    }

    #[test]
    fn test_completion_predicate() {
        let mut doc = KexSessionDoc {
            id: "sess-1".into(),
            source_id: "src".into(),
            participants: vec!["reader".into(), "src".into()],
            segments_by_peer: BTreeMap::new(),
            start_index: 0,
            end_index: 2,
            total_segments: 2,
            total_key_bytes: 2048,
            status: KexStatus::InProgress,
            created_at: 0,
        };
        assert!(!doc.is_complete());

        doc.segments_by_peer.insert("src".into(), vec![0, 1]);
        assert!(!doc.is_complete());

        doc.segments_by_peer.insert("reader".into(), vec![0]);
        assert!(!doc.is_complete());

        doc.segments_by_peer.insert("reader".into(), vec![0, 1]);
        assert!(doc.is_complete());
    }
}
