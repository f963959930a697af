//! Shared keystream management
//!
//! A `SharedKey` is the in-memory view of one conversation's one-time pad:
//! the bytes still available on this device, the absolute consumption
//! frontier, and the operation history that proves no byte was used twice.
//! On-disk state is owned exclusively by the lifecycle engine.

pub mod history;
pub mod interval;
pub mod lifecycle;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::key::history::KeyHistory;
use crate::key::interval::Interval;
use crate::utils::now_ms;
use crate::{ConversationId, PeerId};

/// One conversation's keystream on this device.
///
/// The bytes held correspond to the absolute range
/// `[next_available_byte, next_available_byte + bytes.len())`; every absolute
/// index below the frontier has been consumed and erased.
#[derive(Debug, Clone)]
pub struct SharedKey {
    id: ConversationId,
    bytes: Zeroizing<Vec<u8>>,
    peer_ids: Vec<PeerId>,
    created_at: u64,
    history: KeyHistory,
    next_available_byte: u64,
}

impl SharedKey {
    /// Reconstruct a key from stored parts.
    ///
    /// A non-empty byte string with an empty history gets a synthetic
    /// "migrated" extension so the algebra stays closed over old state.
    pub fn new(
        id: impl Into<ConversationId>,
        bytes: Vec<u8>,
        peer_ids: Vec<PeerId>,
        created_at: u64,
        history: KeyHistory,
        next_available_byte: u64,
    ) -> Result<Self> {
        let id = id.into();
        let mut peer_ids = peer_ids;
        peer_ids.sort();
        peer_ids.dedup();

        let mut history = history;
        if history.is_empty() && !bytes.is_empty() {
            let segment = Interval::new(
                id.clone(),
                next_available_byte,
                next_available_byte + bytes.len() as u64,
            )?;
            // seed the log so current() lines up with the stored range
            let mut seeded = KeyHistory::new(id.clone());
            seeded.record_migrated(segment, next_available_byte)?;
            history = seeded;
        }

        Ok(Self {
            id,
            bytes: Zeroizing::new(bytes),
            peer_ids,
            created_at,
            history,
            next_available_byte,
        })
    }

    /// Build a fresh key from a completed key exchange, frontier at zero
    pub fn from_kex(
        id: impl Into<ConversationId>,
        bytes: Vec<u8>,
        peer_ids: Vec<PeerId>,
        kex_id: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let mut history = KeyHistory::new(id.clone());
        history.record_extension(
            Interval::from_length(id.clone(), bytes.len() as u64),
            "key exchange",
            Some(kex_id.into()),
        )?;
        Self::new(id, bytes, peer_ids, now_ms(), history, 0)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_ids(&self) -> &[PeerId] {
        &self.peer_ids
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn history(&self) -> &KeyHistory {
        &self.history
    }

    pub fn next_available_byte(&self) -> u64 {
        self.next_available_byte
    }

    /// Bytes still available on this device
    pub fn available_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Current interval `[next_available_byte, next_available_byte + len)`
    pub fn interval(&self) -> Interval {
        Interval {
            conversation_id: self.id.clone(),
            start: self.next_available_byte,
            end: self.next_available_byte + self.bytes.len() as u64,
        }
    }

    /// The next `n` allocatable bytes, if that many remain
    pub fn find_available_segment_by_bytes(&self, n: u64) -> Option<Interval> {
        if n <= self.bytes.len() as u64 {
            Some(Interval {
                conversation_id: self.id.clone(),
                start: self.next_available_byte,
                end: self.next_available_byte + n,
            })
        } else {
            None
        }
    }

    /// Copy out key bytes for the absolute range `[abs_start, abs_start + n)`
    pub fn extract_key_bytes(&self, abs_start: u64, n: u64) -> Result<Vec<u8>> {
        let interval = self.interval();
        if abs_start < interval.start || abs_start + n > interval.end {
            return Err(Error::InvalidInterval(format!(
                "requested [{}, {}) outside available {}",
                abs_start,
                abs_start + n,
                interval
            )));
        }
        let offset = (abs_start - self.next_available_byte) as usize;
        Ok(self.bytes[offset..offset + n as usize].to_vec())
    }

    /// Record consumption of `[abs_start, abs_end)` and advance the frontier.
    ///
    /// The frontier never decreases; a range already below it is a no-op.
    /// Returns the number of bytes newly consumed.
    pub fn mark_bytes_as_used(
        &mut self,
        abs_start: u64,
        abs_end: u64,
        reason: &str,
        ref_id: Option<String>,
    ) -> Result<u64> {
        if abs_end <= self.next_available_byte {
            return Ok(0);
        }
        if abs_start > self.next_available_byte {
            return Err(Error::InvalidInterval(format!(
                "consumption starting at {} would leave a gap after {}",
                abs_start, self.next_available_byte
            )));
        }
        let interval = self.interval();
        if abs_end > interval.end {
            return Err(Error::InvalidInterval(format!(
                "consumption up to {} exceeds available {}",
                abs_end, interval
            )));
        }

        let segment = Interval::new(self.id.clone(), self.next_available_byte, abs_end)?;
        let removed = segment.len();
        self.history
            .record_consumption(segment, reason, ref_id)?;
        self.bytes.drain(..removed as usize);
        self.next_available_byte = abs_end;
        Ok(removed)
    }

    /// Append fresh key material from a key exchange
    pub fn extend(mut self, additional: Vec<u8>, kex_id: Option<String>) -> Result<SharedKey> {
        let segment = self.interval().extend_segment(additional.len() as u64);
        self.history
            .record_extension(segment, "key exchange", kex_id)?;
        self.bytes.extend_from_slice(&additional);
        Ok(self)
    }

    /// Reconcile the history with the frontier and the held bytes
    pub fn validate_state(&self) -> Result<()> {
        self.history.validate().map_err(|e| {
            Error::KeyCorrupted(format!("history invalid for {}: {}", self.id, e))
        })?;
        let current = self.history.current();
        let interval = self.interval();
        if current != interval {
            return Err(Error::KeyCorrupted(format!(
                "history current {} disagrees with held bytes {}",
                current, interval
            )));
        }
        let accounted = self.history.origin() + self.history.consumed_total();
        if accounted != self.next_available_byte {
            return Err(Error::KeyCorrupted(format!(
                "history accounts for {} consumed bytes, frontier is {}",
                accounted, self.next_available_byte
            )));
        }
        Ok(())
    }
}
