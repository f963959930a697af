//! KEX source and reader state machines
//!
//! Pure, in-memory state; all shared-store traffic goes through the
//! coordination layer. The source draws segments from the system CSPRNG and
//! rotates the incomplete ones; readers record whatever they manage to scan,
//! in any order. Both sides build the keystream by concatenating segments in
//! ascending index order.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::kex::{KexSessionDoc, KexStatus, QrPayload, SEGMENT_SIZE};
use crate::{KexSessionId, PeerId};

/// Source role: generates segments and drives the rotation
pub struct KexSource {
    session_id: KexSessionId,
    local_peer_id: PeerId,
    participants: Vec<PeerId>,
    total_bytes: u64,
    total_segments: u32,
    segment_data: BTreeMap<u32, Zeroizing<Vec<u8>>>,
    next_generate_index: u32,
    current_display: Option<u32>,
    received: BTreeMap<PeerId, BTreeSet<u32>>,
    rotation_interval: Duration,
    stall_increment: Duration,
    counts_at_rotation_start: BTreeMap<PeerId, usize>,
}

impl KexSource {
    pub fn new(
        local_peer_id: impl Into<PeerId>,
        participants: Vec<PeerId>,
        total_bytes: u64,
        rotation_interval: Duration,
        stall_increment: Duration,
    ) -> Result<Self> {
        if total_bytes == 0 {
            return Err(Error::InvalidState("key exchange needs at least one byte".into()));
        }
        let local_peer_id = local_peer_id.into();
        let mut participants = participants;
        participants.push(local_peer_id.clone());
        participants.sort();
        participants.dedup();

        let total_segments = total_bytes.div_ceil(SEGMENT_SIZE as u64) as u32;
        let received = participants
            .iter()
            .map(|p| (p.clone(), BTreeSet::new()))
            .collect();

        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            local_peer_id,
            participants,
            total_bytes,
            total_segments,
            segment_data: BTreeMap::new(),
            next_generate_index: 0,
            current_display: None,
            received,
            rotation_interval,
            stall_increment,
            counts_at_rotation_start: BTreeMap::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    /// Byte bounds of a segment; the last one may be short
    pub fn segment_bounds(&self, index: u32) -> (u64, u64) {
        let start = index as u64 * SEGMENT_SIZE as u64;
        let end = (start + SEGMENT_SIZE as u64).min(self.total_bytes);
        (start, end)
    }

    /// Draw the next fresh segment from the CSPRNG and display it
    pub fn generate_next_segment(&mut self) -> Result<QrPayload> {
        if self.next_generate_index >= self.total_segments {
            return Err(Error::InvalidState("all segments already generated".into()));
        }
        let index = self.next_generate_index;
        let (start, end) = self.segment_bounds(index);
        let mut bytes = vec![0u8; (end - start) as usize];
        OsRng.fill_bytes(&mut bytes);

        self.segment_data.insert(index, Zeroizing::new(bytes));
        self.mark_received_local(index);
        self.current_display = Some(index);
        self.next_generate_index += 1;

        if self.next_generate_index == self.total_segments {
            // entering rotation; baseline for stall detection
            self.snapshot_counts();
        }
        self.payload_for(index)
    }

    /// Restore previously generated bytes (e.g. a resumed session)
    pub fn add_segment_data(&mut self, start_byte: u64, bytes: Vec<u8>) -> Result<u32> {
        if start_byte % SEGMENT_SIZE as u64 != 0 {
            return Err(Error::InvalidState(format!(
                "segment start {} is not aligned",
                start_byte
            )));
        }
        let index = (start_byte / SEGMENT_SIZE as u64) as u32;
        if index >= self.total_segments {
            return Err(Error::InvalidState(format!(
                "segment index {} out of range",
                index
            )));
        }
        self.segment_data.insert(index, Zeroizing::new(bytes));
        self.mark_received_local(index);
        self.next_generate_index = self.next_generate_index.max(index + 1);
        Ok(index)
    }

    pub fn payload_for(&self, index: u32) -> Result<QrPayload> {
        let bytes = self.segment_data.get(&index).ok_or_else(|| {
            Error::InvalidState(format!("segment {} has no data", index))
        })?;
        let (start, end) = self.segment_bounds(index);
        Ok(QrPayload {
            session_id: self.session_id.clone(),
            index,
            start_byte: start,
            end_byte: end,
            key_bytes: bytes.to_vec(),
        })
    }

    /// Merge peer coverage from the coordination document
    pub fn apply_doc(&mut self, doc: &KexSessionDoc) {
        for (peer, indices) in &doc.segments_by_peer {
            let entry = self.received.entry(peer.clone()).or_default();
            entry.extend(indices.iter().copied());
        }
    }

    pub fn mark_received(&mut self, peer_id: &str, index: u32) {
        self.received
            .entry(peer_id.to_string())
            .or_default()
            .insert(index);
    }

    fn mark_received_local(&mut self, index: u32) {
        let peer = self.local_peer_id.clone();
        self.received.entry(peer).or_default().insert(index);
    }

    fn everyone_has(&self, index: u32) -> bool {
        self.participants.iter().all(|peer| {
            self.received
                .get(peer)
                .map(|set| set.contains(&index))
                .unwrap_or(false)
        })
    }

    /// Every participant, readers included, holds every segment
    pub fn is_complete(&self) -> bool {
        (0..self.total_segments).all(|index| self.everyone_has(index))
    }

    /// The next payload to display: fresh segments first, then rotation over
    /// whatever some participant is still missing. `None` once complete.
    pub fn next_payload(&mut self) -> Result<Option<QrPayload>> {
        if self.is_complete() {
            return Ok(None);
        }
        if self.next_generate_index < self.total_segments {
            return self.generate_next_segment().map(Some);
        }

        let Some(next) = self.next_display_index() else {
            return Ok(None);
        };
        // smallest-after-current selection wraps exactly once per rotation
        if let Some(current) = self.current_display {
            if next <= current {
                self.on_rotation_wrap();
            }
        }
        self.current_display = Some(next);
        self.payload_for(next).map(Some)
    }

    /// Smallest index not yet held by everyone, strictly after the currently
    /// displayed one, wrapping around
    fn next_display_index(&self) -> Option<u32> {
        let missing: Vec<u32> = (0..self.total_segments)
            .filter(|&index| !self.everyone_has(index))
            .collect();
        let first = *missing.first()?;
        match self.current_display {
            Some(current) => missing
                .iter()
                .find(|&&index| index > current)
                .copied()
                .or(Some(first)),
            None => Some(first),
        }
    }

    fn on_rotation_wrap(&mut self) {
        let stalled_reader = self
            .participants
            .iter()
            .filter(|peer| **peer != self.local_peer_id)
            .any(|peer| {
                let now = self.received.get(peer).map(|s| s.len()).unwrap_or(0);
                let before = self.counts_at_rotation_start.get(peer).copied().unwrap_or(0);
                now == before
            });
        if stalled_reader {
            // give scanners more time per frame
            self.rotation_interval += self.stall_increment;
        }
        self.snapshot_counts();
    }

    fn snapshot_counts(&mut self) {
        self.counts_at_rotation_start = self
            .received
            .iter()
            .map(|(peer, set)| (peer.clone(), set.len()))
            .collect();
    }

    /// Largest `L` such that every *other* participant holds all of
    /// `[0, L]`; the committed prefix for early termination
    pub fn last_universal_prefix(&self) -> Option<u32> {
        let mut last = None;
        for index in 0..self.total_segments {
            let all_others = self
                .participants
                .iter()
                .filter(|peer| **peer != self.local_peer_id)
                .all(|peer| {
                    self.received
                        .get(peer)
                        .map(|set| set.contains(&index))
                        .unwrap_or(false)
                });
            if all_others {
                last = Some(index);
            } else {
                break;
            }
        }
        last
    }

    /// Concatenate segments `[0, total_segments)` in ascending order
    pub fn build_key_bytes(&self, total_segments: u32, total_bytes: u64) -> Result<Vec<u8>> {
        build_bytes(&self.segment_data, total_segments, total_bytes)
    }
}

/// Reader role: records scanned segments and rebuilds the keystream
pub struct KexReader {
    session_id: KexSessionId,
    local_peer_id: PeerId,
    participants: Vec<PeerId>,
    total_segments: u32,
    total_key_bytes: u64,
    status: KexStatus,
    segment_data: BTreeMap<u32, Zeroizing<Vec<u8>>>,
    read: BTreeSet<u32>,
}

impl KexReader {
    pub fn new(doc: &KexSessionDoc, local_peer_id: impl Into<PeerId>) -> Self {
        Self {
            session_id: doc.id.clone(),
            local_peer_id: local_peer_id.into(),
            participants: doc.participants.clone(),
            total_segments: doc.total_segments,
            total_key_bytes: doc.total_key_bytes,
            status: doc.status,
            segment_data: BTreeMap::new(),
            read: BTreeSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    pub fn status(&self) -> KexStatus {
        self.status
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn indices_read(&self) -> &BTreeSet<u32> {
        &self.read
    }

    /// Store a scanned payload; returns the segment index recorded
    pub fn record_read_segment(&mut self, payload: &QrPayload) -> Result<u32> {
        if payload.session_id != self.session_id {
            return Err(Error::InvalidState(format!(
                "payload belongs to session {}",
                payload.session_id
            )));
        }
        if payload.start_byte % SEGMENT_SIZE as u64 != 0 {
            return Err(Error::InvalidState(format!(
                "segment start {} is not aligned",
                payload.start_byte
            )));
        }
        let index = (payload.start_byte / SEGMENT_SIZE as u64) as u32;
        if index != payload.index {
            return Err(Error::InvalidState(format!(
                "payload index {} disagrees with byte range start {}",
                payload.index, payload.start_byte
            )));
        }
        self.segment_data
            .insert(index, Zeroizing::new(payload.key_bytes.clone()));
        self.read.insert(index);
        Ok(index)
    }

    /// Pick up totals and status changes from the coordination document;
    /// early termination shrinks `total_segments` before deletion
    pub fn apply_doc(&mut self, doc: &KexSessionDoc) {
        self.total_segments = doc.total_segments;
        self.total_key_bytes = doc.total_key_bytes;
        self.status = doc.status;
    }

    pub fn has_all_segments(&self) -> bool {
        (0..self.total_segments).all(|index| self.read.contains(&index))
    }

    /// Concatenate everything scanned, in ascending index order
    pub fn build_key_bytes(&self) -> Result<Vec<u8>> {
        build_bytes(&self.segment_data, self.total_segments, self.total_key_bytes)
    }
}

fn build_bytes(
    segments: &BTreeMap<u32, Zeroizing<Vec<u8>>>,
    total_segments: u32,
    total_bytes: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_bytes as usize);
    for index in 0..total_segments {
        let bytes = segments.get(&index).ok_or_else(|| {
            Error::InvalidState(format!("segment {} was never recorded", index))
        })?;
        out.extend_from_slice(bytes);
    }
    out.truncate(total_bytes as usize);
    if out.len() as u64 != total_bytes {
        return Err(Error::InvalidState(format!(
            "built {} key bytes, session promises {}",
            out.len(),
            total_bytes
        )));
    }
    Ok(out)
}
