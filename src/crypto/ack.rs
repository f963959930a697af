//! Anonymous acknowledgment markers
//!
//! Devices must not publish stable identifiers on messages. An ack id is a
//! one-letter kind prefix followed by 15 base64url characters of
//! `SHA-256(microsecond timestamp || 16 random bytes)` — unlinkable across
//! messages and across devices, with ~90 bits against collision.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::utils::now_micros;

/// Length of the random part after the kind prefix
pub const ACK_ID_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Transfer,
    Read,
}

impl AckKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AckKind::Transfer => "T",
            AckKind::Read => "R",
        }
    }

    pub fn matches(self, ack_id: &str) -> bool {
        ack_id.starts_with(self.prefix())
    }
}

/// Mint a fresh, unlinkable ack id
pub fn generate_ack_id(kind: AckKind) -> String {
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);

    let mut hasher = Sha256::new();
    hasher.update(now_micros().to_be_bytes());
    hasher.update(entropy);
    let digest = hasher.finalize();

    let encoded = URL_SAFE_NO_PAD.encode(digest);
    format!("{}{}", kind.prefix(), &encoded[..ACK_ID_LEN])
}

/// How many acks of the given kind a set contains
pub fn count_kind<'a, I: IntoIterator<Item = &'a String>>(acks: I, kind: AckKind) -> usize {
    acks.into_iter().filter(|a| kind.matches(a)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    #[test]
    fn test_shape() {
        let t = generate_ack_id(AckKind::Transfer);
        let r = generate_ack_id(AckKind::Read);
        assert_eq!(t.len(), 1 + ACK_ID_LEN);
        assert_eq!(r.len(), 1 + ACK_ID_LEN);
        assert!(t.starts_with('T'));
        assert!(r.starts_with('R'));
        // base64url alphabet only after the prefix
        assert!(t[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_unlinkable() {
        // beyond the one-char kind prefix, ids share no common prefix
        let ids: Vec<String> = (0..200).map(|_| generate_ack_id(AckKind::Transfer)).collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        for pair in ids.windows(2) {
            let a = &pair[0][1..];
            let b = &pair[1][1..];
            let common = a
                .chars()
                .zip(b.chars())
                .take_while(|(x, y)| x == y)
                .count();
            assert!(common < 8, "suspiciously long shared prefix");
        }
    }

    #[test]
    fn test_count_kind() {
        let mut acks = BTreeSet::new();
        acks.insert(generate_ack_id(AckKind::Transfer));
        acks.insert(generate_ack_id(AckKind::Transfer));
        acks.insert(generate_ack_id(AckKind::Read));
        assert_eq!(count_kind(&acks, AckKind::Transfer), 2);
        assert_eq!(count_kind(&acks, AckKind::Read), 1);
    }
}
