//! Cryptographic primitives for Padlock
//!
//! The pad itself does all the heavy lifting: encryption is plain XOR against
//! key bytes that are used exactly once. What lives here is the codec and the
//! anonymous acknowledgment markers.

pub mod ack;
pub mod otp;
