//! Per-message nonce tracking and resynchronization.
//!
//! The nonce is an 8-byte counter incremented little-endian (byte 0 first)
//! after every send. On receive, a peer nonce that compares greater becomes
//! the new local floor so a node that lost its state cannot reuse nonces the
//! peer has already seen from it.
//!
//! Replaying an old envelope is not detected: the envelope still decrypts and
//! the local nonce is simply left alone.

use std::cmp::Ordering;

use crate::cipher::NONCE_SIZE;

/// An 8-byte message nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// The all-zero nonce a node starts from.
    pub const ZERO: Nonce = Nonce([0u8; NONCE_SIZE]);

    /// Wraps raw nonce bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Nonce bytes, in wire order.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Increments with carry from byte 0 upward. All-0xFF wraps to zero.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    /// Returns the incremented nonce, leaving `self` unchanged.
    pub fn next(&self) -> Self {
        let mut next = *self;
        next.increment();
        next
    }

    /// Adopts `peer` if it compares greater, then increments it once.
    ///
    /// Returns true if the local nonce changed.
    pub fn resync_on_receive(&mut self, peer: &Nonce) -> bool {
        if compare(peer, self) != Ordering::Greater {
            return false;
        }
        *self = *peer;
        self.increment();
        true
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

/// Compares two nonces by scanning from byte 0; the first differing byte
/// decides.
///
/// This is not a numeric comparison (byte 0 is the least significant byte of
/// the counter) and not constant-time. Only use it for resync.
pub fn compare(a: &Nonce, b: &Nonce) -> Ordering {
    for (x, y) in a.0.iter().zip(b.0.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
