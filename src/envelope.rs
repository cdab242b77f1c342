//! Envelope encoding and decoding for the secure link.
//!
//! Wire format (8-byte header + variable ciphertext):
//! - \[0..8\]: nonce
//! - \[8..\]:  Salsa20 ciphertext, same length as the plaintext
//!
//! There is no integrity tag: a corrupted ciphertext decrypts to garbage.

use tracing::debug;

use crate::cipher::{salsa20_xor, NONCE_SIZE};
use crate::config::LinkConfig;
use crate::keystore::PresharedKey;
use crate::nonce::Nonce;
use crate::types::{is_printable, LinkError, Result, NONCE_HEADER_SIZE};

/// Secure link message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Nonce the ciphertext was produced with.
    pub nonce: Nonce,
    /// Encrypted message (variable length).
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        NONCE_HEADER_SIZE + self.ciphertext.len()
    }

    /// True if the envelope carries no ciphertext.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// Encode the envelope to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len());
        data.extend_from_slice(self.nonce.as_bytes());
        data.extend_from_slice(&self.ciphertext);
        data
    }

    /// Decode bytes into an envelope.
    ///
    /// Data of 8 bytes or less carries no message and is rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() <= NONCE_HEADER_SIZE {
            return Err(LinkError::FrameTooShort(data.len()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_HEADER_SIZE]);

        Ok(Self {
            nonce: Nonce::from_bytes(nonce),
            ciphertext: data[NONCE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// A decrypted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Nonce carried by the envelope.
    pub nonce: Nonce,
    /// Recovered plaintext bytes, unmodified.
    pub plaintext: Vec<u8>,
}

impl DecodedMessage {
    /// Plaintext for display, with bytes outside 32..=126 shown as `.`.
    pub fn printable(&self) -> String {
        printable(&self.plaintext)
    }
}

/// Renders bytes for the console, replacing non-printable bytes with `.`.
pub fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if is_printable(b) { b as char } else { '.' })
        .collect()
}

/// Encrypts a plaintext under `nonce` and wraps it in an envelope.
pub fn encode_outbound(
    key: &PresharedKey,
    nonce: &Nonce,
    plaintext: &[u8],
    config: &LinkConfig,
) -> Result<Envelope> {
    let total = NONCE_HEADER_SIZE + plaintext.len();
    if total > config.max_payload_size {
        return Err(LinkError::PayloadTooLarge(total));
    }

    let ciphertext = salsa20_xor(
        key.as_bytes(),
        nonce.as_bytes(),
        config.counter_mode,
        plaintext,
    );
    debug!(nonce = %nonce, ciphertext = %hex::encode_upper(&ciphertext), "Encrypted message");

    Ok(Envelope {
        nonce: *nonce,
        ciphertext,
    })
}

/// Splits an inbound frame and decrypts it with the envelope's nonce.
///
/// Frames of 8 bytes or less fail with [`LinkError::FrameTooShort`] before
/// any decryption is attempted.
pub fn decode_inbound(key: &PresharedKey, data: &[u8], config: &LinkConfig) -> Result<DecodedMessage> {
    let envelope = Envelope::decode(data)?;
    debug!(
        nonce = %envelope.nonce,
        ciphertext = %hex::encode_upper(&envelope.ciphertext),
        "Decrypting message"
    );

    let plaintext = salsa20_xor(
        key.as_bytes(),
        envelope.nonce.as_bytes(),
        config.counter_mode,
        &envelope.ciphertext,
    );

    Ok(DecodedMessage {
        nonce: envelope.nonce,
        plaintext,
    })
}
