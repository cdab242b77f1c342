//! Type definitions and link constants for salsalink.

use thiserror::Error;

/// Length of the preshared key in bytes (256-bit key).
pub const PSK_LENGTH: usize = 32;

/// Storage address of the first key byte. The checksum follows the key.
pub const PSK_ADDRESS: usize = 0x00;

/// Storage address of the checksum byte.
pub const PSK_CHECKSUM_ADDRESS: usize = PSK_ADDRESS + PSK_LENGTH;

/// Storage address of the presence marker.
pub const PSK_MAGIC_ADDRESS: usize = 0x40;

/// Marker value written once a key record is complete.
pub const PSK_MAGIC_VALUE: u8 = 0xA5;

/// Size of the nonce header prefixed to every envelope.
pub const NONCE_HEADER_SIZE: usize = 8;

/// Maximum mesh payload size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 109;

/// Capacity of the sender's input buffer.
pub const INPUT_BUFFER_SIZE: usize = MAX_PAYLOAD_SIZE - NONCE_HEADER_SIZE;

/// Mesh endpoint used for both source and destination.
pub const APP_ENDPOINT: u8 = 1;

/// Network address taken by a node in sender mode.
pub const SENDER_ADDRESS: u16 = 1;

/// Network address taken by a node in listener mode.
pub const LISTENER_ADDRESS: u16 = 0;

/// Size of the emulated EEPROM in bytes.
pub const EEPROM_SIZE: usize = 8192;

/// Value of an erased EEPROM cell.
pub const EEPROM_ERASED: u8 = 0xFF;

/// Classification of the preshared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PskState {
    /// No key present, or the key is a degenerate storage pattern.
    #[default]
    Invalid,
    /// Key loaded and its checksum matches.
    Valid,
    /// Key present but the checksum does not match.
    Error,
}

/// Errors that can occur on the secure link.
#[derive(Error, Debug)]
pub enum LinkError {
    // Key Errors
    /// No stored key record was found.
    #[error("No preshared key present in storage")]
    KeyInvalid,

    /// Stored key failed checksum verification.
    #[error("Preshared key checksum mismatch")]
    KeyCorrupt,

    /// Key is all 0x00 or all 0xFF.
    #[error("Preshared key is a blank storage pattern")]
    KeyDegenerate,

    /// Wrong number of key bytes.
    #[error("Invalid key length: expected {PSK_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Key text is not valid hex.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    // Frame Errors
    /// Received envelope does not carry any ciphertext.
    #[error("Received data too short: {0} bytes (nonce header is {NONCE_HEADER_SIZE})")]
    FrameTooShort(usize),

    /// Envelope would exceed the mesh payload size.
    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    // Session Errors
    /// A previous send has not been confirmed yet.
    #[error("Previous send not confirmed, message dropped")]
    SendSuppressed,

    // Storage Errors
    /// Storage access failed.
    #[error("Storage failed: {0}")]
    Storage(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Returns true for bytes that are shown on the console as-is.
pub fn is_printable(byte: u8) -> bool {
    (32..=126).contains(&byte)
}

/// Returns true for carriage return and line feed.
pub fn is_line_end(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}
