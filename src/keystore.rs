//! Preshared key provisioning and verification.
//!
//! Record layout in persistent storage:
//! - \[0x00..0x20\]: key (32 bytes)
//! - \[0x20\]:       XOR checksum of the key bytes
//! - \[0x40\]:       presence marker (0xA5)
//!
//! The marker is written last, so a record without it is treated as absent.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::storage::PersistentStore;
use crate::types::{
    LinkError, PskState, Result, EEPROM_ERASED, PSK_ADDRESS, PSK_CHECKSUM_ADDRESS, PSK_LENGTH, PSK_MAGIC_ADDRESS,
    PSK_MAGIC_VALUE,
};

/// Key compiled into every node, used when storage holds no key.
///
/// Anyone holding a copy of the binary can recover this key. It exists so a
/// fresh node can talk without manual provisioning; replace it with
/// `salsalink provision` on any node that matters.
pub const FALLBACK_KEY: [u8; PSK_LENGTH] = [
    0xA7, 0xF1, 0xD9, 0x2A, 0x82, 0xC8, 0xD8, 0xFE, 0x43, 0x4D, 0x98, 0x55, 0x8C, 0xE2, 0xB3, 0x47,
    0x17, 0x11, 0x98, 0x54, 0x2F, 0x11, 0x2D, 0x05, 0x58, 0xF5, 0x6B, 0xD6, 0x88, 0x07, 0x99, 0x92,
];

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// A 256-bit preshared key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; PSK_LENGTH]);

impl PresharedKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; PSK_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Copies a key from a slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PSK_LENGTH {
            return Err(LinkError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; PSK_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Parses a key from 64 hex characters.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(text.trim()).map_err(|e| LinkError::InvalidHex(e.to_string()))?,
        );
        Self::from_slice(&bytes)
    }

    /// Generates a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; PSK_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// The compiled-in fallback key.
    pub fn fallback() -> Self {
        Self(FALLBACK_KEY)
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8; PSK_LENGTH] {
        &self.0
    }

    /// XOR checksum of the key bytes.
    pub fn checksum(&self) -> u8 {
        xor_checksum(&self.0)
    }

    /// True if the key is all 0x00 or all 0xFF.
    pub fn is_degenerate(&self) -> bool {
        is_degenerate(&self.0)
    }

    /// True if this is the compiled-in fallback key.
    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_KEY
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PresharedKey(checksum={:02X})", self.checksum())
    }
}

fn is_degenerate(bytes: &[u8; PSK_LENGTH]) -> bool {
    bytes.iter().all(|&b| b == 0x00) || bytes.iter().all(|&b| b == 0xFF)
}

/// Outcome of loading the key record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLoad {
    /// Record present and checksum matches.
    Valid(PresharedKey),
    /// No presence marker.
    Invalid,
    /// Marker present but checksum does not match.
    Corrupt,
}

impl KeyLoad {
    /// The corresponding key state.
    pub fn state(&self) -> PskState {
        match self {
            KeyLoad::Valid(_) => PskState::Valid,
            KeyLoad::Invalid => PskState::Invalid,
            KeyLoad::Corrupt => PskState::Error,
        }
    }

    /// The error describing a failed load, if any.
    pub fn error(&self) -> Option<LinkError> {
        match self {
            KeyLoad::Valid(_) => None,
            KeyLoad::Invalid => Some(LinkError::KeyInvalid),
            KeyLoad::Corrupt => Some(LinkError::KeyCorrupt),
        }
    }
}

/// Loads, verifies and persists the preshared key.
#[derive(Debug)]
pub struct KeyStore<S: PersistentStore> {
    store: S,
}

impl<S: PersistentStore> KeyStore<S> {
    /// Creates a key store over the given storage.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Loads the key record.
    ///
    /// Key bytes are only read when the presence marker matches.
    pub fn load(&mut self) -> Result<KeyLoad> {
        let marker = self.store.read_byte(PSK_MAGIC_ADDRESS)?;
        debug!(marker = format_args!("{:02X}", marker), "Read PSK presence marker");

        if marker != PSK_MAGIC_VALUE {
            warn!("PSK presence marker missing");
            return Ok(KeyLoad::Invalid);
        }

        let mut key = Zeroizing::new([0u8; PSK_LENGTH]);
        let mut checksum = 0u8;
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = self.store.read_byte(PSK_ADDRESS + i)?;
            checksum ^= *byte;
        }

        let stored_checksum = self.store.read_byte(PSK_CHECKSUM_ADDRESS)?;
        debug!(
            calculated = format_args!("{:02X}", checksum),
            stored = format_args!("{:02X}", stored_checksum),
            "PSK checksum"
        );

        if checksum != stored_checksum {
            warn!("PSK checksum verification failed");
            return Ok(KeyLoad::Corrupt);
        }

        info!("PSK loaded");
        Ok(KeyLoad::Valid(PresharedKey::from_bytes(*key)))
    }

    /// Classifies a candidate key against the stored checksum.
    ///
    /// All-zero and all-0xFF keys are `Invalid` whatever the stored checksum.
    pub fn verify(&mut self, key: &[u8; PSK_LENGTH]) -> Result<PskState> {
        if is_degenerate(key) {
            warn!(error = %LinkError::KeyDegenerate, "PSK verification failed");
            return Ok(PskState::Invalid);
        }

        let stored_checksum = self.store.read_byte(PSK_CHECKSUM_ADDRESS)?;
        if xor_checksum(key) != stored_checksum {
            warn!(error = %LinkError::KeyCorrupt, "PSK verification failed");
            return Ok(PskState::Error);
        }

        debug!("PSK verification successful");
        Ok(PskState::Valid)
    }

    /// Writes the key, its checksum and the presence marker, in that order.
    pub fn store(&mut self, key: &PresharedKey) -> Result<()> {
        for (i, &byte) in key.as_bytes().iter().enumerate() {
            self.store.write_byte(PSK_ADDRESS + i, byte)?;
        }
        self.store.write_byte(PSK_CHECKSUM_ADDRESS, key.checksum())?;
        self.store.write_byte(PSK_MAGIC_ADDRESS, PSK_MAGIC_VALUE)?;

        info!(checksum = format_args!("{:02X}", key.checksum()), "PSK stored");
        Ok(())
    }

    /// Persists the compiled-in fallback key and returns it.
    pub fn initialize_default(&mut self) -> Result<PresharedKey> {
        let key = PresharedKey::fallback();
        warn!("No provisioned PSK, installing the compiled-in fallback key");
        self.store(&key)?;
        Ok(key)
    }

    /// Current state of the stored record, without returning the key.
    pub fn status(&mut self) -> Result<PskState> {
        let loaded = self.load()?;
        match &loaded {
            KeyLoad::Valid(key) if key.is_degenerate() => Ok(PskState::Invalid),
            other => Ok(other.state()),
        }
    }

    /// Erases the presence marker so the next load reports no key.
    pub fn clear(&mut self) -> Result<()> {
        self.store.write_byte(PSK_MAGIC_ADDRESS, EEPROM_ERASED)?;
        info!("PSK record cleared");
        Ok(())
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.store
    }

    /// Mutable access to the underlying storage.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
