//! Persistent byte storage for the key record.
//!
//! This module provides the byte-addressable store the key record lives in,
//! an in-memory implementation for tests and a file-backed EEPROM image for
//! the binary.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::{LinkError, Result, EEPROM_ERASED, EEPROM_SIZE};

// ============================================================================
// Persistent Store
// ============================================================================

/// Trait for byte-addressable persistent storage.
///
/// Every call completes before returning; a write is durable once it returns.
pub trait PersistentStore {
    /// Read one byte.
    fn read_byte(&mut self, address: usize) -> Result<u8>;

    /// Write one byte.
    fn write_byte(&mut self, address: usize, value: u8) -> Result<()>;

    /// Number of addressable bytes.
    fn capacity(&self) -> usize;
}

fn check_address(address: usize, capacity: usize) -> Result<()> {
    if address >= capacity {
        return Err(LinkError::Storage(format!(
            "Address {:#06x} out of range (capacity {})",
            address, capacity
        )));
    }
    Ok(())
}

// ============================================================================
// Memory EEPROM
// ============================================================================

/// In-memory implementation of PersistentStore.
///
/// Starts fully erased (0xFF), like a factory-fresh EEPROM.
#[derive(Debug, Clone)]
pub struct MemoryEeprom {
    cells: Vec<u8>,
}

impl MemoryEeprom {
    /// Creates an erased store of the default size.
    pub fn new() -> Self {
        Self::with_capacity(EEPROM_SIZE)
    }

    /// Creates an erased store with the given size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: vec![EEPROM_ERASED; capacity],
        }
    }

    /// Raw view of the stored bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.cells
    }

    /// Mutable raw view, for simulating corruption.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.cells
    }
}

impl Default for MemoryEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for MemoryEeprom {
    fn read_byte(&mut self, address: usize) -> Result<u8> {
        check_address(address, self.cells.len())?;
        Ok(self.cells[address])
    }

    fn write_byte(&mut self, address: usize, value: u8) -> Result<()> {
        check_address(address, self.cells.len())?;
        self.cells[address] = value;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

// ============================================================================
// File EEPROM
// ============================================================================

/// EEPROM image stored in a file.
///
/// A missing file is created erased. Writes go straight to the file.
#[derive(Debug)]
pub struct FileEeprom {
    path: PathBuf,
    file: File,
    capacity: usize,
}

impl FileEeprom {
    /// Opens an image of the default size, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(path, EEPROM_SIZE)
    }

    /// Opens an image with the given size, creating it if needed.
    ///
    /// An existing image shorter than `capacity` is padded with erased bytes.
    pub fn open_with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len() as usize;
        if len < capacity {
            debug!(path = %path.display(), len, capacity, "Padding EEPROM image");
            file.seek(SeekFrom::Start(len as u64))?;
            file.write_all(&vec![EEPROM_ERASED; capacity - len])?;
            file.sync_data()?;
        }

        Ok(Self {
            path,
            file,
            capacity,
        })
    }

    /// Path of the image file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentStore for FileEeprom {
    fn read_byte(&mut self, address: usize) -> Result<u8> {
        check_address(address, self.capacity)?;
        let mut byte = [0u8; 1];
        self.file.seek(SeekFrom::Start(address as u64))?;
        self.file.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn write_byte(&mut self, address: usize, value: u8) -> Result<()> {
        check_address(address, self.capacity)?;
        self.file.seek(SeekFrom::Start(address as u64))?;
        self.file.write_all(&[value])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
