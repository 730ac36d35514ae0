//! Byte-addressable main memory.
//!
//! The machine has 256 one-byte cells. Every address the CPU produces is
//! checked against this bound; an out-of-range access is a fault, never a
//! wrap-around.

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// The number of addressable bytes.
pub const MEMORY_SIZE: usize = 256;

/// Main memory: 256 byte cells, zeroed on creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    cells: Vec<u8>,
}

impl Memory {
    /// Create a new memory with all cells zeroed.
    pub fn new() -> Self {
        Self {
            cells: vec![0; MEMORY_SIZE],
        }
    }

    /// Whether `addr` names a cell.
    #[inline]
    pub fn contains(addr: u16) -> bool {
        (addr as usize) < MEMORY_SIZE
    }

    /// Read a cell.
    #[inline]
    pub fn read(&self, addr: u16) -> Result<u8, MemoryError> {
        self.cells
            .get(addr as usize)
            .copied()
            .ok_or(MemoryError::AddressOutOfRange(addr))
    }

    /// Write a cell.
    #[inline]
    pub fn write(&mut self, addr: u16, value: u8) -> Result<(), MemoryError> {
        let cell = self.cells
            .get_mut(addr as usize)
            .ok_or(MemoryError::AddressOutOfRange(addr))?;
        *cell = value;
        Ok(())
    }

    /// Clear all memory to zeros.
    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Copy a program image into memory starting at `start_addr`.
    pub fn load_program(&mut self, start_addr: usize, image: &[u8]) -> Result<(), MemoryError> {
        let available = MEMORY_SIZE.saturating_sub(start_addr);
        if image.len() > available {
            return Err(MemoryError::ProgramTooLarge {
                size: image.len(),
                available,
            });
        }

        self.cells[start_addr..start_addr + image.len()].copy_from_slice(image);
        Ok(())
    }

    /// The full memory contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.cells
    }

    /// Dump a range of cells as `(address, value)` pairs.
    pub fn dump(&self, start: usize, count: usize) -> Vec<(usize, u8)> {
        let end = (start + count).min(MEMORY_SIZE);
        (start.min(end)..end)
            .map(|i| (i, self.cells[i]))
            .collect()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only count non-zero cells
        let non_zero = self.cells.iter().filter(|&&b| b != 0).count();

        f.debug_struct("Memory")
            .field("non_zero_cells", &non_zero)
            .field("total_cells", &MEMORY_SIZE)
            .finish()
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Address is outside valid memory range.
    #[error("memory address {0} out of range (0-{})", MEMORY_SIZE - 1)]
    AddressOutOfRange(u16),
    /// Program is too large to fit in memory.
    #[error("program size {size} exceeds available space {available}")]
    ProgramTooLarge { size: usize, available: usize },
}
