//! CPU registers.
//!
//! The machine has 8 one-byte general registers (R0-R7) and a 16-bit
//! program counter.

use serde::{Serialize, Deserialize};
use std::fmt;

/// The number of general registers.
pub const NUM_REGS: usize = 8;

/// A validated general register index (0-7).
///
/// Register operands read from memory or program text go through
/// [`Reg::new`] before they can index the register file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Reg(u8);

impl Reg {
    /// Validate a raw register index.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < NUM_REGS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// The register number as an array index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The raw encoding byte.
    #[inline]
    pub const fn byte(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// The register file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// General registers R0-R7.
    pub gpr: [u8; NUM_REGS],

    /// Program counter.
    pub pc: u16,
}

impl Registers {
    /// Create a new register file with all values zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all registers to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Read a general register.
    #[inline]
    pub fn get(&self, reg: Reg) -> u8 {
        self.gpr[reg.index()]
    }

    /// Write a general register.
    #[inline]
    pub fn set(&mut self, reg: Reg, value: u8) {
        self.gpr[reg.index()] = value;
    }

    /// Advance the program counter by `len` bytes.
    /// Returns the old value.
    pub fn advance_pc(&mut self, len: u16) -> u16 {
        let old = self.pc;
        self.pc = self.pc.wrapping_add(len);
        old
    }

    /// Set the program counter to an absolute address.
    pub fn jump(&mut self, addr: u16) {
        self.pc = addr;
    }
}
