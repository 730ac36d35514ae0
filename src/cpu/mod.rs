//! CPU emulation.
//!
//! This module implements the complete machine:
//! - 256 bytes of memory
//! - 8 one-byte general registers and a 16-bit program counter
//! - an 8-instruction set with 1-3 byte encodings
//! - a single-cycle engine ([`Cpu::step`]) and a five-stage multi-cycle
//!   engine ([`Cpu::step_stage`]) over the same state

pub mod memory;
pub mod registers;
pub mod decode;
pub mod execute;
pub mod pipeline;

pub use memory::{Memory, MemoryError, MEMORY_SIZE};
pub use registers::{Reg, Registers, NUM_REGS};
pub use decode::{Instruction, Opcode, OperandShape, DecodeError};
pub use execute::{Cpu, CpuError, CpuState, ExecMode, Fault};
pub use pipeline::{Pipeline, Stage};
