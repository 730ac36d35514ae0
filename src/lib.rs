//! # bytesim
//!
//! An instructional 8-bit CPU simulator.
//!
//! The machine has 256 bytes of memory, eight one-byte registers and an
//! eight-instruction ISA. The same machine state can be driven by two
//! engines: a single-cycle interpreter that runs one whole instruction per
//! tick, and a multi-cycle interpreter that walks each instruction through
//! Fetch, Decode, Execute, Memory and Writeback, one stage per tick.

pub mod cpu;
pub mod asm;
pub mod config;
pub mod dump;

#[cfg(feature = "tui")]
pub mod tui;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export commonly used types
pub use cpu::{Cpu, CpuState, CpuError, ExecMode, Fault, Instruction, Memory, Registers, Stage};
pub use asm::{assemble, disassemble, load_file, Diagnostic, LoaderError, Program};
pub use config::{DumpFormat, SimConfig};
pub use dump::{render_text, StateDump};

#[cfg(feature = "tui")]
pub use tui::run_debugger;
