//! Program loader and disassembler.
//!
//! This module provides:
//! - A line-oriented loader (program text → memory image + register values)
//! - A disassembler (memory → loader syntax)

pub mod loader;
pub mod disasm;

pub use loader::{assemble, load_file, Diagnostic, ListingEntry, LoaderError, Program};
pub use disasm::disassemble;
