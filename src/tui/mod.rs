//! TUI debugger.
//!
//! Provides an interactive terminal-based debugger with:
//! - Register and PC view
//! - Pipeline stage strip with the in-flight instruction and ALU scratch
//! - Memory grid
//! - Stage/instruction stepping, run, breakpoints and engine switching
//! - Disassembly view

mod app;
mod ui;

pub use app::{DebuggerApp, run_debugger};
