//! Read-only state dumps.
//!
//! [`render_text`] produces the classic register + memory listing;
//! [`StateDump`] is the same information as a serializable value for JSON
//! output.

use crate::cpu::{Cpu, CpuState, Fault, Stage, MEMORY_SIZE, NUM_REGS};
use serde::Serialize;
use std::fmt::Write;

/// Bytes per row in the text memory dump.
const ROW_WIDTH: usize = 16;

/// Snapshot of everything a dump shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateDump {
    pub registers: [u8; NUM_REGS],
    pub pc: u16,
    pub state: CpuState,
    pub stage: Stage,
    pub cycles: u64,
    pub retired: u64,
    pub fault: Option<String>,
    pub memory: Vec<u8>,
}

impl StateDump {
    pub fn capture(cpu: &Cpu) -> Self {
        Self {
            registers: cpu.regs.gpr,
            pc: cpu.regs.pc,
            state: cpu.state,
            stage: cpu.pipeline.stage,
            cycles: cpu.cycles,
            retired: cpu.retired,
            fault: cpu.fault.as_ref().map(Fault::to_string),
            memory: cpu.mem.as_slice().to_vec(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Registers, PC and all of memory in decimal, 16 bytes per row.
pub fn render_text(cpu: &Cpu) -> String {
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "----- CPU Registers -----");
    for (i, value) in cpu.regs.gpr.iter().enumerate() {
        let _ = writeln!(out, "regs[{}] = {}", i, value);
    }
    let _ = writeln!(out, "PC = {}", cpu.regs.pc);

    let _ = writeln!(out);
    let _ = write!(out, "----- Memory Dump ({} bytes, Decimal) -----", MEMORY_SIZE);
    for (addr, byte) in cpu.mem.as_slice().iter().enumerate() {
        if addr % ROW_WIDTH == 0 {
            let _ = write!(out, "\n{:3}: ", addr);
        }
        let _ = write!(out, "{:3} ", byte);
    }
    out.push('\n');

    out
}
