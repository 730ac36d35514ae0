//! WebAssembly bindings for the simulator.
//!
//! This module provides JavaScript-friendly wrappers around the core simulator.

use js_sys::Uint8Array;
use wasm_bindgen::prelude::*;
use crate::asm::{assemble, Program};
use crate::asm::disasm::disassemble_at;
use crate::cpu::{Cpu, ExecMode, Memory, MEMORY_SIZE, NUM_REGS};
use crate::dump::StateDump;

/// Initialize panic hook for better error messages in console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// WebAssembly-friendly CPU wrapper.
#[wasm_bindgen]
pub struct WasmCpu {
    cpu: Cpu,
    program: Program,
}

#[wasm_bindgen]
impl WasmCpu {
    /// Create a new CPU instance.
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            program: Program::default(),
        }
    }

    /// Load a program from source text. Returns the number of skipped lines.
    #[wasm_bindgen]
    pub fn load_program(&mut self, source: &str) -> Result<usize, JsError> {
        let program = assemble(source)
            .map_err(|e| JsError::new(&format!("{}", e)))?;

        let skipped = program.diagnostics.len();
        self.program = program;
        self.reset();
        Ok(skipped)
    }

    /// Run one pipeline stage. Returns the stage that ran.
    #[wasm_bindgen]
    pub fn step_stage(&mut self) -> Result<String, JsError> {
        let stage = self.cpu.step_stage()
            .map_err(|e| JsError::new(&format!("{}", e)))?;
        Ok(stage.to_string())
    }

    /// Run one whole instruction. Returns its text.
    #[wasm_bindgen]
    pub fn step_instruction(&mut self) -> Result<String, JsError> {
        let instr = self.cpu.step()
            .map_err(|e| JsError::new(&format!("{}", e)))?;
        Ok(instr.to_string())
    }

    /// Run until halt, fault or `max_cycles` ticks. Returns the ticks this
    /// call ran, including one that faulted.
    #[wasm_bindgen]
    pub fn run(&mut self, multi_cycle: bool, max_cycles: u32) -> u64 {
        let mode = if multi_cycle { ExecMode::Multi } else { ExecMode::Single };
        run_ticks(&mut self.cpu, mode, u64::from(max_cycles))
    }

    /// Reset CPU to initial state with loaded program.
    #[wasm_bindgen]
    pub fn reset(&mut self) {
        // Assembled programs always fit.
        let _ = self.cpu.load(&self.program);
        self.cpu.start();
    }

    /// Check if CPU is running.
    #[wasm_bindgen]
    pub fn is_running(&self) -> bool {
        self.cpu.is_running()
    }

    /// Check if CPU is halted or faulted.
    #[wasm_bindgen]
    pub fn is_halted(&self) -> bool {
        self.cpu.is_halted()
    }

    /// Get tick count.
    #[wasm_bindgen]
    pub fn cycles(&self) -> u64 {
        self.cpu.cycles
    }

    /// Get retired instruction count.
    #[wasm_bindgen]
    pub fn retired(&self) -> u64 {
        self.cpu.retired
    }

    /// Get program counter.
    #[wasm_bindgen]
    pub fn pc(&self) -> u16 {
        self.cpu.regs.pc
    }

    /// Get the stage the next tick will run.
    #[wasm_bindgen]
    pub fn stage(&self) -> String {
        self.cpu.pipeline.stage.to_string()
    }

    /// Get a register value (0-7).
    #[wasm_bindgen]
    pub fn register(&self, index: usize) -> u8 {
        if index < NUM_REGS {
            self.cpu.regs.gpr[index]
        } else {
            0
        }
    }

    /// Get all registers.
    #[wasm_bindgen]
    pub fn registers(&self) -> Uint8Array {
        Uint8Array::from(&self.cpu.regs.gpr[..])
    }

    /// Get state as string.
    #[wasm_bindgen]
    pub fn state(&self) -> String {
        format!("{:?}", self.cpu.state)
    }

    /// Get the fault message, if the CPU faulted.
    #[wasm_bindgen]
    pub fn fault(&self) -> Option<String> {
        self.cpu.fault.as_ref().map(|f| f.to_string())
    }

    /// Get memory cell value at address (0-255).
    #[wasm_bindgen]
    pub fn memory_at(&self, addr: u16) -> u8 {
        self.cpu.mem.read(addr).unwrap_or(0)
    }

    /// Get all memory.
    #[wasm_bindgen]
    pub fn memory_all(&self) -> Uint8Array {
        Uint8Array::from(self.cpu.mem.as_slice())
    }

    /// Get the full machine state as a JSON string.
    #[wasm_bindgen]
    pub fn state_json(&self) -> Result<String, JsError> {
        StateDump::capture(&self.cpu)
            .to_json()
            .map_err(|e| JsError::new(&format!("{}", e)))
    }
}

/// Ticks one bounded run made. A fault ends the run and its tick counts.
fn run_ticks(cpu: &mut Cpu, mode: ExecMode, max_ticks: u64) -> u64 {
    let before = cpu.cycles;
    // The fault stays readable through `fault()`.
    let _ = cpu.run_limited(mode, max_ticks);
    cpu.cycles - before
}

impl Default for WasmCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble source text and return the image size in bytes.
#[wasm_bindgen]
pub fn wasm_assemble(source: &str) -> Result<usize, JsError> {
    let program = assemble(source)
        .map_err(|e| JsError::new(&format!("{}", e)))?;
    Ok(program.image.len())
}

/// Disassemble the instruction at the start of `bytes`.
#[wasm_bindgen]
pub fn wasm_disassemble(bytes: &[u8]) -> String {
    let mut mem = Memory::new();
    let len = bytes.len().min(MEMORY_SIZE);
    // Fits by construction.
    let _ = mem.load_program(0, &bytes[..len]);
    disassemble_at(&mem, 0).0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(source: &str) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.load(&assemble(source).unwrap()).unwrap();
        cpu
    }

    #[test]
    fn test_run_ticks_counts_only_this_run() {
        let mut cpu = loaded("NOP\nNOP\nHALT");
        cpu.start();
        cpu.step().unwrap();

        assert_eq!(run_ticks(&mut cpu, ExecMode::Single, 100), 2);
        assert_eq!(cpu.cycles, 3);
    }

    #[test]
    fn test_run_ticks_includes_faulting_tick() {
        let mut cpu = loaded("NOP");
        cpu.mem.write(1, 8).unwrap();

        assert_eq!(run_ticks(&mut cpu, ExecMode::Multi, 100), 5 + 3);
        assert!(cpu.fault.is_some());
    }
}
