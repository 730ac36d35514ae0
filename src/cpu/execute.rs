//! CPU state and the single-cycle engine.
//!
//! [`Cpu::step`] fetches, decodes and executes one whole instruction per
//! call. The multi-cycle engine in [`crate::cpu::pipeline`] drives the same
//! state through five stages instead; both share the ALU helpers and fault
//! handling defined here.

use crate::cpu::{Memory, Registers};
use crate::cpu::decode::{self, DecodeError, Instruction};
use crate::cpu::memory::MemoryError;
use crate::cpu::pipeline::Pipeline;
use crate::asm::Program;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, warn};

/// CPU execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    /// Created or loaded, not started yet.
    Ready,
    /// CPU is running normally.
    Running,
    /// CPU has halted (executed HALT).
    Halted,
    /// CPU stopped on a fault.
    Faulted,
}

/// Which engine drives the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// One instruction per tick.
    #[serde(alias = "single-cycle")]
    Single,
    /// One pipeline stage per tick.
    #[default]
    #[serde(alias = "multi-cycle")]
    Multi,
}

/// The CPU: registers, memory, run state and the multi-cycle latch.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// CPU registers.
    pub regs: Registers,
    /// Main memory.
    pub mem: Memory,
    /// Current execution state.
    pub state: CpuState,
    /// Multi-cycle stage, in-flight instruction and ALU scratch.
    pub pipeline: Pipeline,
    /// Engine ticks run, including one that faulted.
    pub cycles: u64,
    /// Completed instructions.
    pub retired: u64,
    /// The fault that stopped the CPU, if any.
    pub fault: Option<Fault>,
    /// Last completed instruction (for debugging).
    last_instr: Option<Instruction>,
}

impl Cpu {
    /// Create a new CPU with zeroed state.
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            mem: Memory::new(),
            state: CpuState::Ready,
            pipeline: Pipeline::new(),
            cycles: 0,
            retired: 0,
            fault: None,
            last_instr: None,
        }
    }

    /// Reset the CPU to initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Install a loaded program on a fresh machine: zeroed memory with the
    /// image at address 0, initial register values, PC = 0, state `Ready`.
    pub fn load(&mut self, program: &Program) -> Result<(), MemoryError> {
        self.reset();
        self.mem.load_program(0, &program.image)?;
        self.regs.gpr = program.registers;
        self.regs.pc = 0;
        Ok(())
    }

    /// Switch to `Running` with the pipeline at Fetch.
    pub fn start(&mut self) {
        self.pipeline.reset();
        self.fault = None;
        self.state = CpuState::Running;
    }

    /// Execute a single instruction.
    ///
    /// Returns the instruction that was executed, or an error. A fault
    /// also leaves the CPU in `Faulted`.
    pub fn step(&mut self) -> Result<Instruction, CpuError> {
        self.ensure_running()?;

        let pc = self.regs.pc;
        if !Memory::contains(pc) {
            return Err(self.fault(Fault::PcOutOfRange { pc }));
        }

        let instr = decode::decode(&self.mem, pc)
            .map_err(|e| self.fault(Fault::Decode(e)))?;

        self.execute(instr)?;

        self.cycles += 1;
        self.retire(pc, instr);

        Ok(instr)
    }

    /// Apply an instruction's full effect, including the PC update.
    fn execute(&mut self, instr: Instruction) -> Result<(), CpuError> {
        let pc = self.regs.pc;

        match instr {
            Instruction::Halt => {
                self.state = CpuState::Halted;
                return Ok(());
            }

            Instruction::Nop => {}

            Instruction::MovRR { dst, src } => {
                let value = self.regs.get(src);
                self.regs.set(dst, value);
            }

            Instruction::AddRR { dst, src } => {
                let sum = alu_add(self.regs.get(dst), self.regs.get(src));
                self.regs.set(dst, sum as u8);
            }

            Instruction::SubRR { dst, src } => {
                let diff = alu_sub(self.regs.get(dst), self.regs.get(src));
                self.regs.set(dst, diff as u8);
            }

            Instruction::MovRM { addr, src } => {
                let value = self.regs.get(src);
                self.mem
                    .write(addr as u16, value)
                    .map_err(|_| self.fault(Fault::AddressOutOfRange { pc, addr: addr as u16 }))?;
            }

            Instruction::MovMR { dst, addr } => {
                let value = self.mem
                    .read(addr as u16)
                    .map_err(|_| self.fault(Fault::AddressOutOfRange { pc, addr: addr as u16 }))?;
                self.regs.set(dst, value);
            }

            Instruction::Jmp { target } => {
                let target = target as u16;
                if !Memory::contains(target) {
                    return Err(self.fault(Fault::JumpOutOfRange { pc, target }));
                }
                self.regs.jump(target);
                return Ok(());
            }

            Instruction::Invalid { byte } => {
                return Err(self.fault(Fault::InvalidOpcode { pc, byte }));
            }
        }

        self.regs.advance_pc(instr.size());
        Ok(())
    }

    /// Advance one tick of the given engine.
    pub fn tick(&mut self, mode: ExecMode) -> Result<(), CpuError> {
        match mode {
            ExecMode::Single => self.step().map(|_| ()),
            ExecMode::Multi => self.step_stage().map(|_| ()),
        }
    }

    /// Start the CPU and run until halt or fault.
    ///
    /// Returns the number of ticks executed.
    pub fn run(&mut self, mode: ExecMode) -> Result<u64, CpuError> {
        self.run_limited(mode, u64::MAX)
    }

    /// Start the CPU and run for at most `max_ticks` ticks.
    pub fn run_limited(&mut self, mode: ExecMode, max_ticks: u64) -> Result<u64, CpuError> {
        if self.state == CpuState::Ready {
            self.start();
        }

        let mut ticks = 0;
        while self.state == CpuState::Running && ticks < max_ticks {
            self.tick(mode)?;
            ticks += 1;
        }

        Ok(ticks)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), CpuError> {
        if self.state != CpuState::Running {
            return Err(CpuError::NotRunning(self.state));
        }
        Ok(())
    }

    /// Stop the CPU on a fault and report it. The faulting tick counts.
    pub(crate) fn fault(&mut self, fault: Fault) -> CpuError {
        warn!(%fault, "cpu fault");
        self.cycles += 1;
        self.state = CpuState::Faulted;
        self.fault = Some(fault.clone());
        CpuError::Fault(fault)
    }

    pub(crate) fn retire(&mut self, pc: u16, instr: Instruction) {
        debug!(pc, %instr, next_pc = self.regs.pc, "retired");
        self.retired += 1;
        self.last_instr = Some(instr);
    }

    /// Get the last completed instruction.
    pub fn last_instruction(&self) -> Option<Instruction> {
        self.last_instr
    }

    /// Check if the CPU is halted (by HALT or a fault).
    pub fn is_halted(&self) -> bool {
        matches!(self.state, CpuState::Halted | CpuState::Faulted)
    }

    /// Check if the CPU is running.
    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .field("regs", &self.regs)
            .field("stage", &self.pipeline.stage)
            .finish()
    }
}

/// 8-bit add through a 16-bit intermediate. The result is already reduced
/// modulo 256.
pub(crate) fn alu_add(a: u8, b: u8) -> u16 {
    (a as u16 + b as u16) & 0xFF
}

/// 8-bit subtract; the low byte of the two's-complement difference.
pub(crate) fn alu_sub(a: u8, b: u8) -> u16 {
    (a as u16).wrapping_sub(b as u16) & 0xFF
}

/// Conditions that stop the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("PC {pc} out of memory range")]
    PcOutOfRange { pc: u16 },

    #[error("address {addr} out of memory range (instruction at {pc})")]
    AddressOutOfRange { pc: u16, addr: u16 },

    #[error("jump target {target} out of memory range (instruction at {pc})")]
    JumpOutOfRange { pc: u16, target: u16 },

    #[error("invalid opcode {byte:#04x} at PC={pc}")]
    InvalidOpcode { pc: u16, byte: u8 },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors that can occur during CPU execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("CPU not running: {0:?}")]
    NotRunning(CpuState),

    #[error("{0}")]
    Fault(#[from] Fault),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::registers::Reg;
    use crate::cpu::MEMORY_SIZE;

    fn r(i: u8) -> Reg {
        Reg::new(i).unwrap()
    }

    fn cpu_with(bytes: &[u8], regs: [u8; 8]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.mem.load_program(0, bytes).unwrap();
        cpu.regs.gpr = regs;
        cpu.start();
        cpu
    }

    #[test]
    fn test_new_cpu_is_ready() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.state, CpuState::Ready);
        assert_eq!(cpu.step(), Err(CpuError::NotRunning(CpuState::Ready)));
    }

    #[test]
    fn test_cpu_halt() {
        let mut cpu = cpu_with(&[0], [0; 8]);

        let executed = cpu.run(ExecMode::Single).unwrap();

        assert_eq!(executed, 1);
        assert!(cpu.is_halted());
        assert_eq!(cpu.state, CpuState::Halted);
        assert_eq!(cpu.regs.pc, 0);
    }

    #[test]
    fn test_cpu_nop_then_halt() {
        let mut cpu = cpu_with(&[1, 1, 1, 0], [0; 8]);

        let executed = cpu.run(ExecMode::Single).unwrap();

        assert_eq!(executed, 4);
        assert_eq!(cpu.retired, 4);
        assert_eq!(cpu.regs.pc, 3);
    }

    #[test]
    fn test_mov_then_halt_scenario() {
        let mut cpu = cpu_with(&[2, 0, 1, 0], [0, 5, 0, 0, 0, 0, 0, 0]);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.gpr[0], 5);
        assert_eq!(cpu.regs.pc, 3);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.pc, 3);
        assert_eq!(cpu.state, CpuState::Halted);
    }

    #[test]
    fn test_add_wraps() {
        let mut cpu = cpu_with(&[5, 0, 1], [250, 10, 0, 0, 0, 0, 0, 0]);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.gpr[0], 4);
        assert_eq!(cpu.regs.pc, 3);
    }

    #[test]
    fn test_sub_wraps() {
        let mut cpu = cpu_with(&[6, 0, 1], [5, 10, 0, 0, 0, 0, 0, 0]);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.gpr[0], 251);
    }

    #[test]
    fn test_store_and_load() {
        let mut cpu = cpu_with(&[3, 100, 2, 4, 7, 100, 0], [0, 0, 42, 0, 0, 0, 0, 0]);

        cpu.run(ExecMode::Single).unwrap();

        assert_eq!(cpu.mem.read(100).unwrap(), 42);
        assert_eq!(cpu.regs.gpr[7], 42);
        assert_eq!(cpu.regs.pc, 6);
    }

    #[test]
    fn test_jump_sets_pc_exactly() {
        let mut cpu = cpu_with(&[7, 5, 0, 0, 0, 0], [0; 8]);
        let instr = cpu.step().unwrap();
        assert_eq!(instr, Instruction::Jmp { target: 5 });
        assert_eq!(cpu.regs.pc, 5);
    }

    #[test]
    fn test_invalid_opcode_faults() {
        let mut cpu = cpu_with(&[8], [1, 2, 3, 4, 5, 6, 7, 8]);
        let before = cpu.mem.clone();

        let err = cpu.step().unwrap_err();

        assert_eq!(err, CpuError::Fault(Fault::InvalidOpcode { pc: 0, byte: 8 }));
        assert_eq!(cpu.state, CpuState::Faulted);
        assert_eq!(cpu.regs.gpr, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(cpu.mem, before);
        assert_eq!(cpu.step(), Err(CpuError::NotRunning(CpuState::Faulted)));
    }

    #[test]
    fn test_pc_out_of_range_faults() {
        let mut cpu = cpu_with(&[], [0; 8]);
        cpu.regs.pc = MEMORY_SIZE as u16;

        let err = cpu.step().unwrap_err();
        assert_eq!(err, CpuError::Fault(Fault::PcOutOfRange { pc: 256 }));
        assert_eq!(cpu.fault, Some(Fault::PcOutOfRange { pc: 256 }));
    }

    #[test]
    fn test_running_off_the_end_faults() {
        let mut cpu = Cpu::new();
        cpu.mem.load_program(0, &vec![1u8; MEMORY_SIZE]).unwrap();

        let err = cpu.run(ExecMode::Single).unwrap_err();

        assert_eq!(err, CpuError::Fault(Fault::PcOutOfRange { pc: 256 }));
        assert_eq!(cpu.retired, 256);
    }

    #[test]
    fn test_bad_register_faults_before_execution() {
        let mut cpu = cpu_with(&[2, 9, 0], [7; 8]);

        let err = cpu.step().unwrap_err();

        assert_eq!(
            err,
            CpuError::Fault(Fault::Decode(DecodeError::InvalidRegister { pc: 0, index: 9 }))
        );
        assert_eq!(cpu.regs.pc, 0);
        assert_eq!(cpu.regs.gpr, [7; 8]);
    }

    #[test]
    fn test_run_limited_stops_infinite_loop() {
        let mut cpu = Cpu::new();
        cpu.mem.load_program(0, &[7, 0]).unwrap();

        let ticks = cpu.run_limited(ExecMode::Single, 50).unwrap();

        assert_eq!(ticks, 50);
        assert!(cpu.is_running());
        assert_eq!(cpu.last_instruction(), Some(Instruction::Jmp { target: 0 }));
    }

    #[test]
    fn test_load_program() {
        let program = Program {
            image: vec![5, 0, 1, 0],
            registers: [1, 2, 0, 0, 0, 0, 0, 0],
            ..Program::default()
        };
        let mut cpu = Cpu::new();
        cpu.regs.pc = 9;
        cpu.load(&program).unwrap();

        assert_eq!(cpu.regs.pc, 0);
        cpu.run(ExecMode::Single).unwrap();
        assert_eq!(cpu.regs.get(r(0)), 3);
    }

    #[test]
    fn test_reload_after_halt() {
        let first = Program {
            image: vec![2, 0, 1, 1, 0],
            registers: [0, 5, 0, 0, 0, 0, 0, 0],
            ..Program::default()
        };
        let second = Program {
            image: vec![0],
            registers: [0, 0, 7, 0, 0, 0, 0, 0],
            ..Program::default()
        };

        let mut cpu = Cpu::new();
        cpu.load(&first).unwrap();
        cpu.run(ExecMode::Multi).unwrap();
        assert_eq!(cpu.state, CpuState::Halted);
        assert_eq!(cpu.pipeline.stage, crate::cpu::Stage::Memory);

        cpu.load(&second).unwrap();
        assert_eq!(cpu.state, CpuState::Ready);
        assert_eq!(cpu.pipeline.stage, crate::cpu::Stage::Fetch);
        assert_eq!((cpu.cycles, cpu.retired), (0, 0));
        assert_eq!(cpu.last_instruction(), None);
        assert_eq!(&cpu.mem.as_slice()[..5], &[0, 0, 0, 0, 0]);
        assert_eq!(cpu.regs.gpr, [0, 0, 7, 0, 0, 0, 0, 0]);

        let ticks = cpu.run(ExecMode::Multi).unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(cpu.state, CpuState::Halted);
        assert_eq!(cpu.retired, 1);
        assert_eq!(cpu.regs.pc, 0);
    }

    #[test]
    fn test_reload_after_fault() {
        let mut cpu = Cpu::new();
        cpu.load(&Program { image: vec![8], ..Program::default() }).unwrap();
        assert!(cpu.run(ExecMode::Single).is_err());
        assert!(cpu.fault.is_some());

        assert_eq!(cpu.cycles, 1);

        cpu.load(&Program { image: vec![1, 0], ..Program::default() }).unwrap();
        assert_eq!(cpu.fault, None);
        assert_eq!(cpu.run(ExecMode::Single).unwrap(), 2);
        assert_eq!(cpu.state, CpuState::Halted);
    }

    #[test]
    fn test_faulting_tick_is_counted() {
        // NOP, NOP, invalid: three ticks on the single-cycle engine.
        let mut single = Cpu::new();
        single.load(&Program { image: vec![1, 1, 8], ..Program::default() }).unwrap();
        assert!(single.run(ExecMode::Single).is_err());
        assert_eq!(single.cycles, 3);
        assert_eq!(single.retired, 2);

        // Two five-stage NOPs, then IF, ID and the faulting EX.
        let mut multi = Cpu::new();
        multi.load(&Program { image: vec![1, 1, 8], ..Program::default() }).unwrap();
        assert!(multi.run(ExecMode::Multi).is_err());
        assert_eq!(multi.cycles, 2 * 5 + 3);
        assert_eq!(multi.pipeline.stage, crate::cpu::Stage::Execute);
    }
}
