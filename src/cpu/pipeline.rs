//! Multi-cycle engine.
//!
//! Each call to [`Cpu::step_stage`] runs exactly one of five stages and then
//! moves the latch to the next one:
//!
//! ```text
//! Fetch -> Decode -> Execute -> Memory -> Writeback -> Fetch ...
//! ```
//!
//! The stage, the in-flight instruction and the ALU scratch value live in
//! [`Pipeline`] on the CPU, so a program can be stopped between any two
//! stages and inspected. Only one instruction is ever in flight: there is no
//! overlap, forwarding or hazard detection.
//!
//! Halting is reported through [`CpuState`], never by the stage. HALT stops
//! the machine in Execute, so its Memory and Writeback never run and PC is
//! left pointing at the HALT.

use crate::cpu::decode::{self, Instruction};
use crate::cpu::execute::{alu_add, alu_sub, Cpu, CpuError, CpuState, Fault};
use crate::cpu::Memory;
use serde::{Serialize, Deserialize};
use std::fmt;
use tracing::trace;

/// One phase of instruction processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Stage {
    #[default]
    Fetch,
    Decode,
    Execute,
    Memory,
    Writeback,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Decode,
        Stage::Execute,
        Stage::Memory,
        Stage::Writeback,
    ];

    /// The stage that follows this one. Writeback wraps to Fetch.
    pub const fn next(self) -> Stage {
        match self {
            Stage::Fetch => Stage::Decode,
            Stage::Decode => Stage::Execute,
            Stage::Execute => Stage::Memory,
            Stage::Memory => Stage::Writeback,
            Stage::Writeback => Stage::Fetch,
        }
    }

    /// Short name as used in pipeline diagrams.
    pub const fn short_name(self) -> &'static str {
        match self {
            Stage::Fetch => "IF",
            Stage::Decode => "ID",
            Stage::Execute => "EX",
            Stage::Memory => "MEM",
            Stage::Writeback => "WB",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// State carried between stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// The stage the next call will run.
    pub stage: Stage,
    /// The in-flight instruction. After Fetch only the opcode is known and
    /// operand fields are zero; Decode fills them in.
    pub instr: Instruction,
    /// ALU scratch: produced in Execute or Memory, consumed in Writeback.
    pub alu: u16,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to Fetch with an empty latch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Cpu {
    /// Advance the multi-cycle engine by one stage.
    ///
    /// Returns the stage that ran. On a fault the CPU moves to `Faulted` and
    /// the latch stays on the stage that faulted.
    pub fn step_stage(&mut self) -> Result<Stage, CpuError> {
        self.ensure_running()?;

        let stage = self.pipeline.stage;
        trace!(stage = stage.short_name(), pc = self.regs.pc, "stage");

        match stage {
            Stage::Fetch => self.stage_fetch()?,
            Stage::Decode => self.stage_decode()?,
            Stage::Execute => self.stage_execute()?,
            Stage::Memory => self.stage_memory()?,
            Stage::Writeback => self.stage_writeback()?,
        }

        self.pipeline.stage = stage.next();
        self.cycles += 1;
        Ok(stage)
    }

    /// Run stages until the current instruction finishes (the latch is back
    /// at Fetch) or the CPU stops.
    pub fn finish_instruction(&mut self) -> Result<u32, CpuError> {
        let mut stages = 0;
        loop {
            self.step_stage()?;
            stages += 1;
            if self.pipeline.stage == Stage::Fetch || !self.is_running() {
                return Ok(stages);
            }
        }
    }

    /// IF: bounds-check PC and latch the opcode byte.
    fn stage_fetch(&mut self) -> Result<(), CpuError> {
        let pc = self.regs.pc;
        let opcode_byte = self.mem
            .read(pc)
            .map_err(|_| self.fault(Fault::PcOutOfRange { pc }))?;

        self.pipeline.instr = Instruction::fetched(opcode_byte);
        Ok(())
    }

    /// ID: read operands relative to the unmodified PC.
    fn stage_decode(&mut self) -> Result<(), CpuError> {
        let pc = self.regs.pc;
        let opcode_byte = match self.pipeline.instr {
            Instruction::Invalid { byte } => byte,
            instr => instr.opcode().byte(),
        };

        self.pipeline.instr = decode::decode_operands(&self.mem, pc, opcode_byte)
            .map_err(|e| self.fault(Fault::Decode(e)))?;
        Ok(())
    }

    /// EX: compute into the ALU scratch without touching registers or memory.
    fn stage_execute(&mut self) -> Result<(), CpuError> {
        let pc = self.regs.pc;
        self.pipeline.alu = 0;

        match self.pipeline.instr {
            Instruction::Halt => {
                self.state = CpuState::Halted;
                self.retire(pc, Instruction::Halt);
            }
            Instruction::Nop => {}
            Instruction::MovRR { src, .. } => {
                self.pipeline.alu = self.regs.get(src) as u16;
            }
            Instruction::AddRR { dst, src } => {
                self.pipeline.alu = alu_add(self.regs.get(dst), self.regs.get(src));
            }
            Instruction::SubRR { dst, src } => {
                self.pipeline.alu = alu_sub(self.regs.get(dst), self.regs.get(src));
            }
            // Memory access happens in MEM
            Instruction::MovRM { .. } | Instruction::MovMR { .. } => {}
            Instruction::Jmp { target } => {
                self.pipeline.alu = target as u16;
            }
            Instruction::Invalid { byte } => {
                return Err(self.fault(Fault::InvalidOpcode { pc, byte }));
            }
        }

        Ok(())
    }

    /// MEM: the load or store for MOV_MR / MOV_RM; nothing for anything else.
    fn stage_memory(&mut self) -> Result<(), CpuError> {
        let pc = self.regs.pc;

        match self.pipeline.instr {
            Instruction::MovRM { addr, src } => {
                let value = self.regs.get(src);
                self.mem
                    .write(addr as u16, value)
                    .map_err(|_| self.fault(Fault::AddressOutOfRange { pc, addr: addr as u16 }))?;
            }
            Instruction::MovMR { addr, .. } => {
                let value = self.mem
                    .read(addr as u16)
                    .map_err(|_| self.fault(Fault::AddressOutOfRange { pc, addr: addr as u16 }))?;
                self.pipeline.alu = value as u16;
            }
            _ => {}
        }

        Ok(())
    }

    /// WB: commit the result and move PC on.
    fn stage_writeback(&mut self) -> Result<(), CpuError> {
        let pc = self.regs.pc;
        let instr = self.pipeline.instr;
        let result = self.pipeline.alu;

        match instr {
            Instruction::MovRR { dst, .. }
            | Instruction::AddRR { dst, .. }
            | Instruction::SubRR { dst, .. }
            | Instruction::MovMR { dst, .. } => {
                self.regs.set(dst, result as u8);
            }
            Instruction::Jmp { .. } => {
                if !Memory::contains(result) {
                    return Err(self.fault(Fault::JumpOutOfRange { pc, target: result }));
                }
                // PC already holds the target; no length increment.
                self.regs.jump(result);
                self.retire(pc, instr);
                return Ok(());
            }
            _ => {}
        }

        self.regs.advance_pc(instr.size());
        self.retire(pc, instr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::DecodeError;
    use crate::cpu::execute::ExecMode;
    use crate::cpu::MEMORY_SIZE;
    use proptest::prelude::*;

    fn cpu_with(bytes: &[u8], regs: [u8; 8]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.mem.load_program(0, bytes).unwrap();
        cpu.regs.gpr = regs;
        cpu.start();
        cpu
    }

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Fetch;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(stage);
            stage = stage.next();
        }
        assert_eq!(
            seen,
            vec![
                Stage::Fetch,
                Stage::Decode,
                Stage::Execute,
                Stage::Memory,
                Stage::Writeback,
                Stage::Fetch
            ]
        );
    }

    #[test]
    fn test_requires_running() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.step_stage(), Err(CpuError::NotRunning(CpuState::Ready)));
        assert_eq!(cpu.pipeline.stage, Stage::Fetch);
    }

    #[test]
    fn test_five_stages_per_instruction() {
        let mut cpu = cpu_with(&[5, 0, 1, 0], [250, 10, 0, 0, 0, 0, 0, 0]);

        for expected in Stage::ALL {
            assert_eq!(cpu.step_stage().unwrap(), expected);
        }

        assert_eq!(cpu.pipeline.stage, Stage::Fetch);
        assert_eq!(cpu.regs.gpr[0], 4);
        assert_eq!(cpu.regs.pc, 3);
        assert_eq!(cpu.cycles, 5);
        assert_eq!(cpu.retired, 1);
    }

    #[test]
    fn test_partial_state_between_stages() {
        let mut cpu = cpu_with(&[6, 2, 3], [0, 0, 5, 10, 0, 0, 0, 0]);

        cpu.step_stage().unwrap();
        assert_eq!(cpu.pipeline.instr, Instruction::fetched(6));

        cpu.step_stage().unwrap();
        assert_eq!(cpu.pipeline.instr.to_string(), "SUB_RR R2 R3");

        cpu.step_stage().unwrap();
        assert_eq!(cpu.pipeline.alu, 251);
        // Execute does not commit
        assert_eq!(cpu.regs.gpr[2], 5);

        cpu.step_stage().unwrap();
        assert_eq!(cpu.regs.gpr[2], 5);
        assert_eq!(cpu.regs.pc, 0);

        cpu.step_stage().unwrap();
        assert_eq!(cpu.regs.gpr[2], 251);
        assert_eq!(cpu.regs.pc, 3);
    }

    #[test]
    fn test_load_reads_memory_in_mem_stage() {
        let mut cpu = cpu_with(&[4, 1, 200], [0; 8]);
        cpu.mem.write(200, 77).unwrap();

        cpu.step_stage().unwrap();
        cpu.step_stage().unwrap();
        cpu.step_stage().unwrap();
        assert_eq!(cpu.pipeline.alu, 0);

        assert_eq!(cpu.step_stage().unwrap(), Stage::Memory);
        assert_eq!(cpu.pipeline.alu, 77);
        assert_eq!(cpu.regs.gpr[1], 0);

        cpu.step_stage().unwrap();
        assert_eq!(cpu.regs.gpr[1], 77);
    }

    #[test]
    fn test_store_writes_memory_in_mem_stage() {
        let mut cpu = cpu_with(&[3, 64, 2], [0, 0, 9, 0, 0, 0, 0, 0]);

        cpu.step_stage().unwrap();
        cpu.step_stage().unwrap();
        cpu.step_stage().unwrap();
        assert_eq!(cpu.mem.read(64).unwrap(), 0);

        cpu.step_stage().unwrap();
        assert_eq!(cpu.mem.read(64).unwrap(), 9);
    }

    #[test]
    fn test_jump_writeback_skips_length_increment() {
        let mut cpu = cpu_with(&[7, 5, 0, 0, 0, 0], [0; 8]);

        assert_eq!(cpu.finish_instruction().unwrap(), 5);

        assert_eq!(cpu.regs.pc, 5);
        assert!(cpu.is_running());
    }

    #[test]
    fn test_halt_stops_in_execute() {
        let mut cpu = cpu_with(&[2, 0, 1, 0], [0, 5, 0, 0, 0, 0, 0, 0]);

        let ticks = cpu.run(ExecMode::Multi).unwrap();

        assert_eq!(ticks, 8);
        assert_eq!(cpu.regs.gpr[0], 5);
        assert_eq!(cpu.regs.pc, 3);
        assert_eq!(cpu.state, CpuState::Halted);
        assert_eq!(cpu.pipeline.stage, Stage::Memory);
        assert_eq!(cpu.step_stage(), Err(CpuError::NotRunning(CpuState::Halted)));
    }

    #[test]
    fn test_invalid_opcode_faults_in_execute() {
        let mut cpu = cpu_with(&[8], [3; 8]);

        cpu.step_stage().unwrap();
        cpu.step_stage().unwrap();
        assert_eq!(cpu.pipeline.instr, Instruction::Invalid { byte: 8 });
        assert!(cpu.is_running());

        let err = cpu.step_stage().unwrap_err();
        assert_eq!(err, CpuError::Fault(Fault::InvalidOpcode { pc: 0, byte: 8 }));
        assert_eq!(cpu.pipeline.stage, Stage::Execute);
        assert_eq!(cpu.regs.gpr, [3; 8]);
        assert_eq!(cpu.regs.pc, 0);
    }

    #[test]
    fn test_fetch_faults_on_pc_out_of_range() {
        let mut cpu = cpu_with(&[], [0; 8]);
        cpu.regs.pc = MEMORY_SIZE as u16 + 4;

        let err = cpu.step_stage().unwrap_err();

        assert_eq!(err, CpuError::Fault(Fault::PcOutOfRange { pc: 260 }));
        assert_eq!(cpu.state, CpuState::Faulted);
    }

    #[test]
    fn test_decode_faults_on_truncated_instruction() {
        let mut cpu = cpu_with(&[], [0; 8]);
        cpu.mem.write(254, 2).unwrap();
        cpu.regs.pc = 254;

        cpu.step_stage().unwrap();
        let err = cpu.step_stage().unwrap_err();

        assert_eq!(
            err,
            CpuError::Fault(Fault::Decode(DecodeError::OutOfBounds { pc: 254, len: 3 }))
        );
    }

    #[test]
    fn test_jump_out_of_range_leaves_pc() {
        let mut cpu = cpu_with(&[1, 7, 9], [0; 8]);
        cpu.finish_instruction().unwrap();
        assert_eq!(cpu.regs.pc, 1);

        for _ in 0..4 {
            cpu.step_stage().unwrap();
        }
        // Force an unreachable target into the scratch before Writeback.
        cpu.pipeline.alu = MEMORY_SIZE as u16;

        let err = cpu.step_stage().unwrap_err();
        assert_eq!(err, CpuError::Fault(Fault::JumpOutOfRange { pc: 1, target: 256 }));
        assert_eq!(cpu.regs.pc, 1);
    }

    /// Run one instruction through each engine from the same start and
    /// return both CPUs.
    fn run_both(mem: &[u8], regs: [u8; 8], pc: u16) -> (Cpu, Cpu) {
        let mut single = cpu_with(mem, regs);
        single.regs.pc = pc;
        let mut multi = single.clone();

        let _ = single.step();
        for _ in 0..5 {
            let _ = multi.step_stage();
        }
        (single, multi)
    }

    #[test]
    fn test_engines_agree_on_every_opcode() {
        let regs = [200, 100, 3, 4, 5, 6, 7, 8];
        let programs: [&[u8]; 9] = [
            &[0],
            &[1],
            &[2, 3, 1],
            &[3, 50, 0],
            &[4, 6, 2],
            &[5, 0, 1],
            &[6, 1, 0],
            &[7, 40],
            &[8],
        ];

        for program in programs {
            let (single, multi) = run_both(program, regs, 0);
            assert_eq!(single.regs, multi.regs, "program {:?}", program);
            assert_eq!(single.mem, multi.mem, "program {:?}", program);
            assert_eq!(single.state, multi.state, "program {:?}", program);
            assert_eq!(single.fault, multi.fault, "program {:?}", program);
        }
    }

    proptest! {
        #[test]
        fn engines_agree_on_arbitrary_state(
            mem in proptest::collection::vec(0u8..=10, MEMORY_SIZE),
            regs in any::<[u8; 8]>(),
            pc in 0u16..=258,
        ) {
            let (single, multi) = run_both(&mem, regs, pc);
            prop_assert_eq!(single.regs, multi.regs);
            prop_assert_eq!(single.mem, multi.mem);
            prop_assert_eq!(single.state, multi.state);
            prop_assert_eq!(single.fault, multi.fault);
        }

        #[test]
        fn add_and_sub_wrap_modulo_256(a in any::<u8>(), b in any::<u8>()) {
            let (add, _) = run_both(&[5, 0, 1], [a, b, 0, 0, 0, 0, 0, 0], 0);
            prop_assert_eq!(add.regs.gpr[0], a.wrapping_add(b));

            let (_, sub) = run_both(&[6, 0, 1], [a, b, 0, 0, 0, 0, 0, 0], 0);
            prop_assert_eq!(sub.regs.gpr[0], a.wrapping_sub(b));
        }

        #[test]
        fn non_jump_advances_pc_by_length(op in 1u8..=6, a in 0u8..8, b in 0u8..8) {
            let (_, multi) = run_both(&[op, a, b], [0; 8], 0);
            prop_assert_eq!(multi.regs.pc, crate::cpu::decode::Opcode::from_byte(op).size());
        }
    }
}
