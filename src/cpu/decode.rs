//! Instruction set and decoder.
//!
//! Instructions are 1 to 3 bytes: an opcode byte followed by its operand
//! bytes. The first operand byte is always the destination and the second
//! always the source.
//!
//! ```text
//! byte  mnemonic  layout
//!  0    HALT      op
//!  1    NOP       op
//!  2    MOV_RR    op dst-reg src-reg
//!  3    MOV_RM    op dst-addr src-reg     [addr] <- reg
//!  4    MOV_MR    op dst-reg src-addr     reg <- [addr]
//!  5    ADD_RR    op dst-reg src-reg
//!  6    SUB_RR    op dst-reg src-reg
//!  7    JMP       op target
//! ```

use crate::cpu::memory::{Memory, MEMORY_SIZE};
use crate::cpu::registers::Reg;
use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;

/// Operation codes.
///
/// Any byte without a matching opcode decodes as [`Opcode::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Halt = 0,
    Nop = 1,
    MovRR = 2,
    MovRM = 3,
    MovMR = 4,
    AddRR = 5,
    SubRR = 6,
    Jmp = 7,
    Invalid = 8,
}

/// How an opcode's operand bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandShape {
    /// No operands.
    None,
    /// Destination register, source register.
    RegReg,
    /// Destination address, source register (store).
    RegToMem,
    /// Destination register, source address (load).
    MemToReg,
    /// A single address byte.
    Imm,
}

impl Opcode {
    /// Every opcode with a valid encoding.
    pub const ALL: [Opcode; 8] = [
        Opcode::Halt,
        Opcode::Nop,
        Opcode::MovRR,
        Opcode::MovRM,
        Opcode::MovMR,
        Opcode::AddRR,
        Opcode::SubRR,
        Opcode::Jmp,
    ];

    /// Interpret a raw opcode byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Opcode::Halt,
            1 => Opcode::Nop,
            2 => Opcode::MovRR,
            3 => Opcode::MovRM,
            4 => Opcode::MovMR,
            5 => Opcode::AddRR,
            6 => Opcode::SubRR,
            7 => Opcode::Jmp,
            _ => Opcode::Invalid,
        }
    }

    /// The encoding byte.
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Encoded length in bytes, including the opcode byte.
    pub const fn size(self) -> u16 {
        match self {
            Opcode::Halt | Opcode::Nop | Opcode::Invalid => 1,
            Opcode::MovRR | Opcode::AddRR | Opcode::SubRR => 3,
            Opcode::MovRM | Opcode::MovMR => 3,
            Opcode::Jmp => 2,
        }
    }

    /// Operand layout.
    pub const fn shape(self) -> OperandShape {
        match self {
            Opcode::Halt | Opcode::Nop | Opcode::Invalid => OperandShape::None,
            Opcode::MovRR | Opcode::AddRR | Opcode::SubRR => OperandShape::RegReg,
            Opcode::MovRM => OperandShape::RegToMem,
            Opcode::MovMR => OperandShape::MemToReg,
            Opcode::Jmp => OperandShape::Imm,
        }
    }

    /// Assembly mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Halt => "HALT",
            Opcode::Nop => "NOP",
            Opcode::MovRR => "MOV_RR",
            Opcode::MovRM => "MOV_RM",
            Opcode::MovMR => "MOV_MR",
            Opcode::AddRR => "ADD_RR",
            Opcode::SubRR => "SUB_RR",
            Opcode::Jmp => "JMP",
            Opcode::Invalid => "INVALID",
        }
    }

    /// Look up a mnemonic (case-insensitive). `INVALID` is not accepted.
    pub fn from_mnemonic(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(text))
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Instruction {
    /// Stop the machine.
    Halt,

    /// Do nothing.
    #[default]
    Nop,

    /// dst := src
    MovRR { dst: Reg, src: Reg },

    /// [addr] := src
    MovRM { addr: u8, src: Reg },

    /// dst := [addr]
    MovMR { dst: Reg, addr: u8 },

    /// dst := dst + src (mod 256)
    AddRR { dst: Reg, src: Reg },

    /// dst := dst - src (mod 256)
    SubRR { dst: Reg, src: Reg },

    /// PC := target
    Jmp { target: u8 },

    /// Unrecognised opcode byte. Executing it faults.
    Invalid { byte: u8 },
}

impl Instruction {
    /// The instruction for a freshly fetched opcode byte, with every operand
    /// field at its zero value.
    pub fn fetched(opcode_byte: u8) -> Self {
        let zero = Reg::default();
        match Opcode::from_byte(opcode_byte) {
            Opcode::Halt => Instruction::Halt,
            Opcode::Nop => Instruction::Nop,
            Opcode::MovRR => Instruction::MovRR { dst: zero, src: zero },
            Opcode::MovRM => Instruction::MovRM { addr: 0, src: zero },
            Opcode::MovMR => Instruction::MovMR { dst: zero, addr: 0 },
            Opcode::AddRR => Instruction::AddRR { dst: zero, src: zero },
            Opcode::SubRR => Instruction::SubRR { dst: zero, src: zero },
            Opcode::Jmp => Instruction::Jmp { target: 0 },
            Opcode::Invalid => Instruction::Invalid { byte: opcode_byte },
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Halt => Opcode::Halt,
            Instruction::Nop => Opcode::Nop,
            Instruction::MovRR { .. } => Opcode::MovRR,
            Instruction::MovRM { .. } => Opcode::MovRM,
            Instruction::MovMR { .. } => Opcode::MovMR,
            Instruction::AddRR { .. } => Opcode::AddRR,
            Instruction::SubRR { .. } => Opcode::SubRR,
            Instruction::Jmp { .. } => Opcode::Jmp,
            Instruction::Invalid { .. } => Opcode::Invalid,
        }
    }

    /// Encoded length in bytes.
    pub fn size(&self) -> u16 {
        self.opcode().size()
    }

    pub fn shape(&self) -> OperandShape {
        self.opcode().shape()
    }

    /// Whether this instruction sets the program counter itself.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Instruction::Jmp { .. })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.opcode().mnemonic();
        match self {
            Instruction::Halt | Instruction::Nop => f.write_str(name),
            Instruction::MovRR { dst, src }
            | Instruction::AddRR { dst, src }
            | Instruction::SubRR { dst, src } => write!(f, "{} {} {}", name, dst, src),
            Instruction::MovRM { addr, src } => write!(f, "{} {} {}", name, addr, src),
            Instruction::MovMR { dst, addr } => write!(f, "{} {} {}", name, dst, addr),
            Instruction::Jmp { target } => write!(f, "{} {}", name, target),
            Instruction::Invalid { byte } => write!(f, "{} {:#04x}", name, byte),
        }
    }
}

/// Decode the instruction starting at `pc`.
pub fn decode(mem: &Memory, pc: u16) -> Result<Instruction, DecodeError> {
    let opcode_byte = mem
        .read(pc)
        .map_err(|_| DecodeError::OutOfBounds { pc, len: 1 })?;
    decode_operands(mem, pc, opcode_byte)
}

/// Read the operand bytes for an opcode already fetched from `pc`.
///
/// Operand offsets are relative to `pc`, the address of the opcode byte.
pub fn decode_operands(mem: &Memory, pc: u16, opcode_byte: u8) -> Result<Instruction, DecodeError> {
    let opcode = Opcode::from_byte(opcode_byte);
    let len = opcode.size();
    if pc as usize + len as usize > MEMORY_SIZE {
        return Err(DecodeError::OutOfBounds { pc, len });
    }

    let byte = |offset: u16| {
        mem.read(pc + offset)
            .map_err(|_| DecodeError::OutOfBounds { pc, len })
    };
    let reg = |offset: u16| {
        let index = byte(offset)?;
        Reg::new(index).ok_or(DecodeError::InvalidRegister { pc, index })
    };

    let instr = match opcode {
        Opcode::Halt => Instruction::Halt,
        Opcode::Nop => Instruction::Nop,
        Opcode::MovRR => Instruction::MovRR { dst: reg(1)?, src: reg(2)? },
        Opcode::MovRM => Instruction::MovRM { addr: byte(1)?, src: reg(2)? },
        Opcode::MovMR => Instruction::MovMR { dst: reg(1)?, addr: byte(2)? },
        Opcode::AddRR => Instruction::AddRR { dst: reg(1)?, src: reg(2)? },
        Opcode::SubRR => Instruction::SubRR { dst: reg(1)?, src: reg(2)? },
        Opcode::Jmp => Instruction::Jmp { target: byte(1)? },
        Opcode::Invalid => Instruction::Invalid { byte: opcode_byte },
    };

    Ok(instr)
}

/// Encode an instruction to its byte form.
pub fn encode(instr: &Instruction) -> Vec<u8> {
    let op = instr.opcode().byte();
    match *instr {
        Instruction::Halt | Instruction::Nop => vec![op],
        Instruction::MovRR { dst, src }
        | Instruction::AddRR { dst, src }
        | Instruction::SubRR { dst, src } => vec![op, dst.byte(), src.byte()],
        Instruction::MovRM { addr, src } => vec![op, addr, src.byte()],
        Instruction::MovMR { dst, addr } => vec![op, dst.byte(), addr],
        Instruction::Jmp { target } => vec![op, target],
        Instruction::Invalid { byte } => vec![byte],
    }
}

/// Errors from reading an instruction out of memory.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("instruction at {pc} ({len} bytes) runs past the end of memory")]
    OutOfBounds { pc: u16, len: u16 },

    #[error("invalid register index {index} in instruction at {pc}")]
    InvalidRegister { pc: u16, index: u8 },
}
