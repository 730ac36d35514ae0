//! Program loader: text source to a memory image.
//!
//! Syntax:
//! ```text
//! # Comment line
//! R1 5            ; register initializer: R<0-7> <value>
//! R2 0x10
//! MOV_RR R0 R1    ; R0 <- R1
//! MOV_RM 100 R0   ; [100] <- R0
//! MOV_MR R3 100   ; R3 <- [100]
//! ADD_RR 0, 2     ; commas and the R prefix are optional
//! JMP 12
//! HALT
//! ```
//!
//! Instructions are encoded back to back from address 0. Lines that cannot
//! be understood are skipped and reported as [`Diagnostic`]s; only I/O
//! failures and programs larger than memory abort loading.

use crate::cpu::decode::{encode, Instruction, Opcode, OperandShape};
use crate::cpu::memory::MEMORY_SIZE;
use crate::cpu::registers::{Reg, NUM_REGS};
use serde::{Serialize, Deserialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// A loaded program, ready for [`crate::Cpu::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Encoded bytes, starting at address 0.
    pub image: Vec<u8>,
    /// Initial register values.
    pub registers: [u8; NUM_REGS],
    /// Address and source line of every emitted instruction.
    pub listing: Vec<ListingEntry>,
    /// Problems found while loading. The offending lines were skipped.
    pub diagnostics: Vec<Diagnostic>,
}

/// One emitted instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub addr: u16,
    pub line: usize,
    pub instr: Instruction,
}

/// Load a program file.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Program, LoaderError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| LoaderError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let program = assemble(&source)?;
    debug!(path = %path.display(), bytes = program.image.len(), "program loaded");
    Ok(program)
}

/// Assemble program text.
pub fn assemble(source: &str) -> Result<Program, LoaderError> {
    let mut loader = Loader::default();

    for (line_num, line) in source.lines().enumerate() {
        if let Err(diag) = loader.process_line(line, line_num + 1) {
            warn!(%diag, "skipping line");
            loader.program.diagnostics.push(diag);
        }
    }

    let size = loader.program.image.len();
    if size > MEMORY_SIZE {
        return Err(LoaderError::ProgramTooLarge { size });
    }

    Ok(loader.program)
}

#[derive(Default)]
struct Loader {
    program: Program,
}

impl Loader {
    fn process_line(&mut self, line: &str, line_num: usize) -> Result<(), Diagnostic> {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        // Remove trailing comments
        let line = match line.find([';', '#']) {
            Some(idx) => line[..idx].trim(),
            None => line,
        };

        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        let Some((&head, operands)) = tokens.split_first() else {
            return Ok(());
        };

        if let Some(index) = register_name(head) {
            return self.init_register(index, operands, line_num);
        }

        let opcode = Opcode::from_mnemonic(head).ok_or_else(|| Diagnostic::UnknownMnemonic {
            line: line_num,
            mnemonic: head.to_string(),
        })?;

        let instr = parse_instruction(opcode, operands, line_num)?;
        self.emit(instr, line_num);
        Ok(())
    }

    fn init_register(&mut self, index: u64, operands: &[&str], line_num: usize) -> Result<(), Diagnostic> {
        let reg = u8::try_from(index)
            .ok()
            .and_then(Reg::new)
            .ok_or(Diagnostic::RegisterOutOfRange { line: line_num, index })?;

        let [value] = operands else {
            return Err(Diagnostic::OperandCount {
                line: line_num,
                mnemonic: reg.to_string(),
                expected: 1,
                found: operands.len(),
            });
        };

        let value = parse_number(value).ok_or_else(|| Diagnostic::InvalidNumber {
            line: line_num,
            token: value.to_string(),
        })?;
        if !(-128..=255).contains(&value) {
            return Err(Diagnostic::ValueOutOfRange { line: line_num, value });
        }

        self.program.registers[reg.index()] = value as u8;
        Ok(())
    }

    fn emit(&mut self, instr: Instruction, line_num: usize) {
        let addr = self.program.image.len() as u16;
        self.program.image.extend(encode(&instr));
        self.program.listing.push(ListingEntry { addr, line: line_num, instr });
    }
}

fn parse_instruction(opcode: Opcode, operands: &[&str], line: usize) -> Result<Instruction, Diagnostic> {
    let expected = opcode.size() as usize - 1;
    if operands.len() != expected {
        return Err(Diagnostic::OperandCount {
            line,
            mnemonic: opcode.mnemonic().to_string(),
            expected,
            found: operands.len(),
        });
    }

    let reg = |token: &str| parse_register(token, line);
    let byte = |token: &str| parse_byte(token, line);

    let instr = match opcode.shape() {
        OperandShape::None => Instruction::fetched(opcode.byte()),
        OperandShape::RegReg => {
            let (dst, src) = (reg(operands[0])?, reg(operands[1])?);
            match opcode {
                Opcode::MovRR => Instruction::MovRR { dst, src },
                Opcode::AddRR => Instruction::AddRR { dst, src },
                _ => Instruction::SubRR { dst, src },
            }
        }
        OperandShape::RegToMem => Instruction::MovRM { addr: byte(operands[0])?, src: reg(operands[1])? },
        OperandShape::MemToReg => Instruction::MovMR { dst: reg(operands[0])?, addr: byte(operands[1])? },
        OperandShape::Imm => Instruction::Jmp { target: byte(operands[0])? },
    };

    Ok(instr)
}

/// `R3` / `r3` -> 3. Anything else is not a register name.
fn register_name(token: &str) -> Option<u64> {
    let digits = token.strip_prefix(['R', 'r'])?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_register(token: &str, line: usize) -> Result<Reg, Diagnostic> {
    let index = match register_name(token) {
        Some(index) => index as i64,
        None => parse_number(token).ok_or_else(|| Diagnostic::InvalidNumber {
            line,
            token: token.to_string(),
        })?,
    };

    u8::try_from(index)
        .ok()
        .and_then(Reg::new)
        .ok_or(Diagnostic::RegisterOutOfRange { line, index: index as u64 })
}

fn parse_byte(token: &str, line: usize) -> Result<u8, Diagnostic> {
    let value = parse_number(token).ok_or_else(|| Diagnostic::InvalidNumber {
        line,
        token: token.to_string(),
    })?;
    u8::try_from(value).map_err(|_| Diagnostic::ValueOutOfRange { line, value })
}

/// Decimal, `0x` hex, `0o` octal or `0b` binary, with an optional sign.
fn parse_number(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };

    let lower = digits.to_ascii_lowercase();
    let magnitude = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        lower.parse::<i64>().ok()?
    };

    Some(if negative { -magnitude } else { magnitude })
}

/// A skipped source line.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Diagnostic {
    #[error("line {line}: unknown mnemonic {mnemonic}")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("line {line}: register R{index} out of range (R0-R7)")]
    RegisterOutOfRange { line: usize, index: u64 },

    #[error("line {line}: {mnemonic} takes {expected} operand(s), found {found}")]
    OperandCount { line: usize, mnemonic: String, expected: usize, found: usize },

    #[error("line {line}: invalid number {token}")]
    InvalidNumber { line: usize, token: String },

    #[error("line {line}: value {value} does not fit in a byte")]
    ValueOutOfRange { line: usize, value: i64 },
}

impl Diagnostic {
    /// Source line the diagnostic refers to.
    pub fn line(&self) -> usize {
        match self {
            Diagnostic::UnknownMnemonic { line, .. }
            | Diagnostic::RegisterOutOfRange { line, .. }
            | Diagnostic::OperandCount { line, .. }
            | Diagnostic::InvalidNumber { line, .. }
            | Diagnostic::ValueOutOfRange { line, .. } => *line,
        }
    }
}

/// Errors that stop loading altogether.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("program is {size} bytes, memory holds {}", MEMORY_SIZE)]
    ProgramTooLarge { size: usize },
}
