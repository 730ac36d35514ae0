//! Disassembler.
//!
//! Converts memory bytes back to loader syntax.

use crate::cpu::decode::{decode, Instruction};
use crate::cpu::Memory;

/// Disassemble the instruction at `addr`.
///
/// Returns the text and the number of bytes it covers. Bytes that do not
/// form a valid instruction come back as `.byte N`.
pub fn disassemble_at(mem: &Memory, addr: u16) -> (String, u16) {
    match decode(mem, addr) {
        Ok(Instruction::Invalid { byte }) => (format!(".byte {}", byte), 1),
        Ok(instr) => (instr.to_string(), instr.size()),
        Err(_) => match mem.read(addr) {
            Ok(byte) => (format!(".byte {}", byte), 1),
            Err(_) => (String::from("<out of range>"), 1),
        },
    }
}

/// Walk `count` instructions starting at `start`.
pub fn listing(mem: &Memory, start: u16, count: usize) -> Vec<(u16, String)> {
    let mut out = Vec::with_capacity(count);
    let mut addr = start;

    while out.len() < count && Memory::contains(addr) {
        let (text, len) = disassemble_at(mem, addr);
        out.push((addr, text));
        addr += len;
    }

    out
}

/// Disassemble the first `len` bytes of memory.
pub fn disassemble(mem: &Memory, len: usize) -> String {
    let mut output = String::new();
    output.push_str("# Disassembly\n");
    output.push_str("# -----------\n\n");

    let mut addr = 0u16;
    while (addr as usize) < len && Memory::contains(addr) {
        let (text, size) = disassemble_at(mem, addr);
        let bytes: Vec<String> = (addr..addr + size)
            .filter_map(|a| mem.read(a).ok())
            .map(|b| format!("{:02x}", b))
            .collect();
        output.push_str(&format!("{:<24} # {:03}: {}\n", text, addr, bytes.join(" ")));
        addr += size;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    fn mem_with(bytes: &[u8]) -> Memory {
        let mut mem = Memory::new();
        mem.load_program(0, bytes).unwrap();
        mem
    }

    #[test]
    fn test_disassemble_halt() {
        let mem = mem_with(&[0]);
        assert_eq!(disassemble_at(&mem, 0), ("HALT".to_string(), 1));
    }

    #[test]
    fn test_disassemble_invalid_byte() {
        let mem = mem_with(&[8]);
        assert_eq!(disassemble_at(&mem, 0), (".byte 8".to_string(), 1));

        // bad register operand
        let mem = mem_with(&[2, 9, 0]);
        assert_eq!(disassemble_at(&mem, 0), (".byte 2".to_string(), 1));
    }

    #[test]
    fn test_listing_steps_by_size() {
        let mem = mem_with(&[7, 5, 2, 0, 1, 0]);
        let lines = listing(&mem, 0, 3);
        assert_eq!(
            lines,
            vec![
                (0, "JMP 5".to_string()),
                (2, "MOV_RR R0 R1".to_string()),
                (5, "HALT".to_string()),
            ]
        );
    }

    #[test]
    fn test_listing_stops_at_end_of_memory() {
        let mem = Memory::new();
        assert_eq!(listing(&mem, 250, 100).len(), 6);
    }

    #[test]
    fn test_output_reassembles() {
        let source = "MOV_RM 100 R2\nMOV_MR R3 100\nADD_RR R0 R1\nJMP 0\nHALT";
        let program = assemble(source).unwrap();
        let mem = mem_with(&program.image);

        let text = disassemble(&mem, program.image.len());
        let again = assemble(&text).unwrap();

        assert_eq!(again.image, program.image);
        assert!(again.diagnostics.is_empty());
    }
}
