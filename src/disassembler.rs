use crate::instruction::{AddressingMode, DecodeError, Instruction, Operand};
use std::ops::Range;

/// Renders machine code as assembler text
pub struct Disassembler<'a> {
    memory: &'a [u8],
    origin: u16,
}

impl<'a> Disassembler<'a> {
    pub fn new(memory: &'a [u8], origin: u16) -> Self {
        Disassembler { memory, origin }
    }

    /// Render one instruction, e.g. `$C000  A9 01     LDA #$01`.
    /// Returns the line and the number of bytes consumed.
    pub fn line_at(&self, offset: usize) -> (String, usize) {
        let address = self.origin.wrapping_add(offset as u16);
        match Instruction::decode(self.memory, offset) {
            Ok(instruction) => (
                self.format_instruction(address, &instruction),
                instruction.size,
            ),
            Err(DecodeError::OutOfBounds(_)) => (format!("${:04X}  <end of image>", address), 0),
            Err(_) => {
                let byte = self.memory[offset];
                (
                    format!("${:04X}  {:<9} .byte ${:02X}", address, format!("{:02X}", byte), byte),
                    1,
                )
            }
        }
    }

    /// Linear sweep over `range`; undecodable bytes become `.byte` lines
    pub fn listing(&self, range: Range<usize>) -> String {
        let mut output = String::new();
        let mut offset = range.start;
        let end = range.end.min(self.memory.len());

        while offset < end {
            let (line, consumed) = self.line_at(offset);
            output.push_str(&line);
            output.push('\n');
            if consumed == 0 {
                break;
            }
            offset += consumed;
        }
        output
    }

    /// Text of the instruction alone, without address or bytes
    pub fn format_operation(&self, address: u16, instruction: &Instruction) -> String {
        let operand = self.format_operand(address, instruction);
        if operand.is_empty() {
            instruction.mnemonic.to_string()
        } else {
            format!("{} {}", instruction.mnemonic, operand)
        }
    }

    fn format_instruction(&self, address: u16, instruction: &Instruction) -> String {
        let raw = self.memory[instruction.offset..instruction.offset + instruction.size]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "${:04X}  {:<9} {}",
            address,
            raw,
            self.format_operation(address, instruction)
        )
    }

    fn format_operand(&self, address: u16, instruction: &Instruction) -> String {
        let value = instruction.operand_value();
        match (instruction.mode, instruction.operand) {
            (AddressingMode::Implied, _) => String::new(),
            (AddressingMode::Accumulator, _) => "A".to_string(),
            (AddressingMode::Immediate, _) => format!("#${:02X}", value),
            (AddressingMode::ZeroPage, _) => format!("${:02X}", value),
            (AddressingMode::ZeroPageX, _) => format!("${:02X},X", value),
            (AddressingMode::ZeroPageY, _) => format!("${:02X},Y", value),
            (AddressingMode::Absolute, _) => format!("${:04X}", value),
            (AddressingMode::AbsoluteX, _) => format!("${:04X},X", value),
            (AddressingMode::AbsoluteY, _) => format!("${:04X},Y", value),
            (AddressingMode::Indirect, _) => format!("(${:04X})", value),
            (AddressingMode::IndirectX, _) => format!("(${:02X},X)", value),
            (AddressingMode::IndirectY, _) => format!("(${:02X}),Y", value),
            (AddressingMode::Relative, Operand::Byte(_)) => match instruction.branch_target(address) {
                Some(target) => format!("${:04X}", target),
                None => String::new(),
            },
            (AddressingMode::Relative, _) => String::new(),
        }
    }
}

#[cfg(test)]
#[path = "disassembler_tests.rs"]
mod tests;
