use crate::opcode_tables;
use std::fmt::{self, Display, Formatter};
use std::ops::Range;

/// 6502 instruction mnemonics (documented NMOS set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
}

impl Mnemonic {
    pub fn name(&self) -> &'static str {
        match self {
            Mnemonic::Adc => "ADC",
            Mnemonic::And => "AND",
            Mnemonic::Asl => "ASL",
            Mnemonic::Bcc => "BCC",
            Mnemonic::Bcs => "BCS",
            Mnemonic::Beq => "BEQ",
            Mnemonic::Bit => "BIT",
            Mnemonic::Bmi => "BMI",
            Mnemonic::Bne => "BNE",
            Mnemonic::Bpl => "BPL",
            Mnemonic::Brk => "BRK",
            Mnemonic::Bvc => "BVC",
            Mnemonic::Bvs => "BVS",
            Mnemonic::Clc => "CLC",
            Mnemonic::Cld => "CLD",
            Mnemonic::Cli => "CLI",
            Mnemonic::Clv => "CLV",
            Mnemonic::Cmp => "CMP",
            Mnemonic::Cpx => "CPX",
            Mnemonic::Cpy => "CPY",
            Mnemonic::Dec => "DEC",
            Mnemonic::Dex => "DEX",
            Mnemonic::Dey => "DEY",
            Mnemonic::Eor => "EOR",
            Mnemonic::Inc => "INC",
            Mnemonic::Inx => "INX",
            Mnemonic::Iny => "INY",
            Mnemonic::Jmp => "JMP",
            Mnemonic::Jsr => "JSR",
            Mnemonic::Lda => "LDA",
            Mnemonic::Ldx => "LDX",
            Mnemonic::Ldy => "LDY",
            Mnemonic::Lsr => "LSR",
            Mnemonic::Nop => "NOP",
            Mnemonic::Ora => "ORA",
            Mnemonic::Pha => "PHA",
            Mnemonic::Php => "PHP",
            Mnemonic::Pla => "PLA",
            Mnemonic::Plp => "PLP",
            Mnemonic::Rol => "ROL",
            Mnemonic::Ror => "ROR",
            Mnemonic::Rti => "RTI",
            Mnemonic::Rts => "RTS",
            Mnemonic::Sbc => "SBC",
            Mnemonic::Sec => "SEC",
            Mnemonic::Sed => "SED",
            Mnemonic::Sei => "SEI",
            Mnemonic::Sta => "STA",
            Mnemonic::Stx => "STX",
            Mnemonic::Sty => "STY",
            Mnemonic::Tax => "TAX",
            Mnemonic::Tay => "TAY",
            Mnemonic::Tsx => "TSX",
            Mnemonic::Txa => "TXA",
            Mnemonic::Txs => "TXS",
            Mnemonic::Tya => "TYA",
        }
    }

    /// Conditional branches (relative addressing)
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Mnemonic::Bcc
                | Mnemonic::Bcs
                | Mnemonic::Beq
                | Mnemonic::Bmi
                | Mnemonic::Bne
                | Mnemonic::Bpl
                | Mnemonic::Bvc
                | Mnemonic::Bvs
        )
    }

    /// Instructions after which execution never falls through to the next byte
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Mnemonic::Rts | Mnemonic::Rti | Mnemonic::Brk | Mnemonic::Jmp
        )
    }
}

impl Display for Mnemonic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Addressing modes of the NMOS 6502
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
}

impl AddressingMode {
    /// Number of operand bytes following the opcode
    pub fn operand_size(&self) -> usize {
        match self {
            AddressingMode::Implied | AddressingMode::Accumulator => 0,
            AddressingMode::Immediate
            | AddressingMode::ZeroPage
            | AddressingMode::ZeroPageX
            | AddressingMode::ZeroPageY
            | AddressingMode::IndirectX
            | AddressingMode::IndirectY
            | AddressingMode::Relative => 1,
            AddressingMode::Absolute
            | AddressingMode::AbsoluteX
            | AddressingMode::AbsoluteY
            | AddressingMode::Indirect => 2,
        }
    }

    pub fn operand_class(&self) -> OperandClass {
        classify_operand(*self)
    }
}

/// What an instruction's operand bytes mean, as far as relocation is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandClass {
    None,
    Zp,
    ZpX,
    ZpY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
    Immediate,
}

impl OperandClass {
    /// Operand stores a 16-bit address (low byte first)
    pub fn is_absolute(&self) -> bool {
        matches!(
            self,
            OperandClass::Absolute
                | OperandClass::AbsoluteX
                | OperandClass::AbsoluteY
                | OperandClass::Indirect
        )
    }

    /// Operand stores a zero-page address
    pub fn is_zero_page(&self) -> bool {
        matches!(
            self,
            OperandClass::Zp
                | OperandClass::ZpX
                | OperandClass::ZpY
                | OperandClass::IndirectX
                | OperandClass::IndirectY
        )
    }

    /// Zero-page operand names the low byte of a two-byte pointer
    pub fn is_zero_page_pointer(&self) -> bool {
        matches!(self, OperandClass::IndirectX | OperandClass::IndirectY)
    }
}

/// Map an addressing mode onto the operand class the relocator works with
pub fn classify_operand(mode: AddressingMode) -> OperandClass {
    match mode {
        AddressingMode::Implied | AddressingMode::Accumulator => OperandClass::None,
        AddressingMode::Immediate => OperandClass::Immediate,
        AddressingMode::ZeroPage => OperandClass::Zp,
        AddressingMode::ZeroPageX => OperandClass::ZpX,
        AddressingMode::ZeroPageY => OperandClass::ZpY,
        AddressingMode::Absolute => OperandClass::Absolute,
        AddressingMode::AbsoluteX => OperandClass::AbsoluteX,
        AddressingMode::AbsoluteY => OperandClass::AbsoluteY,
        AddressingMode::Indirect => OperandClass::Indirect,
        AddressingMode::IndirectX => OperandClass::IndirectX,
        AddressingMode::IndirectY => OperandClass::IndirectY,
        AddressingMode::Relative => OperandClass::Relative,
    }
}

/// Raw operand value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Byte(u8),
    Word(u16),
}

/// Failure to decode an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Opcode value not assigned on the NMOS 6502
    InvalidOpcode { offset: usize, opcode: u8 },
    /// Operand bytes run past the end of the buffer
    Truncated { offset: usize, opcode: u8, needed: usize },
    OutOfBounds(usize),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidOpcode { offset, opcode } => {
                write!(f, "invalid opcode ${:02X} at offset {:#06x}", opcode, offset)
            }
            DecodeError::Truncated {
                offset,
                opcode,
                needed,
            } => write!(
                f,
                "opcode ${:02X} at offset {:#06x} needs {} operand byte(s) past the end of the image",
                opcode, offset, needed
            ),
            DecodeError::OutOfBounds(offset) => {
                write!(f, "offset {:#06x} out of bounds", offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decoded instruction. Derived from the bytes on demand, never stored in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the opcode byte in the decoded buffer
    pub offset: usize,
    pub opcode: u8,
    pub mnemonic: Mnemonic,
    pub mode: AddressingMode,
    /// Total size in bytes (1-3)
    pub size: usize,
    /// Base cycle count, excluding page-crossing and branch penalties
    pub cycles: u8,
    pub operand: Operand,
}

impl Instruction {
    /// Decode an instruction from `bytes` at `offset`
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let opcode = *bytes.get(offset).ok_or(DecodeError::OutOfBounds(offset))?;
        let info = opcode_tables::lookup(opcode)
            .ok_or(DecodeError::InvalidOpcode { offset, opcode })?;

        let needed = info.mode.operand_size();
        if offset + needed >= bytes.len() && needed > 0 {
            return Err(DecodeError::Truncated {
                offset,
                opcode,
                needed,
            });
        }

        let operand = match needed {
            0 => Operand::None,
            1 => Operand::Byte(bytes[offset + 1]),
            _ => Operand::Word(u16::from_le_bytes([bytes[offset + 1], bytes[offset + 2]])),
        };

        Ok(Instruction {
            offset,
            opcode,
            mnemonic: info.mnemonic,
            mode: info.mode,
            size: 1 + needed,
            cycles: info.cycles,
            operand,
        })
    }

    /// Offsets of the operand bytes within the decoded buffer
    pub fn operand_offsets(&self) -> Range<usize> {
        self.offset + 1..self.offset + self.size
    }

    pub fn operand_class(&self) -> OperandClass {
        classify_operand(self.mode)
    }

    /// The operand widened to 16 bits (0 for operand-less instructions)
    pub fn operand_value(&self) -> u16 {
        match self.operand {
            Operand::None => 0,
            Operand::Byte(b) => b as u16,
            Operand::Word(w) => w,
        }
    }

    /// Target of a relative branch, given the address the instruction is loaded at
    pub fn branch_target(&self, address: u16) -> Option<u16> {
        match (self.mode, self.operand) {
            (AddressingMode::Relative, Operand::Byte(disp)) => Some(
                address
                    .wrapping_add(self.size as u16)
                    .wrapping_add(disp as i8 as i16 as u16),
            ),
            _ => None,
        }
    }
}
