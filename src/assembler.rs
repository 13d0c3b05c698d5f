use crate::error::AssemblerError;
use crate::expr::Expr;
use crate::image::ProgramImage;
use crate::instruction::{AddressingMode, Mnemonic};
use crate::opcode_tables;
use indexmap::IndexMap;
use log::debug;

/// How a pending operand is patched once labels are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Byte,
    /// Little-endian 16-bit value
    Word,
    /// Signed displacement from the end of a branch instruction
    Relative,
}

/// Operand bytes waiting for their expression to be evaluated
#[derive(Debug, Clone)]
pub struct PendingFixup {
    pub kind: FixupKind,
    /// Offset of the first operand byte in the output
    pub location: usize,
    pub expr: Expr,
}

/// Output of a finished assembly
#[derive(Debug, Clone)]
pub struct Assembly {
    pub image: ProgramImage,
    pub labels: IndexMap<String, u16>,
}

impl Assembly {
    pub fn address_of(&self, label: &str) -> Option<u16> {
        self.labels.get(label).copied()
    }
}

/// Fluent 6502 assembler. Operands are expressions; all of them are
/// evaluated in `end()`, so forward references are fine.
///
/// ```
/// use relo6502::assembler::Assembler;
/// use relo6502::expr::Expr;
///
/// let mut asm = Assembler::new(0xC000);
/// asm.lda_abs(Expr::label("value")).sta_zp(0x80u8).rts();
/// asm.label("value").byte(42u8);
/// let assembly = asm.end().unwrap();
/// assert_eq!(assembly.image.bytes(), &[0xAD, 0x06, 0xC0, 0x85, 0x80, 0x60, 42]);
/// ```
#[derive(Debug, Clone)]
pub struct Assembler {
    origin: u16,
    bytes: Vec<u8>,
    labels: IndexMap<String, u16>,
    fixups: Vec<PendingFixup>,
    // First error seen while emitting; reported by end()
    error: Option<AssemblerError>,
}

impl Assembler {
    pub fn new(origin: u16) -> Self {
        Assembler {
            origin,
            bytes: Vec::new(),
            labels: IndexMap::new(),
            fixups: Vec::new(),
            error: None,
        }
    }

    pub fn current_address(&self) -> u16 {
        self.origin.wrapping_add(self.bytes.len() as u16)
    }

    /// Bind `name` to the current address
    pub fn label(&mut self, name: &str) -> &mut Self {
        let address = self.current_address();
        if self.labels.contains_key(name) {
            self.fail(AssemblerError::DuplicateLabel(name.to_string()));
        } else {
            debug!("label {} = ${:04X}", name, address);
            self.labels.insert(name.to_string(), address);
        }
        self
    }

    pub fn byte(&mut self, value: impl Into<Expr>) -> &mut Self {
        self.emit_operand(FixupKind::Byte, value.into());
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn word(&mut self, value: impl Into<Expr>) -> &mut Self {
        self.emit_operand(FixupKind::Word, value.into());
        self
    }

    /// Emit any documented instruction
    pub fn instr(
        &mut self,
        mnemonic: Mnemonic,
        mode: AddressingMode,
        operand: Option<Expr>,
    ) -> &mut Self {
        let Some(opcode) = opcode_tables::find(mnemonic, mode) else {
            self.fail(AssemblerError::InvalidAddressingMode(format!(
                "{} {:?}",
                mnemonic, mode
            )));
            return self;
        };

        self.bytes.push(opcode);
        let kind = match mode.operand_size() {
            0 => None,
            1 if mode == AddressingMode::Relative => Some(FixupKind::Relative),
            1 => Some(FixupKind::Byte),
            _ => Some(FixupKind::Word),
        };

        match (kind, operand) {
            (None, None) => {}
            (Some(kind), Some(expr)) => self.emit_operand(kind, expr),
            (Some(kind), None) => {
                self.fail(AssemblerError::InvalidAddressingMode(format!(
                    "{} {:?} needs an operand",
                    mnemonic, mode
                )));
                self.emit_operand(kind, Expr::Const(0));
            }
            (None, Some(_)) => self.fail(AssemblerError::InvalidAddressingMode(format!(
                "{} {:?} takes no operand",
                mnemonic, mode
            ))),
        }
        self
    }

    /// Resolve every pending operand and produce the image
    pub fn end(mut self) -> Result<Assembly, AssemblerError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        for fixup in &self.fixups {
            let at = self.origin.wrapping_add(fixup.location as u16);
            let value = fixup.expr.eval(&self.labels)?;
            match fixup.kind {
                FixupKind::Byte => {
                    if !(-128..=0xFF).contains(&value) {
                        return Err(AssemblerError::ValueOutOfRange { at, value });
                    }
                    self.bytes[fixup.location] = value as u8;
                }
                FixupKind::Word => {
                    if !(0..=0xFFFF).contains(&value) {
                        return Err(AssemblerError::ValueOutOfRange { at, value });
                    }
                    let [lo, hi] = (value as u16).to_le_bytes();
                    self.bytes[fixup.location] = lo;
                    self.bytes[fixup.location + 1] = hi;
                }
                FixupKind::Relative => {
                    let next = at as i32 + 1;
                    let displacement = value - next;
                    if !(-128..=127).contains(&displacement) {
                        return Err(AssemblerError::BranchOutOfRange { at, displacement });
                    }
                    self.bytes[fixup.location] = displacement as i8 as u8;
                }
            }
        }

        debug!(
            "assembled {} bytes at ${:04X}, {} labels, {} fixups",
            self.bytes.len(),
            self.origin,
            self.labels.len(),
            self.fixups.len()
        );

        let image =
            ProgramImage::new(self.bytes, self.origin).map_err(AssemblerError::InvalidImage)?;
        Ok(Assembly {
            image,
            labels: self.labels,
        })
    }

    fn emit_operand(&mut self, kind: FixupKind, expr: Expr) {
        let location = self.bytes.len();
        let width = if kind == FixupKind::Word { 2 } else { 1 };
        self.bytes.resize(location + width, 0);
        self.fixups.push(PendingFixup {
            kind,
            location,
            expr,
        });
    }

    fn fail(&mut self, error: AssemblerError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

macro_rules! implied_ops {
    ($($name:ident => $mnemonic:ident, $mode:ident;)*) => {
        impl Assembler {
            $(
                pub fn $name(&mut self) -> &mut Self {
                    self.instr(Mnemonic::$mnemonic, AddressingMode::$mode, None)
                }
            )*
        }
    };
}

macro_rules! operand_ops {
    ($($name:ident => $mnemonic:ident, $mode:ident;)*) => {
        impl Assembler {
            $(
                pub fn $name(&mut self, operand: impl Into<Expr>) -> &mut Self {
                    self.instr(Mnemonic::$mnemonic, AddressingMode::$mode, Some(operand.into()))
                }
            )*
        }
    };
}

implied_ops! {
    asl_a => Asl, Accumulator;
    brk => Brk, Implied;
    clc => Clc, Implied;
    cld => Cld, Implied;
    cli => Cli, Implied;
    clv => Clv, Implied;
    dex => Dex, Implied;
    dey => Dey, Implied;
    inx => Inx, Implied;
    iny => Iny, Implied;
    lsr_a => Lsr, Accumulator;
    nop => Nop, Implied;
    pha => Pha, Implied;
    php => Php, Implied;
    pla => Pla, Implied;
    plp => Plp, Implied;
    rol_a => Rol, Accumulator;
    ror_a => Ror, Accumulator;
    rti => Rti, Implied;
    rts => Rts, Implied;
    sec => Sec, Implied;
    sed => Sed, Implied;
    sei => Sei, Implied;
    tax => Tax, Implied;
    tay => Tay, Implied;
    tsx => Tsx, Implied;
    txa => Txa, Implied;
    txs => Txs, Implied;
    tya => Tya, Implied;
}

operand_ops! {
    adc_imm => Adc, Immediate;
    adc_zp => Adc, ZeroPage;
    adc_zpx => Adc, ZeroPageX;
    adc_abs => Adc, Absolute;
    adc_absx => Adc, AbsoluteX;
    adc_absy => Adc, AbsoluteY;
    adc_indx => Adc, IndirectX;
    adc_indy => Adc, IndirectY;
    and_imm => And, Immediate;
    and_zp => And, ZeroPage;
    and_zpx => And, ZeroPageX;
    and_abs => And, Absolute;
    and_absx => And, AbsoluteX;
    and_absy => And, AbsoluteY;
    and_indx => And, IndirectX;
    and_indy => And, IndirectY;
    asl_zp => Asl, ZeroPage;
    asl_zpx => Asl, ZeroPageX;
    asl_abs => Asl, Absolute;
    asl_absx => Asl, AbsoluteX;
    bcc => Bcc, Relative;
    bcs => Bcs, Relative;
    beq => Beq, Relative;
    bit_zp => Bit, ZeroPage;
    bit_abs => Bit, Absolute;
    bmi => Bmi, Relative;
    bne => Bne, Relative;
    bpl => Bpl, Relative;
    bvc => Bvc, Relative;
    bvs => Bvs, Relative;
    cmp_imm => Cmp, Immediate;
    cmp_zp => Cmp, ZeroPage;
    cmp_zpx => Cmp, ZeroPageX;
    cmp_abs => Cmp, Absolute;
    cmp_absx => Cmp, AbsoluteX;
    cmp_absy => Cmp, AbsoluteY;
    cmp_indx => Cmp, IndirectX;
    cmp_indy => Cmp, IndirectY;
    cpx_imm => Cpx, Immediate;
    cpx_zp => Cpx, ZeroPage;
    cpx_abs => Cpx, Absolute;
    cpy_imm => Cpy, Immediate;
    cpy_zp => Cpy, ZeroPage;
    cpy_abs => Cpy, Absolute;
    dec_zp => Dec, ZeroPage;
    dec_zpx => Dec, ZeroPageX;
    dec_abs => Dec, Absolute;
    dec_absx => Dec, AbsoluteX;
    eor_imm => Eor, Immediate;
    eor_zp => Eor, ZeroPage;
    eor_zpx => Eor, ZeroPageX;
    eor_abs => Eor, Absolute;
    eor_absx => Eor, AbsoluteX;
    eor_absy => Eor, AbsoluteY;
    eor_indx => Eor, IndirectX;
    eor_indy => Eor, IndirectY;
    inc_zp => Inc, ZeroPage;
    inc_zpx => Inc, ZeroPageX;
    inc_abs => Inc, Absolute;
    inc_absx => Inc, AbsoluteX;
    jmp_abs => Jmp, Absolute;
    jmp_ind => Jmp, Indirect;
    jsr => Jsr, Absolute;
    lda_imm => Lda, Immediate;
    lda_zp => Lda, ZeroPage;
    lda_zpx => Lda, ZeroPageX;
    lda_abs => Lda, Absolute;
    lda_absx => Lda, AbsoluteX;
    lda_absy => Lda, AbsoluteY;
    lda_indx => Lda, IndirectX;
    lda_indy => Lda, IndirectY;
    ldx_imm => Ldx, Immediate;
    ldx_zp => Ldx, ZeroPage;
    ldx_zpy => Ldx, ZeroPageY;
    ldx_abs => Ldx, Absolute;
    ldx_absy => Ldx, AbsoluteY;
    ldy_imm => Ldy, Immediate;
    ldy_zp => Ldy, ZeroPage;
    ldy_zpx => Ldy, ZeroPageX;
    ldy_abs => Ldy, Absolute;
    ldy_absx => Ldy, AbsoluteX;
    lsr_zp => Lsr, ZeroPage;
    lsr_zpx => Lsr, ZeroPageX;
    lsr_abs => Lsr, Absolute;
    lsr_absx => Lsr, AbsoluteX;
    ora_imm => Ora, Immediate;
    ora_zp => Ora, ZeroPage;
    ora_zpx => Ora, ZeroPageX;
    ora_abs => Ora, Absolute;
    ora_absx => Ora, AbsoluteX;
    ora_absy => Ora, AbsoluteY;
    ora_indx => Ora, IndirectX;
    ora_indy => Ora, IndirectY;
    rol_zp => Rol, ZeroPage;
    rol_zpx => Rol, ZeroPageX;
    rol_abs => Rol, Absolute;
    rol_absx => Rol, AbsoluteX;
    ror_zp => Ror, ZeroPage;
    ror_zpx => Ror, ZeroPageX;
    ror_abs => Ror, Absolute;
    ror_absx => Ror, AbsoluteX;
    sbc_imm => Sbc, Immediate;
    sbc_zp => Sbc, ZeroPage;
    sbc_zpx => Sbc, ZeroPageX;
    sbc_abs => Sbc, Absolute;
    sbc_absx => Sbc, AbsoluteX;
    sbc_absy => Sbc, AbsoluteY;
    sbc_indx => Sbc, IndirectX;
    sbc_indy => Sbc, IndirectY;
    sta_zp => Sta, ZeroPage;
    sta_zpx => Sta, ZeroPageX;
    sta_abs => Sta, Absolute;
    sta_absx => Sta, AbsoluteX;
    sta_absy => Sta, AbsoluteY;
    sta_indx => Sta, IndirectX;
    sta_indy => Sta, IndirectY;
    stx_zp => Stx, ZeroPage;
    stx_zpy => Stx, ZeroPageY;
    stx_abs => Stx, Absolute;
    sty_zp => Sty, ZeroPage;
    sty_zpx => Sty, ZeroPageX;
    sty_abs => Sty, Absolute;
}

#[cfg(test)]
#[path = "assembler_tests.rs"]
mod tests;
