//! Cycle-accurate NMOS 6502 interpreter
//!
//! Every machine cycle performs exactly one bus access, including the dummy
//! reads and the read-modify-write double write of the original silicon, so a
//! bus decorator sees one access per cycle and the access count of an
//! instruction equals its cycle count.

use crate::error::CpuError;
use crate::image::ProgramImage;
use crate::instruction::{AddressingMode, Mnemonic};
use crate::opcode_tables;
use log::trace;
use std::fmt;

pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_D: u8 = 0x08;
pub const FLAG_B: u8 = 0x10;
pub const FLAG_U: u8 = 0x20;
pub const FLAG_V: u8 = 0x40;
pub const FLAG_N: u8 = 0x80;

const STACK_PAGE: u16 = 0x0100;
const IRQ_VECTOR: u16 = 0xFFFE;

/// What a bus access is for. Buses that only store bytes can ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Opcode fetch at the program counter
    OpcodeFetch,
    /// Operand byte fetch at the program counter
    OperandFetch,
    /// Data read or write at the effective address
    Data,
    /// Pointer byte read of an indirect addressing mode
    Pointer,
    /// Stack push or pull
    Stack,
    /// Read whose value the CPU discards, or the first write of a read-modify-write
    Dummy,
    /// Interrupt vector read
    Vector,
}

/// Byte-addressable 64 KiB bus the CPU runs against
pub trait MemoryBus {
    fn read(&mut self, address: u16) -> u8;
    fn write(&mut self, address: u16, value: u8);

    fn read_as(&mut self, address: u16, _kind: AccessKind) -> u8 {
        self.read(address)
    }

    fn write_as(&mut self, address: u16, value: u8, _kind: AccessKind) {
        self.write(address, value)
    }
}

/// Flat 64 KiB RAM
#[derive(Clone)]
pub struct Ram {
    memory: Vec<u8>,
}

impl Default for Ram {
    fn default() -> Self {
        Self::new()
    }
}

impl Ram {
    pub fn new() -> Self {
        Ram {
            memory: vec![0; 0x10000],
        }
    }

    /// RAM with the image loaded at its origin
    pub fn with_image(image: &ProgramImage) -> Self {
        let mut ram = Ram::new();
        ram.load(image.origin(), image.bytes());
        ram
    }

    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        let start = address as usize;
        let end = (start + bytes.len()).min(self.memory.len());
        self.memory[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn slice(&self, address: u16, len: usize) -> &[u8] {
        let start = address as usize;
        &self.memory[start..(start + len).min(self.memory.len())]
    }

    pub fn peek(&self, address: u16) -> u8 {
        self.memory[address as usize]
    }
}

impl MemoryBus for Ram {
    fn read(&mut self, address: u16) -> u8 {
        self.memory[address as usize]
    }

    fn write(&mut self, address: u16, value: u8) {
        self.memory[address as usize] = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    /// Stack pointer (offset into page one)
    pub s: u8,
    pub p: u8,
    pub pc: u16,
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PC=${:04X} A=${:02X} X=${:02X} Y=${:02X} S=${:02X} P=${:02X}",
            self.pc, self.a, self.x, self.y, self.s, self.p
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Running,
    /// Executed an unassigned opcode; no further progress is possible
    Jammed,
}

/// Summary of one executed instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    /// Address of the opcode byte
    pub address: u16,
    pub opcode: u8,
    pub mnemonic: Option<Mnemonic>,
    /// Machine cycles taken, equal to the bus accesses performed
    pub cycles: u32,
}

pub struct Cpu {
    pub regs: Registers,
    state: CpuState,
    cycles: u64,
    jam_opcode: u8,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        let mut cpu = Cpu {
            regs: Registers::default(),
            state: CpuState::Running,
            cycles: 0,
            jam_opcode: 0,
        };
        cpu.reset();
        cpu
    }

    /// Clear registers, flags and the cycle counter. The program counter is left at zero.
    pub fn reset(&mut self) {
        self.regs = Registers {
            a: 0,
            x: 0,
            y: 0,
            s: 0xFD,
            p: FLAG_I | FLAG_U,
            pc: 0,
        };
        self.state = CpuState::Running;
        self.cycles = 0;
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.regs.pc = pc;
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn is_jammed(&self) -> bool {
        self.state == CpuState::Jammed
    }

    /// Total cycles since the last reset
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn flag(&self, flag: u8) -> bool {
        self.regs.p & flag != 0
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.regs.p |= flag;
        } else {
            self.regs.p &= !flag;
        }
    }

    fn set_nz(&mut self, value: u8) {
        self.set_flag(FLAG_Z, value == 0);
        self.set_flag(FLAG_N, value & 0x80 != 0);
    }

    fn read<B: MemoryBus>(&mut self, bus: &mut B, address: u16, kind: AccessKind) -> u8 {
        self.cycles += 1;
        bus.read_as(address, kind)
    }

    fn write<B: MemoryBus>(&mut self, bus: &mut B, address: u16, value: u8, kind: AccessKind) {
        self.cycles += 1;
        bus.write_as(address, value, kind)
    }

    fn fetch_operand<B: MemoryBus>(&mut self, bus: &mut B) -> u8 {
        let value = self.read(bus, self.regs.pc, AccessKind::OperandFetch);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word<B: MemoryBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch_operand(bus);
        let hi = self.fetch_operand(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn push<B: MemoryBus>(&mut self, bus: &mut B, value: u8) {
        let address = STACK_PAGE | self.regs.s as u16;
        self.write(bus, address, value, AccessKind::Stack);
        self.regs.s = self.regs.s.wrapping_sub(1);
    }

    fn pull<B: MemoryBus>(&mut self, bus: &mut B) -> u8 {
        self.regs.s = self.regs.s.wrapping_add(1);
        let address = STACK_PAGE | self.regs.s as u16;
        self.read(bus, address, AccessKind::Stack)
    }

    fn dummy_read_pc<B: MemoryBus>(&mut self, bus: &mut B) {
        self.read(bus, self.regs.pc, AccessKind::Dummy);
    }

    fn dummy_read_stack<B: MemoryBus>(&mut self, bus: &mut B) {
        let address = STACK_PAGE | self.regs.s as u16;
        self.read(bus, address, AccessKind::Dummy);
    }

    /// Resolve the effective address of a memory operand.
    ///
    /// `always_fix` selects the store/read-modify-write timing, where indexed
    /// modes always spend the page-fixup cycle.
    fn effective_address<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        mode: AddressingMode,
        always_fix: bool,
    ) -> u16 {
        match mode {
            AddressingMode::ZeroPage => self.fetch_operand(bus) as u16,
            AddressingMode::ZeroPageX | AddressingMode::ZeroPageY => {
                let base = self.fetch_operand(bus);
                self.read(bus, base as u16, AccessKind::Dummy);
                let index = if mode == AddressingMode::ZeroPageX {
                    self.regs.x
                } else {
                    self.regs.y
                };
                base.wrapping_add(index) as u16
            }
            AddressingMode::Absolute => self.fetch_word(bus),
            AddressingMode::AbsoluteX | AddressingMode::AbsoluteY => {
                let base = self.fetch_word(bus);
                let index = if mode == AddressingMode::AbsoluteX {
                    self.regs.x
                } else {
                    self.regs.y
                };
                self.index_with_fixup(bus, base, index, always_fix)
            }
            AddressingMode::IndirectX => {
                let pointer = self.fetch_operand(bus);
                self.read(bus, pointer as u16, AccessKind::Dummy);
                let zp = pointer.wrapping_add(self.regs.x);
                let lo = self.read(bus, zp as u16, AccessKind::Pointer);
                let hi = self.read(bus, zp.wrapping_add(1) as u16, AccessKind::Pointer);
                u16::from_le_bytes([lo, hi])
            }
            AddressingMode::IndirectY => {
                let pointer = self.fetch_operand(bus);
                let lo = self.read(bus, pointer as u16, AccessKind::Pointer);
                let hi = self.read(bus, pointer.wrapping_add(1) as u16, AccessKind::Pointer);
                let base = u16::from_le_bytes([lo, hi]);
                self.index_with_fixup(bus, base, self.regs.y, always_fix)
            }
            _ => unreachable!("{:?} has no effective address", mode),
        }
    }

    fn index_with_fixup<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        base: u16,
        index: u8,
        always_fix: bool,
    ) -> u16 {
        let address = base.wrapping_add(index as u16);
        let crossed = (base & 0xFF00) != (address & 0xFF00);
        if crossed || always_fix {
            // The 6502 first reads from the un-carried address
            let partial = (base & 0xFF00) | (address & 0x00FF);
            self.read(bus, partial, AccessKind::Dummy);
        }
        address
    }

    fn read_operand_value<B: MemoryBus>(&mut self, bus: &mut B, mode: AddressingMode) -> u8 {
        if mode == AddressingMode::Immediate {
            self.fetch_operand(bus)
        } else {
            let address = self.effective_address(bus, mode, false);
            self.read(bus, address, AccessKind::Data)
        }
    }

    /// Execute exactly one instruction
    pub fn step<B: MemoryBus>(&mut self, bus: &mut B) -> Result<StepInfo, CpuError> {
        let address = self.regs.pc;
        if self.state == CpuState::Jammed {
            return Err(CpuError::Jammed {
                pc: address,
                opcode: self.jam_opcode,
            });
        }

        let start_cycles = self.cycles;
        let opcode = self.read(bus, address, AccessKind::OpcodeFetch);
        self.regs.pc = self.regs.pc.wrapping_add(1);

        let info = match opcode_tables::lookup(opcode) {
            Some(info) => info,
            None => {
                trace!("jam: opcode ${:02X} at ${:04X}", opcode, address);
                self.state = CpuState::Jammed;
                self.jam_opcode = opcode;
                self.regs.pc = address;
                return Ok(StepInfo {
                    address,
                    opcode,
                    mnemonic: None,
                    cycles: (self.cycles - start_cycles) as u32,
                });
            }
        };

        self.execute(bus, info.mnemonic, info.mode);

        Ok(StepInfo {
            address,
            opcode,
            mnemonic: Some(info.mnemonic),
            cycles: (self.cycles - start_cycles) as u32,
        })
    }

    fn execute<B: MemoryBus>(&mut self, bus: &mut B, mnemonic: Mnemonic, mode: AddressingMode) {
        match mnemonic {
            Mnemonic::Lda => {
                let value = self.read_operand_value(bus, mode);
                self.regs.a = value;
                self.set_nz(value);
            }
            Mnemonic::Ldx => {
                let value = self.read_operand_value(bus, mode);
                self.regs.x = value;
                self.set_nz(value);
            }
            Mnemonic::Ldy => {
                let value = self.read_operand_value(bus, mode);
                self.regs.y = value;
                self.set_nz(value);
            }
            Mnemonic::Adc => {
                let value = self.read_operand_value(bus, mode);
                self.add_with_carry(value);
            }
            Mnemonic::Sbc => {
                let value = self.read_operand_value(bus, mode);
                self.subtract_with_borrow(value);
            }
            Mnemonic::And => {
                let value = self.read_operand_value(bus, mode);
                self.regs.a &= value;
                self.set_nz(self.regs.a);
            }
            Mnemonic::Ora => {
                let value = self.read_operand_value(bus, mode);
                self.regs.a |= value;
                self.set_nz(self.regs.a);
            }
            Mnemonic::Eor => {
                let value = self.read_operand_value(bus, mode);
                self.regs.a ^= value;
                self.set_nz(self.regs.a);
            }
            Mnemonic::Cmp => {
                let value = self.read_operand_value(bus, mode);
                self.compare(self.regs.a, value);
            }
            Mnemonic::Cpx => {
                let value = self.read_operand_value(bus, mode);
                self.compare(self.regs.x, value);
            }
            Mnemonic::Cpy => {
                let value = self.read_operand_value(bus, mode);
                self.compare(self.regs.y, value);
            }
            Mnemonic::Bit => {
                let value = self.read_operand_value(bus, mode);
                self.set_flag(FLAG_Z, self.regs.a & value == 0);
                self.set_flag(FLAG_N, value & 0x80 != 0);
                self.set_flag(FLAG_V, value & 0x40 != 0);
            }
            Mnemonic::Sta | Mnemonic::Stx | Mnemonic::Sty => {
                let address = self.effective_address(bus, mode, true);
                let value = match mnemonic {
                    Mnemonic::Sta => self.regs.a,
                    Mnemonic::Stx => self.regs.x,
                    _ => self.regs.y,
                };
                self.write(bus, address, value, AccessKind::Data);
            }
            Mnemonic::Asl | Mnemonic::Lsr | Mnemonic::Rol | Mnemonic::Ror | Mnemonic::Inc
            | Mnemonic::Dec => self.read_modify_write(bus, mnemonic, mode),
            Mnemonic::Bcc => self.branch(bus, !self.flag(FLAG_C)),
            Mnemonic::Bcs => self.branch(bus, self.flag(FLAG_C)),
            Mnemonic::Beq => self.branch(bus, self.flag(FLAG_Z)),
            Mnemonic::Bne => self.branch(bus, !self.flag(FLAG_Z)),
            Mnemonic::Bmi => self.branch(bus, self.flag(FLAG_N)),
            Mnemonic::Bpl => self.branch(bus, !self.flag(FLAG_N)),
            Mnemonic::Bvs => self.branch(bus, self.flag(FLAG_V)),
            Mnemonic::Bvc => self.branch(bus, !self.flag(FLAG_V)),
            Mnemonic::Jmp => {
                if mode == AddressingMode::Indirect {
                    let pointer = self.fetch_word(bus);
                    let lo = self.read(bus, pointer, AccessKind::Pointer);
                    // The high byte never carries into the next page
                    let hi_address = (pointer & 0xFF00) | (pointer.wrapping_add(1) & 0x00FF);
                    let hi = self.read(bus, hi_address, AccessKind::Pointer);
                    self.regs.pc = u16::from_le_bytes([lo, hi]);
                } else {
                    self.regs.pc = self.fetch_word(bus);
                }
            }
            Mnemonic::Jsr => {
                let lo = self.fetch_operand(bus);
                self.dummy_read_stack(bus);
                let [pcl, pch] = self.regs.pc.to_le_bytes();
                self.push(bus, pch);
                self.push(bus, pcl);
                let hi = self.read(bus, self.regs.pc, AccessKind::OperandFetch);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
            }
            Mnemonic::Rts => {
                self.dummy_read_pc(bus);
                self.dummy_read_stack(bus);
                let lo = self.pull(bus);
                let hi = self.pull(bus);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
                self.dummy_read_pc(bus);
                self.regs.pc = self.regs.pc.wrapping_add(1);
            }
            Mnemonic::Rti => {
                self.dummy_read_pc(bus);
                self.dummy_read_stack(bus);
                let p = self.pull(bus);
                self.regs.p = (p & !FLAG_B) | FLAG_U;
                let lo = self.pull(bus);
                let hi = self.pull(bus);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
            }
            Mnemonic::Brk => {
                self.fetch_operand(bus);
                let [pcl, pch] = self.regs.pc.to_le_bytes();
                self.push(bus, pch);
                self.push(bus, pcl);
                self.push(bus, self.regs.p | FLAG_B | FLAG_U);
                self.set_flag(FLAG_I, true);
                let lo = self.read(bus, IRQ_VECTOR, AccessKind::Vector);
                let hi = self.read(bus, IRQ_VECTOR + 1, AccessKind::Vector);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
            }
            Mnemonic::Pha => {
                self.dummy_read_pc(bus);
                self.push(bus, self.regs.a);
            }
            Mnemonic::Php => {
                self.dummy_read_pc(bus);
                self.push(bus, self.regs.p | FLAG_B | FLAG_U);
            }
            Mnemonic::Pla => {
                self.dummy_read_pc(bus);
                self.dummy_read_stack(bus);
                self.regs.a = self.pull(bus);
                self.set_nz(self.regs.a);
            }
            Mnemonic::Plp => {
                self.dummy_read_pc(bus);
                self.dummy_read_stack(bus);
                let p = self.pull(bus);
                self.regs.p = (p & !FLAG_B) | FLAG_U;
            }
            _ => {
                // Two-cycle implied instructions
                self.dummy_read_pc(bus);
                self.execute_implied(mnemonic);
            }
        }
    }

    fn execute_implied(&mut self, mnemonic: Mnemonic) {
        match mnemonic {
            Mnemonic::Clc => self.set_flag(FLAG_C, false),
            Mnemonic::Sec => self.set_flag(FLAG_C, true),
            Mnemonic::Cld => self.set_flag(FLAG_D, false),
            Mnemonic::Sed => self.set_flag(FLAG_D, true),
            Mnemonic::Cli => self.set_flag(FLAG_I, false),
            Mnemonic::Sei => self.set_flag(FLAG_I, true),
            Mnemonic::Clv => self.set_flag(FLAG_V, false),
            Mnemonic::Tax => {
                self.regs.x = self.regs.a;
                self.set_nz(self.regs.x);
            }
            Mnemonic::Tay => {
                self.regs.y = self.regs.a;
                self.set_nz(self.regs.y);
            }
            Mnemonic::Txa => {
                self.regs.a = self.regs.x;
                self.set_nz(self.regs.a);
            }
            Mnemonic::Tya => {
                self.regs.a = self.regs.y;
                self.set_nz(self.regs.a);
            }
            Mnemonic::Tsx => {
                self.regs.x = self.regs.s;
                self.set_nz(self.regs.x);
            }
            Mnemonic::Txs => self.regs.s = self.regs.x,
            Mnemonic::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.set_nz(self.regs.x);
            }
            Mnemonic::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.set_nz(self.regs.y);
            }
            Mnemonic::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.set_nz(self.regs.x);
            }
            Mnemonic::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.set_nz(self.regs.y);
            }
            Mnemonic::Nop => {}
            other => unreachable!("{} is not a two-cycle implied instruction", other),
        }
    }

    fn read_modify_write<B: MemoryBus>(&mut self, bus: &mut B, mnemonic: Mnemonic, mode: AddressingMode) {
        if mode == AddressingMode::Accumulator {
            self.dummy_read_pc(bus);
            self.regs.a = self.modify(mnemonic, self.regs.a);
            return;
        }
        let address = self.effective_address(bus, mode, true);
        let value = self.read(bus, address, AccessKind::Data);
        // NMOS parts write the unmodified value back before the result
        self.write(bus, address, value, AccessKind::Dummy);
        let result = self.modify(mnemonic, value);
        self.write(bus, address, result, AccessKind::Data);
    }

    fn modify(&mut self, mnemonic: Mnemonic, value: u8) -> u8 {
        let carry_in = self.flag(FLAG_C) as u8;
        let result = match mnemonic {
            Mnemonic::Asl => {
                self.set_flag(FLAG_C, value & 0x80 != 0);
                value << 1
            }
            Mnemonic::Lsr => {
                self.set_flag(FLAG_C, value & 0x01 != 0);
                value >> 1
            }
            Mnemonic::Rol => {
                self.set_flag(FLAG_C, value & 0x80 != 0);
                (value << 1) | carry_in
            }
            Mnemonic::Ror => {
                self.set_flag(FLAG_C, value & 0x01 != 0);
                (value >> 1) | (carry_in << 7)
            }
            Mnemonic::Inc => value.wrapping_add(1),
            Mnemonic::Dec => value.wrapping_sub(1),
            other => unreachable!("{} is not a read-modify-write instruction", other),
        };
        self.set_nz(result);
        result
    }

    fn branch<B: MemoryBus>(&mut self, bus: &mut B, taken: bool) {
        let displacement = self.fetch_operand(bus) as i8;
        if !taken {
            return;
        }
        self.dummy_read_pc(bus);
        let target = self.regs.pc.wrapping_add(displacement as i16 as u16);
        if (target & 0xFF00) != (self.regs.pc & 0xFF00) {
            let partial = (self.regs.pc & 0xFF00) | (target & 0x00FF);
            self.read(bus, partial, AccessKind::Dummy);
        }
        self.regs.pc = target;
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_C, register >= value);
        self.set_nz(register.wrapping_sub(value));
    }

    fn add_with_carry(&mut self, value: u8) {
        let a = self.regs.a;
        let carry = self.flag(FLAG_C) as u16;
        let binary = a as u16 + value as u16 + carry;

        if !self.flag(FLAG_D) {
            let result = binary as u8;
            self.set_flag(FLAG_C, binary > 0xFF);
            self.set_flag(FLAG_V, (!(a ^ value) & (a ^ result) & 0x80) != 0);
            self.set_nz(result);
            self.regs.a = result;
            return;
        }

        // NMOS decimal mode: Z from the binary sum, N and V from the half-adjusted sum
        let mut lo = (a & 0x0F) as u16 + (value & 0x0F) as u16 + carry;
        let mut hi = (a >> 4) as u16 + (value >> 4) as u16;
        if lo > 9 {
            lo += 6;
        }
        if lo > 0x0F {
            hi += 1;
        }
        let intermediate = ((hi << 4) | (lo & 0x0F)) as u8;
        self.set_flag(FLAG_Z, binary as u8 == 0);
        self.set_flag(FLAG_N, intermediate & 0x80 != 0);
        self.set_flag(FLAG_V, (!(a ^ value) & (a ^ intermediate) & 0x80) != 0);
        if hi > 9 {
            hi += 6;
        }
        self.set_flag(FLAG_C, hi > 0x0F);
        self.regs.a = ((hi << 4) | (lo & 0x0F)) as u8;
    }

    fn subtract_with_borrow(&mut self, value: u8) {
        let a = self.regs.a;
        let borrow = 1 - self.flag(FLAG_C) as i16;
        let binary = a as i16 - value as i16 - borrow;
        let result = binary as u8;

        // Flags are those of the binary subtraction in both modes
        self.set_flag(FLAG_C, binary >= 0);
        self.set_flag(FLAG_V, ((a ^ value) & (a ^ result) & 0x80) != 0);
        self.set_nz(result);

        if !self.flag(FLAG_D) {
            self.regs.a = result;
            return;
        }

        let mut lo = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
        let mut hi = (a >> 4) as i16 - (value >> 4) as i16;
        if lo < 0 {
            lo -= 6;
            hi -= 1;
        }
        if hi < 0 {
            hi -= 6;
        }
        self.regs.a = (((hi << 4) as u8) & 0xF0) | (lo as u8 & 0x0F);
    }
}

#[cfg(test)]
#[path = "cpu_tests.rs"]
mod tests;
