#[cfg(test)]
mod cpu_tests {
    use crate::cpu::*;
    use test_log::test;

    /// Bus that records every access so cycle behaviour can be checked
    struct RecordingBus {
        ram: Ram,
        accesses: Vec<(u16, bool, AccessKind)>,
    }

    impl RecordingBus {
        fn with_program(address: u16, program: &[u8]) -> Self {
            let mut ram = Ram::new();
            ram.load(address, program);
            RecordingBus {
                ram,
                accesses: Vec::new(),
            }
        }
    }

    impl MemoryBus for RecordingBus {
        fn read(&mut self, address: u16) -> u8 {
            self.ram.read(address)
        }

        fn write(&mut self, address: u16, value: u8) {
            self.ram.write(address, value)
        }

        fn read_as(&mut self, address: u16, kind: AccessKind) -> u8 {
            self.accesses.push((address, false, kind));
            self.ram.read(address)
        }

        fn write_as(&mut self, address: u16, value: u8, kind: AccessKind) {
            self.accesses.push((address, true, kind));
            self.ram.write(address, value)
        }
    }

    fn cpu_at(pc: u16) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.set_pc(pc);
        cpu
    }

    #[test]
    fn test_load_store_absolute() {
        // LDA #$42 ; STA $1234
        let mut bus = RecordingBus::with_program(0x0600, &[0xA9, 0x42, 0x8D, 0x34, 0x12]);
        let mut cpu = cpu_at(0x0600);

        let lda = cpu.step(&mut bus).unwrap();
        assert_eq!(lda.cycles, 2);
        assert_eq!(cpu.regs.a, 0x42);
        assert!(!cpu.flag(FLAG_Z));

        let sta = cpu.step(&mut bus).unwrap();
        assert_eq!(sta.cycles, 4);
        assert_eq!(bus.ram.peek(0x1234), 0x42);
        assert_eq!(cpu.regs.pc, 0x0605);
        assert_eq!(bus.accesses.len(), 6);
        assert_eq!(bus.accesses[5], (0x1234, true, AccessKind::Data));
    }

    #[test]
    fn test_indexed_read_page_cross_costs_a_cycle() {
        // LDX #$10 ; LDA $12F8,X
        let mut bus = RecordingBus::with_program(0x0600, &[0xA2, 0x10, 0xBD, 0xF8, 0x12]);
        bus.ram.write(0x1308, 0x99);
        let mut cpu = cpu_at(0x0600);
        cpu.step(&mut bus).unwrap();
        let info = cpu.step(&mut bus).unwrap();
        assert_eq!(info.cycles, 5);
        assert_eq!(cpu.regs.a, 0x99);
        // Un-carried address is read first
        assert_eq!(bus.accesses[5], (0x1208, false, AccessKind::Dummy));
    }

    #[test]
    fn test_indexed_store_always_costs_fixup() {
        // STA $1200,Y with Y=0 still takes five cycles
        let mut bus = RecordingBus::with_program(0x0600, &[0x99, 0x00, 0x12]);
        let mut cpu = cpu_at(0x0600);
        let info = cpu.step(&mut bus).unwrap();
        assert_eq!(info.cycles, 5);
    }

    #[test]
    fn test_read_modify_write_writes_twice() {
        // INC $80
        let mut bus = RecordingBus::with_program(0x0600, &[0xE6, 0x80]);
        bus.ram.write(0x80, 0x7F);
        let mut cpu = cpu_at(0x0600);
        let info = cpu.step(&mut bus).unwrap();
        assert_eq!(info.cycles, 5);
        assert_eq!(bus.ram.peek(0x80), 0x80);
        assert!(cpu.flag(FLAG_N));
        let writes: Vec<_> = bus.accesses.iter().filter(|a| a.1).collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].2, AccessKind::Dummy);
        assert_eq!(writes[1].2, AccessKind::Data);
    }

    #[test]
    fn test_branch_timing() {
        // LDA #$00 ; BEQ +2 (taken, same page) ; NOP ; NOP
        let mut bus = RecordingBus::with_program(0x0600, &[0xA9, 0x00, 0xF0, 0x01, 0xEA, 0xEA]);
        let mut cpu = cpu_at(0x0600);
        cpu.step(&mut bus).unwrap();
        let info = cpu.step(&mut bus).unwrap();
        assert_eq!(info.cycles, 3);
        assert_eq!(cpu.regs.pc, 0x0605);

        // BNE not taken
        let mut bus = RecordingBus::with_program(0x0600, &[0xA9, 0x00, 0xD0, 0x10]);
        let mut cpu = cpu_at(0x0600);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 2);
        assert_eq!(cpu.regs.pc, 0x0604);

        // Taken across a page boundary: $06FD + 2 + $10 -> $070F
        // BPL +$10
        let mut bus = RecordingBus::with_program(0x06FD, &[0x10, 0x10]);
        let mut cpu = cpu_at(0x06FD);
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 4);
        assert_eq!(cpu.regs.pc, 0x070F);
    }

    #[test]
    fn test_jsr_rts_round_trip() {
        // $0600: JSR $0610 ; $0603: NOP ; $0610: RTS
        let mut bus = RecordingBus::with_program(0x0600, &[0x20, 0x10, 0x06, 0xEA]);
        bus.ram.load(0x0610, &[0x60]);
        let mut cpu = cpu_at(0x0600);

        let jsr = cpu.step(&mut bus).unwrap();
        assert_eq!(jsr.cycles, 6);
        assert_eq!(cpu.regs.pc, 0x0610);
        assert_eq!(cpu.regs.s, 0xFB);
        // Return address minus one is pushed high byte first
        assert_eq!(bus.ram.peek(0x01FD), 0x06);
        assert_eq!(bus.ram.peek(0x01FC), 0x02);

        let rts = cpu.step(&mut bus).unwrap();
        assert_eq!(rts.cycles, 6);
        assert_eq!(cpu.regs.pc, 0x0603);
        assert_eq!(cpu.regs.s, 0xFD);
    }

    #[test]
    fn test_jmp_indirect_page_wrap_bug() {
        // JMP ($02FF) reads the high byte from $0200
        let mut bus = RecordingBus::with_program(0x0600, &[0x6C, 0xFF, 0x02]);
        bus.ram.write(0x02FF, 0x34);
        bus.ram.write(0x0200, 0x12);
        bus.ram.write(0x0300, 0x56);
        let mut cpu = cpu_at(0x0600);
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 5);
        assert_eq!(cpu.regs.pc, 0x1234);
    }

    #[test]
    fn test_indirect_indexed_load() {
        // LDY #$04 ; LDA ($80),Y with ($80) = $2000
        let mut bus = RecordingBus::with_program(0x0600, &[0xA0, 0x04, 0xB1, 0x80]);
        bus.ram.write(0x80, 0x00);
        bus.ram.write(0x81, 0x20);
        bus.ram.write(0x2004, 0x77);
        let mut cpu = cpu_at(0x0600);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 5);
        assert_eq!(cpu.regs.a, 0x77);
        let pointer_reads = bus
            .accesses
            .iter()
            .filter(|a| a.2 == AccessKind::Pointer)
            .count();
        assert_eq!(pointer_reads, 2);
    }

    #[test]
    fn test_adc_binary_and_decimal() {
        // CLC ; LDA #$50 ; ADC #$50  -> $A0, V set
        let mut bus = RecordingBus::with_program(0x0600, &[0x18, 0xA9, 0x50, 0x69, 0x50]);
        let mut cpu = cpu_at(0x0600);
        for _ in 0..3 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.a, 0xA0);
        assert!(cpu.flag(FLAG_V));
        assert!(!cpu.flag(FLAG_C));

        // SED ; CLC ; LDA #$19 ; ADC #$28 -> $47 BCD
        let mut bus =
            RecordingBus::with_program(0x0600, &[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x28]);
        let mut cpu = cpu_at(0x0600);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.a, 0x47);
        assert!(!cpu.flag(FLAG_C));

        // SED ; SEC ; LDA #$99 ; ADC #$01 -> $01 with carry
        let mut bus =
            RecordingBus::with_program(0x0600, &[0xF8, 0x38, 0xA9, 0x99, 0x69, 0x01]);
        let mut cpu = cpu_at(0x0600);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.a, 0x01);
        assert!(cpu.flag(FLAG_C));
    }

    #[test]
    fn test_sbc_decimal() {
        // SED ; SEC ; LDA #$42 ; SBC #$13 -> $29
        let mut bus =
            RecordingBus::with_program(0x0600, &[0xF8, 0x38, 0xA9, 0x42, 0xE9, 0x13]);
        let mut cpu = cpu_at(0x0600);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.regs.a, 0x29);
        assert!(cpu.flag(FLAG_C));
    }

    #[test]
    fn test_stack_push_pull() {
        // LDA #$C3 ; PHA ; LDA #$00 ; PLA
        let mut bus =
            RecordingBus::with_program(0x0600, &[0xA9, 0xC3, 0x48, 0xA9, 0x00, 0x68]);
        let mut cpu = cpu_at(0x0600);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 3);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 4);
        assert_eq!(cpu.regs.a, 0xC3);
        assert!(cpu.flag(FLAG_N));
        assert_eq!(cpu.regs.s, 0xFD);
    }

    #[test]
    fn test_unassigned_opcode_jams() {
        let mut bus = RecordingBus::with_program(0x0600, &[0x02]);
        let mut cpu = cpu_at(0x0600);
        let info = cpu.step(&mut bus).unwrap();
        assert_eq!(info.mnemonic, None);
        assert!(cpu.is_jammed());
        assert_eq!(
            cpu.step(&mut bus),
            Err(crate::error::CpuError::Jammed {
                pc: 0x0600,
                opcode: 0x02
            })
        );

        cpu.reset();
        assert_eq!(cpu.state(), CpuState::Running);
        assert_eq!(cpu.cycles(), 0);
    }

    #[test]
    fn test_brk_vectors_through_fffe() {
        let mut bus = RecordingBus::with_program(0x0600, &[0x00]);
        bus.ram.write(0xFFFE, 0x00);
        bus.ram.write(0xFFFF, 0x80);
        let mut cpu = cpu_at(0x0600);
        assert_eq!(cpu.step(&mut bus).unwrap().cycles, 7);
        assert_eq!(cpu.regs.pc, 0x8000);
        assert!(cpu.flag(FLAG_I));
        // Pushed status has B set
        assert_eq!(bus.ram.peek(0x01FB) & FLAG_B, FLAG_B);
    }

    #[test]
    fn test_accesses_equal_cycles_for_every_opcode() {
        for opcode in 0..=255u8 {
            let info = match crate::opcode_tables::lookup(opcode) {
                Some(info) => info,
                None => continue,
            };
            let mut bus = RecordingBus::with_program(0x0600, &[opcode, 0x10, 0x20]);
            let mut cpu = cpu_at(0x0600);
            let step = cpu.step(&mut bus).unwrap();
            assert_eq!(step.cycles as usize, bus.accesses.len(), "opcode {:02x}", opcode);
            assert!(
                step.cycles >= info.cycles as u32,
                "opcode {:02x} took {} cycles, table says {}",
                opcode,
                step.cycles,
                info.cycles
            );
        }
    }
}
