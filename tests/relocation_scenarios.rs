//! End-to-end relocation of small assembled programs
//!
//! Each test assembles a program, relocates it through the public engine and
//! checks the produced bytes. Where behaviour matters more than bytes, both
//! images are run on the CPU and their register state and external writes are
//! compared.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relo6502::assembler::{Assembler, Assembly};
use relo6502::diagnostics::Level;
use relo6502::expr::Expr;
use relo6502::relocator::EngineState;
use relo6502::tracer::{TraceRun, Tracer};
use relo6502::zeropage::ZpAllocator;
use relo6502::{ProgramImage, RamZpRange, RelocationError, RelocationErrorKind, RelocationTarget, Relocator};
use test_log::test;

const BUDGET: u64 = 100_000;

fn to_2000() -> RelocationTarget {
    RelocationTarget::new(0x2000, RamZpRange::new(0x80, 0x10))
}

fn relocate(assembly: &Assembly, target: RelocationTarget) -> Result<Vec<u8>, RelocationError> {
    let origin = assembly.image.origin();
    Relocator::new().relocate(&assembly.image, &[origin], target, BUDGET)
}

fn run(image: &ProgramImage, entry: u16) -> TraceRun {
    Tracer::new().run(image, entry, BUDGET)
}

fn assert_same_behaviour(original: &ProgramImage, relocated: &ProgramImage) {
    assert_same_behaviour_from(original, relocated, 0);
}

/// Both images, entered `entry_offset` bytes in, must end in the same
/// register state and write the same values to the same addresses outside
/// code and page zero
fn assert_same_behaviour_from(original: &ProgramImage, relocated: &ProgramImage, entry_offset: u16) {
    let before = run(original, original.origin() + entry_offset);
    let after = run(relocated, relocated.origin() + entry_offset);

    assert_eq!(before.outcome, after.outcome);
    let (a, b) = (before.final_registers, after.final_registers);
    assert_eq!((a.a, a.x, a.y, a.s, a.p), (b.a, b.x, b.y, b.s, b.p));

    let writes_before: Vec<(u16, u8)> = before
        .external_writes(original.address_range(), 0..0x100)
        .collect();
    let writes_after: Vec<(u16, u8)> = after
        .external_writes(relocated.address_range(), 0..0x100)
        .collect();
    assert_eq!(writes_before, writes_after);
}

/// LDA dataHi; STA mod+2; mod: LDA $00xx; RTS; data; dataHi
fn high_byte_patch() -> Assembly {
    let mut asm = Assembler::new(0xC000);
    asm.lda_abs("dataHi")
        .sta_abs(Expr::label("mod") + 2)
        .label("mod")
        .lda_abs(Expr::label("data").lo())
        .sta_abs(0x0400u16)
        .rts()
        .label("data")
        .byte(0x42u8)
        .label("dataHi")
        .byte(Expr::label("data").hi());
    asm.end().unwrap()
}

/// Copies a table through a zero-page pointer with (zp),Y
fn pointer_copy(table: &[u8]) -> Assembly {
    let mut asm = Assembler::new(0xC000);
    asm.lda_imm(Expr::label("table").lo())
        .sta_zp(0x80u8)
        .lda_imm(Expr::label("table").hi())
        .sta_zp(0x81u8)
        .ldy_imm(0x00u8)
        .label("loop")
        .lda_indy(0x80u8)
        .sta_absy(0x0300u16)
        .iny()
        .cpy_imm(table.len() as u8)
        .bne("loop")
        .rts()
        .label("table")
        .bytes(table);
    asm.end().unwrap()
}

/// Copies a table with absolute,X addressing
fn indexed_copy(table: &[u8]) -> Assembly {
    let mut asm = Assembler::new(0xC000);
    asm.ldx_imm(0x00u8)
        .label("loop")
        .lda_absx("table")
        .sta_absx(0x0300u16)
        .sta_zp(0x20u8)
        .inx()
        .cpx_imm(table.len() as u8)
        .bne("loop")
        .rts()
        .label("table")
        .bytes(table);
    asm.end().unwrap()
}

fn random_payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

#[test]
fn test_absolute_and_zero_page_operands_move() {
    let mut asm = Assembler::new(0xC000);
    asm.lda_abs("value").sta_zp(0x10u8).rts().label("value").byte(0x5Au8);
    let assembly = asm.end().unwrap();

    let relocated = relocate(&assembly, to_2000()).unwrap();
    // Absolute operand shifted into the new segment, $10 remapped into the
    // window, RTS and data untouched
    assert_eq!(relocated, vec![0xAD, 0x04, 0x20, 0x85, 0x80, 0x60, 0x5A]);

    let moved = ProgramImage::new(relocated, 0x2000).unwrap();
    assert_same_behaviour(&assembly.image, &moved);
    assert_eq!(run(&moved, 0x2000).final_registers.a, 0x5A);
}

#[test]
fn test_self_modified_high_byte_follows_the_data() {
    let assembly = high_byte_patch();
    let data_hi = assembly.address_of("dataHi").unwrap();
    let data_hi_offset = assembly.image.offset_of(data_hi).unwrap();

    let mut relocator = Relocator::new();
    let relocated = relocator
        .relocate(&assembly.image, &[0xC000], to_2000(), BUDGET)
        .unwrap();

    let new_data = assembly.address_of("data").unwrap() - 0xC000 + 0x2000;
    assert_eq!(relocated[data_hi_offset], (new_data >> 8) as u8);
    // Low half of the modified operand now names the relocated data byte;
    // the high half is rewritten at run time and keeps its image value
    assert_eq!(&relocated[7..9], &[new_data as u8, 0x00]);

    let map = relocator.relocation_map().unwrap();
    assert_eq!(map.sites.len(), 1);
    assert_eq!(map.fragment_count(), 1);

    let moved = ProgramImage::new(relocated, 0x2000).unwrap();
    assert_same_behaviour(&assembly.image, &moved);
    assert_eq!(run(&moved, 0x2000).final_registers.a, 0x42);
}

#[test]
fn test_store_from_another_register_than_the_last_equal_load() {
    // X is loaded with the same value as dataHi after A, and A is stored
    let mut asm = Assembler::new(0xC000);
    asm.lda_abs("dataHi")
        .ldx_imm(0xC0u8)
        .sta_abs(Expr::label("mod") + 2)
        .label("mod")
        .lda_abs(Expr::label("data").lo())
        .rts()
        .label("data")
        .byte(0x42u8)
        .label("dataHi")
        .byte(Expr::label("data").hi());
    let assembly = asm.end().unwrap();

    let relocated = relocate(&assembly, to_2000()).unwrap();
    assert_eq!(
        relocated,
        vec![0xAD, 0x0D, 0x20, 0xA2, 0xC0, 0x8D, 0x0A, 0x20, 0xAD, 0x0C, 0x00, 0x60, 0x42, 0x20]
    );

    let moved = ProgramImage::new(relocated, 0x2000).unwrap();
    assert_same_behaviour(&assembly.image, &moved);
    let after = run(&moved, 0x2000).final_registers;
    assert_eq!((after.a, after.x), (0x42, 0xC0));
}

#[test]
fn test_indexed_table_addressed_from_before_the_image() {
    let table = random_payload(7, 12);
    let mut asm = Assembler::new(0xC000);
    asm.label("table")
        .bytes(&table)
        .label("start")
        .ldx_imm(table.len() as u8)
        .label("loop")
        .lda_absx(Expr::label("table") - 1)
        .sta_absx(0x02FFu16)
        .dex()
        .bne("loop")
        .rts();
    let assembly = asm.end().unwrap();
    let start = assembly.address_of("start").unwrap();

    let mut relocator = Relocator::new();
    let relocated = relocator
        .relocate(&assembly.image, &[start], to_2000(), BUDGET)
        .unwrap();
    // LDA table-1,X now names $1FFF
    let operand = table.len() + 3;
    assert_eq!(&relocated[operand..operand + 2], &[0xFF, 0x1F]);
    assert_eq!(relocator.relocation_map().unwrap().indexed_operands.len(), 1);

    let moved = ProgramImage::new(relocated, 0x2000).unwrap();
    assert_same_behaviour_from(&assembly.image, &moved, start - 0xC000);

    let copied: Vec<u8> = run(&moved, 0x2000 + (start - 0xC000))
        .external_writes(moved.address_range(), 0..0x100)
        .map(|(_, value)| value)
        .collect();
    let mut expected = table.clone();
    expected.reverse();
    assert_eq!(copied, expected);
}

#[test]
fn test_pointer_table_relocates() {
    let table = random_payload(11, 8);
    let assembly = pointer_copy(&table);

    let relocated = relocate(&assembly, to_2000()).unwrap();
    let moved = ProgramImage::new(relocated, 0x2000).unwrap();
    assert_same_behaviour(&assembly.image, &moved);

    let after = run(&moved, 0x2000);
    let copied: Vec<u8> = after
        .external_writes(moved.address_range(), 0..0x100)
        .map(|(_, value)| value)
        .collect();
    assert_eq!(copied, table);
}

#[test]
fn test_zero_page_window_too_small() {
    let mut asm = Assembler::new(0xC000);
    for zp in 0x10u8..0x1B {
        asm.lda_zp(zp);
    }
    asm.rts();
    let assembly = asm.end().unwrap();

    let mut relocator = Relocator::new();
    let err = relocator
        .relocate(
            &assembly.image,
            &[0xC000],
            RelocationTarget::new(0x2000, RamZpRange::new(0x80, 2)),
            BUDGET,
        )
        .unwrap_err();

    assert_eq!(err.kind, RelocationErrorKind::ZeroPageWindowTooSmall);
    assert!(err.message.contains("requires 11"));
    assert!(err.message.contains("provides 2"));
    assert!(err.diagnostics.iter().any(|d| d.level == Level::Error));
    assert_eq!(relocator.state(), EngineState::Failed);
    assert!(relocator.relocation_map().is_none());
}

#[test]
fn test_timeout_is_a_warning() {
    let mut asm = Assembler::new(0xC000);
    asm.ldx_imm(0x00u8)
        .label("spin")
        .inx()
        .stx_zp(0x30u8)
        .jmp_abs("spin");
    let assembly = asm.end().unwrap();

    let mut relocator = Relocator::new();
    let relocated = relocator
        .relocate(&assembly.image, &[0xC000], to_2000(), 500)
        .unwrap();

    assert_eq!(relocated, vec![0xA2, 0x00, 0xE8, 0x86, 0x80, 0x4C, 0x02, 0x20]);
    assert!(relocator
        .diagnostics()
        .iter()
        .any(|d| d.level == Level::Warning && d.message.contains("timeout")));
    assert_eq!(relocator.state(), EngineState::Patched);
}

#[test]
fn test_relocation_is_deterministic() {
    let assembly = indexed_copy(&random_payload(42, 24));

    let mut first = Relocator::new();
    let mut second = Relocator::new();
    let a = first
        .relocate(&assembly.image, &[0xC000], to_2000(), BUDGET)
        .unwrap();
    let b = second
        .relocate(&assembly.image, &[0xC000], to_2000(), BUDGET)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(first.diagnostics(), second.diagnostics());

    // Again on the same engine after clearing its log
    first.clear_diagnostics();
    let c = first
        .relocate(&assembly.image, &[0xC000], to_2000(), BUDGET)
        .unwrap();
    assert_eq!(a, c);
    assert_eq!(first.diagnostics(), second.diagnostics());
}

#[test]
fn test_relocating_in_place_is_identity() {
    let in_place = RelocationTarget::new(0xC000, RamZpRange::new(0x80, 0x10));
    for seed in 0..4 {
        let payload = random_payload(seed, 16);
        for assembly in [pointer_copy(&payload), high_byte_patch()] {
            let relocated = relocate(&assembly, in_place).unwrap();
            assert_eq!(relocated, assembly.image.bytes());
        }
    }
}

#[test]
fn test_relocated_program_behaves_the_same() {
    let mut windows = ZpAllocator::new(RamZpRange::new(0xC0, 0x20));
    for (seed, code_base) in [(1, 0x1000u16), (2, 0x2000), (3, 0x8000), (4, 0xE000)] {
        let assembly = indexed_copy(&random_payload(seed, 32));
        let window = windows.alloc(0x08).unwrap();
        let target = RelocationTarget::new(code_base, window);

        let mut relocator = Relocator::new();
        let relocated = relocator
            .relocate(&assembly.image, &[0xC000], target, BUDGET)
            .unwrap();
        let map = relocator.relocation_map().unwrap();

        // Every in-image absolute operand now points into the new segment
        for (offset, role) in map.roles.iter().enumerate() {
            if let relo6502::analyzer::ByteRole::OperandLow(_) = role {
                let before = u16::from_le_bytes([
                    assembly.image.bytes()[offset],
                    assembly.image.bytes()[offset + 1],
                ]);
                let after = u16::from_le_bytes([relocated[offset], relocated[offset + 1]]);
                if assembly.image.contains_address(before) {
                    assert!(map.contains_relocated(after));
                } else {
                    assert_eq!(before, after);
                }
            }
        }

        // The zero-page map never merges two addresses
        let mut targets: Vec<u8> = map.zp_map.values().copied().collect();
        targets.sort_unstable();
        targets.dedup();
        assert_eq!(targets.len(), map.zp_map.len());

        assert_eq!(map.translate_zero_page(0x20), Some(window.base));

        let moved = ProgramImage::new(relocated, code_base).unwrap();
        assert_same_behaviour(&assembly.image, &moved);
    }
    assert_eq!(windows.remaining(), 0);
}

#[test]
fn test_engine_state_and_map_text() {
    let assembly = high_byte_patch();
    let mut relocator = Relocator::new();
    assert_eq!(relocator.state(), EngineState::Idle);

    let mut text = String::new();
    relocator.format_relocation_map(&mut text).unwrap();
    assert_eq!(text, "No relocation map (idle)\n");

    relocator
        .relocate(&assembly.image, &[0xC000], to_2000(), BUDGET)
        .unwrap();
    assert_eq!(relocator.state(), EngineState::Patched);

    text.clear();
    relocator.format_relocation_map(&mut text).unwrap();
    assert!(text.starts_with("Code: $C000-$C00E -> $2000 (delta -40960)"));
    assert!(text.contains("Address fragments: 1"));
    assert!(text.contains("Runtime operands: 1"));

    assert!(!relocator.diagnostics().is_empty());
    relocator.clear_diagnostics();
    assert!(relocator.diagnostics().is_empty());
}

#[test]
fn test_invalid_targets_are_rejected() {
    let assembly = high_byte_patch();
    let mut relocator = Relocator::new();

    let err = relocator
        .relocate(&assembly.image, &[0xD000], to_2000(), BUDGET)
        .unwrap_err();
    assert_eq!(err.kind, RelocationErrorKind::InvalidTarget);
    assert_eq!(relocator.state(), EngineState::Failed);

    let err = relocator
        .relocate(
            &assembly.image,
            &[0xC000],
            RelocationTarget::new(0x2000, RamZpRange::new(0xF8, 0x10)),
            BUDGET,
        )
        .unwrap_err();
    assert_eq!(err.kind, RelocationErrorKind::InvalidTarget);

    let err = relocator
        .relocate(&assembly.image, &[0xC000], RelocationTarget::new(0xFFF8, RamZpRange::new(0x80, 0x10)), BUDGET)
        .unwrap_err();
    assert_eq!(err.kind, RelocationErrorKind::AddressOutOfRange);
    // No partial output survives a failure
    assert!(relocator.relocation_map().is_none());
}

#[test]
fn test_unfinished_assembly_surfaces_unresolved_label() {
    let mut asm = Assembler::new(0xC000);
    asm.jmp_abs("nowhere");
    let err: RelocationError = asm.end().unwrap_err().into();
    assert_eq!(err.kind, RelocationErrorKind::UnresolvedLabel);
}
