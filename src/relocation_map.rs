use crate::analyzer::{ByteRole, FragmentKind, RuntimeOperand, SelfModifyingSite};
use crate::image::RamZpRange;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::fmt;

/// New value for one address-fragment data byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentFixup {
    pub offset: usize,
    pub kind: FragmentKind,
    pub describes: u16,
    pub new_value: u8,
}

/// Everything needed to rewrite one image for its new location
#[derive(Debug, Clone)]
pub struct RelocationMap {
    pub origin: u16,
    pub length: usize,
    pub code_base: u16,
    /// `code_base - origin`
    pub code_delta: i32,
    pub zp_window: RamZpRange,
    /// Old to new zero-page address, in order of first appearance
    pub zp_map: IndexMap<u8, u8>,
    pub fragment_fixups: Vec<FragmentFixup>,
    pub roles: Vec<ByteRole>,
    /// Absolute operands rewritten at run time, by instruction offset
    pub runtime_operands: IndexMap<usize, RuntimeOperand>,
    /// Absolute-indexed instructions whose base lies outside the image but
    /// whose every traced access lands inside it; their operands move with
    /// the code
    pub indexed_operands: IndexSet<usize>,
    pub sites: Vec<SelfModifyingSite>,
}

impl RelocationMap {
    pub fn contains_original(&self, address: u16) -> bool {
        let start = self.origin as u32;
        (start..start + self.length as u32).contains(&(address as u32))
    }

    pub fn contains_relocated(&self, address: u16) -> bool {
        let start = self.code_base as u32;
        (start..start + self.length as u32).contains(&(address as u32))
    }

    /// `address` moved by the code delta, if the result is still in memory
    pub fn shift_by_code_delta(&self, address: u16) -> Option<u16> {
        u16::try_from(address as i32 + self.code_delta).ok()
    }

    pub fn translate_zero_page(&self, zp: u8) -> Option<u8> {
        self.zp_map.get(&zp).copied()
    }

    /// Where `address` lives after relocation. Image addresses move by the
    /// code delta, `$00xx` addresses in the zero-page footprint follow the
    /// zero-page map, and everything else is external and stays put.
    pub fn relocate_address(&self, address: u16) -> u16 {
        if self.contains_original(address) {
            (address as i32 + self.code_delta) as u16
        } else if address < 0x100 {
            self.translate_zero_page(address as u8)
                .map(|zp| zp as u16)
                .unwrap_or(address)
        } else {
            address
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_fixups.len()
    }

    /// Human-readable dump: code delta, zero-page table, fragment fixups
    pub fn format(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Code: ${:04X}-${:04X} -> ${:04X} (delta {:+})",
            self.origin,
            (self.origin as u32 + self.length as u32).saturating_sub(1),
            self.code_base,
            self.code_delta
        )?;

        writeln!(out, "Zero page: {} entries into {}", self.zp_map.len(), self.zp_window)?;
        for (old, new) in &self.zp_map {
            writeln!(out, "  ${:02X} -> ${:02X}", old, new)?;
        }

        writeln!(out, "Address fragments: {}", self.fragment_fixups.len())?;
        for fixup in &self.fragment_fixups {
            writeln!(
                out,
                "  ${:04X}: {:?} half of ${:04X} -> ${:02X}",
                self.origin as u32 + fixup.offset as u32,
                fixup.kind,
                fixup.describes,
                fixup.new_value
            )?;
        }

        if !self.indexed_operands.is_empty() {
            writeln!(out, "Indexed operands moved with the code: {}", self.indexed_operands.len())?;
            for &instr in &self.indexed_operands {
                writeln!(out, "  ${:04X}", self.origin as u32 + instr as u32)?;
            }
        }

        if !self.runtime_operands.is_empty() {
            writeln!(out, "Runtime operands: {}", self.runtime_operands.len())?;
            for runtime in self.runtime_operands.values() {
                let written = match (runtime.written_low, runtime.written_high) {
                    (true, true) => "both halves",
                    (true, false) => "low half",
                    (false, true) => "high half",
                    (false, false) => "nothing",
                };
                writeln!(
                    out,
                    "  ${:04X}: ${:04X} -> ${:04X} ({} written at run time)",
                    self.origin as u32 + runtime.instruction_offset as u32,
                    runtime.primary(),
                    self.relocate_address(runtime.primary()),
                    written
                )?;
            }
        }
        Ok(())
    }

    pub fn report(&self) -> RelocationReport {
        RelocationReport {
            origin: self.origin,
            code_base: self.code_base,
            code_delta: self.code_delta,
            length: self.length,
            zp_window: self.zp_window.to_string(),
            self_modifying_sites: self.sites.len(),
            indexed_operands: self
                .indexed_operands
                .iter()
                .map(|&instr| (self.origin as u32 + instr as u32) as u16)
                .collect(),
            zero_page: self
                .zp_map
                .iter()
                .map(|(&from, &to)| ZpEntry { from, to })
                .collect(),
            fragment_fixups: self.fragment_fixups.clone(),
            runtime_operands: self.runtime_operands.values().cloned().collect(),
        }
    }
}

impl fmt::Display for RelocationMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.format(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZpEntry {
    pub from: u8,
    pub to: u8,
}

/// Serializable summary of a relocation map. The zero-page table is a list
/// because TOML tables need string keys.
#[derive(Debug, Clone, Serialize)]
pub struct RelocationReport {
    pub origin: u16,
    pub code_base: u16,
    pub code_delta: i32,
    pub length: usize,
    pub zp_window: String,
    pub self_modifying_sites: usize,
    pub indexed_operands: Vec<u16>,
    pub zero_page: Vec<ZpEntry>,
    pub fragment_fixups: Vec<FragmentFixup>,
    pub runtime_operands: Vec<RuntimeOperand>,
}
