//! Byte classification and construction of the relocation map.
//!
//! The analysis runs in four passes over one image:
//!
//! 1. a static decode from the entry points and every traced instruction
//!    address, assigning opcode and operand roles;
//! 2. a dynamic pass over traced writes into the image, which finds
//!    self-modified operands and follows each written value back to the
//!    image byte it was loaded from;
//! 3. a pass over executed indirect instructions, whose pointer bytes must
//!    likewise come from the image when they point into it;
//! 4. translation: the code delta, the zero-page map and the new value of
//!    every address fragment.
//!
//! Problems are collected, never raised eagerly, so one call reports every
//! offending byte.

use crate::cpu::AccessKind;
use crate::diagnostics::Diagnostics;
use crate::disassembler::Disassembler;
use crate::error::{AnalysisError, RelocationErrorKind};
use crate::image::{ProgramImage, RelocationTarget};
use crate::instruction::{AddressingMode, DecodeError, Instruction, Mnemonic, OperandClass};
use crate::opcode_tables;
use crate::relocation_map::{FragmentFixup, RelocationMap};
use crate::tracer::{ExecutionTrace, MemoryAccessEvent, RunOutcome, TraceRun};
use crate::zeropage::{build_zp_map, ZeroPageFootprint};
use bitvec::prelude::*;
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

// Bound on store/load hops when following a value through RAM
const MAX_PROVENANCE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FragmentKind {
    Low,
    High,
}

impl FragmentKind {
    /// This half of `address`
    pub fn of(&self, address: u16) -> u8 {
        match self {
            FragmentKind::Low => address as u8,
            FragmentKind::High => (address >> 8) as u8,
        }
    }
}

/// What one image byte is. Operand roles carry the offset of their instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteRole {
    Unclassified,
    Opcode,
    OperandLow(usize),
    OperandHigh(usize),
    ZeroPageOperand(usize),
    RelativeOperand(usize),
    ImmediateOperand(usize),
    /// Data byte holding one half of an address, consumed by self-modifying
    /// code or through a pointer
    AddressFragmentData { kind: FragmentKind, describes: u16 },
    PlainData,
}

impl ByteRole {
    /// Offset of the instruction this byte belongs to
    pub fn instruction_offset(&self) -> Option<usize> {
        match *self {
            ByteRole::OperandLow(i)
            | ByteRole::OperandHigh(i)
            | ByteRole::ZeroPageOperand(i)
            | ByteRole::RelativeOperand(i)
            | ByteRole::ImmediateOperand(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_code(&self) -> bool {
        !matches!(
            self,
            ByteRole::Unclassified | ByteRole::PlainData | ByteRole::AddressFragmentData { .. }
        )
    }
}

impl fmt::Display for ByteRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ByteRole::Unclassified => f.write_str("unclassified"),
            ByteRole::Opcode => f.write_str("opcode"),
            ByteRole::OperandLow(i) => write!(f, "operand low of {:#06x}", i),
            ByteRole::OperandHigh(i) => write!(f, "operand high of {:#06x}", i),
            ByteRole::ZeroPageOperand(i) => write!(f, "zero-page operand of {:#06x}", i),
            ByteRole::RelativeOperand(i) => write!(f, "relative operand of {:#06x}", i),
            ByteRole::ImmediateOperand(i) => write!(f, "immediate operand of {:#06x}", i),
            ByteRole::AddressFragmentData { kind, describes } => {
                write!(f, "{:?} fragment of ${:04X}", kind, describes)
            }
            ByteRole::PlainData => f.write_str("data"),
        }
    }
}

/// Where a value written into code came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ValueOrigin {
    /// Loaded from this image byte, possibly through RAM temporaries (`via`)
    ImageByte { offset: usize, via: Vec<u16> },
    /// The target operand does not depend on the load address
    Invariant,
    Untraced,
}

/// A traced write into an instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SelfModifyingSite {
    pub write_instruction_offset: Option<usize>,
    pub target_operand_offset: usize,
    pub written_value: u8,
    pub cycle: u64,
    pub value_origin: ValueOrigin,
}

impl SelfModifyingSite {
    pub fn write_source_offset(&self) -> Option<usize> {
        match self.value_origin {
            ValueOrigin::ImageByte { offset, .. } => Some(offset),
            _ => None,
        }
    }
}

/// An absolute operand rewritten at run time. Only the halves never written
/// keep meaning in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeOperand {
    pub instruction_offset: usize,
    /// Addresses the operand was observed to hold, first one first
    pub describes: Vec<u16>,
    pub written_low: bool,
    pub written_high: bool,
}

impl RuntimeOperand {
    pub fn primary(&self) -> u16 {
        self.describes[0]
    }
}

struct Analyzer<'a> {
    image: &'a ProgramImage,
    target: RelocationTarget,
    code_delta: i32,
    roles: Vec<ByteRole>,
    instructions: BTreeMap<usize, Instruction>,
    sites: Vec<SelfModifyingSite>,
    runtime_operands: IndexMap<usize, RuntimeOperand>,
    // Highest zero-page address reached by each indexed instruction
    spans: IndexMap<usize, u8>,
    // Absolute-indexed instructions with an external base: whether traced
    // accesses landed inside and outside the image
    indexed_reach: IndexMap<usize, (bool, bool)>,
    errors: Vec<AnalysisError>,
}

/// Classify every byte of `image` and build its relocation map
pub fn analyze(
    image: &ProgramImage,
    trace: &ExecutionTrace,
    entry_points: &[u16],
    target: RelocationTarget,
    diagnostics: &mut Diagnostics,
) -> Result<RelocationMap, Vec<AnalysisError>> {
    let mut analyzer = Analyzer::new(image, target);
    analyzer.check_target();
    analyzer.static_pass(entry_points, trace, diagnostics);
    if analyzer
        .errors
        .iter()
        .any(|e| e.kind == RelocationErrorKind::InvalidOpcodeEncountered)
    {
        return Err(analyzer.errors);
    }
    analyzer.dynamic_pass(trace, diagnostics);
    analyzer.pointer_pass(trace, diagnostics);
    analyzer.finish(diagnostics)
}

impl<'a> Analyzer<'a> {
    fn new(image: &'a ProgramImage, target: RelocationTarget) -> Self {
        Analyzer {
            image,
            target,
            code_delta: target.code_base as i32 - image.origin() as i32,
            roles: vec![ByteRole::Unclassified; image.len()],
            instructions: BTreeMap::new(),
            sites: Vec::new(),
            runtime_operands: IndexMap::new(),
            spans: IndexMap::new(),
            indexed_reach: IndexMap::new(),
            errors: Vec::new(),
        }
    }

    fn check_target(&mut self) {
        let end = self.target.code_base as u32 + self.image.len() as u32;
        if end > 0x10000 {
            self.errors.push(AnalysisError::new(
                RelocationErrorKind::AddressOutOfRange,
                None,
                format!(
                    "{} bytes at ${:04X} would end at ${:05X}, past $FFFF",
                    self.image.len(),
                    self.target.code_base,
                    end
                ),
            ));
        }
    }

    /// Address after translation by the code delta alone
    fn shift(&self, address: u16) -> u16 {
        if self.image.contains_address(address) {
            (address as i32 + self.code_delta) as u16
        } else {
            address
        }
    }

    fn claim(&mut self, offset: usize, role: ByteRole) {
        match self.roles[offset] {
            ByteRole::Unclassified => self.roles[offset] = role,
            existing if existing == role => {}
            existing => self.errors.push(AnalysisError::at(
                RelocationErrorKind::AmbiguousByteRole,
                offset,
                format!("byte is both {} and {}", existing, role),
            )),
        }
    }

    // Pass 1

    fn static_pass(
        &mut self,
        entry_points: &[u16],
        trace: &ExecutionTrace,
        diagnostics: &mut Diagnostics,
    ) {
        let mut roots: IndexSet<usize> = entry_points
            .iter()
            .filter_map(|&entry| self.image.offset_of(entry))
            .collect();
        roots.extend(
            trace
                .executed_addresses()
                .into_iter()
                .filter_map(|address| self.image.offset_of(address)),
        );
        if roots.is_empty() && !self.image.is_empty() {
            roots.insert(0);
        }

        let mut visited = bitvec![0; self.image.len()];
        let mut worklist: Vec<usize> = roots.into_iter().rev().collect();

        while let Some(offset) = worklist.pop() {
            if visited[offset] {
                continue;
            }
            visited.set(offset, true);

            if !matches!(self.roles[offset], ByteRole::Unclassified | ByteRole::Opcode) {
                self.errors.push(AnalysisError::at(
                    RelocationErrorKind::AmbiguousByteRole,
                    offset,
                    format!("control flow enters the {}", self.roles[offset]),
                ));
                continue;
            }

            let instruction = match Instruction::decode(self.image.bytes(), offset) {
                Ok(instruction) => instruction,
                Err(DecodeError::InvalidOpcode { opcode, .. }) => {
                    self.errors.push(AnalysisError::at(
                        RelocationErrorKind::InvalidOpcodeEncountered,
                        offset,
                        format!(
                            "unassigned opcode ${:02X} at ${:04X} on a reachable path",
                            opcode,
                            self.image.address_of(offset)
                        ),
                    ));
                    continue;
                }
                Err(e) => {
                    self.errors.push(AnalysisError::at(
                        RelocationErrorKind::InvalidOpcodeEncountered,
                        offset,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            self.claim_instruction(&instruction);
            let address = self.image.address_of(offset);

            if instruction.mnemonic.is_branch() {
                if let Some(target) = instruction.branch_target(address) {
                    match self.image.offset_of(target) {
                        Some(t) => worklist.push(t),
                        None => diagnostics.trace(format!(
                            "branch at ${:04X} leaves the image (${:04X})",
                            address, target
                        )),
                    }
                }
            }
            if matches!(instruction.mnemonic, Mnemonic::Jsr | Mnemonic::Jmp)
                && instruction.mode == AddressingMode::Absolute
            {
                if let Some(t) = self.image.offset_of(instruction.operand_value()) {
                    worklist.push(t);
                }
            }

            if !instruction.mnemonic.ends_flow() {
                let next = offset + instruction.size;
                if next < self.image.len() {
                    worklist.push(next);
                } else {
                    diagnostics.warning(format!(
                        "execution can fall off the end of the image after ${:04X}",
                        address
                    ));
                }
            }

            self.instructions.insert(offset, instruction);
        }

        let mut data_bytes = 0;
        for role in self.roles.iter_mut() {
            if *role == ByteRole::Unclassified {
                *role = ByteRole::PlainData;
                data_bytes += 1;
            }
        }
        diagnostics.trace(format!(
            "static pass: {} instructions, {} data bytes",
            self.instructions.len(),
            data_bytes
        ));
    }

    fn claim_instruction(&mut self, instruction: &Instruction) {
        let offset = instruction.offset;
        self.claim(offset, ByteRole::Opcode);

        let operands = instruction.operand_offsets();
        let class = instruction.operand_class();
        if class.is_absolute() {
            self.claim(operands.start, ByteRole::OperandLow(offset));
            self.claim(operands.start + 1, ByteRole::OperandHigh(offset));
        } else if class.is_zero_page() {
            self.claim(operands.start, ByteRole::ZeroPageOperand(offset));
        } else if class == OperandClass::Relative {
            self.claim(operands.start, ByteRole::RelativeOperand(offset));
        } else if class == OperandClass::Immediate {
            self.claim(operands.start, ByteRole::ImmediateOperand(offset));
        }
    }

    // Pass 2

    fn dynamic_pass(&mut self, trace: &ExecutionTrace, diagnostics: &mut Diagnostics) {
        let mut seen: IndexSet<SelfModifyingSite> = IndexSet::new();

        for run in &trace.runs {
            for (index, event) in run.events.iter().enumerate() {
                if !event.is_write() || event.kind == AccessKind::Dummy {
                    continue;
                }
                let Some(target) = self.image.offset_of(event.address) else {
                    continue;
                };

                let role = self.roles[target];
                let value_origin = match role {
                    ByteRole::ImmediateOperand(_) | ByteRole::RelativeOperand(_) => {
                        ValueOrigin::Invariant
                    }
                    _ => self.provenance(&run.events, index, event.value, 0, Vec::new()),
                };
                let site = SelfModifyingSite {
                    write_instruction_offset: event.instruction_offset,
                    target_operand_offset: target,
                    written_value: event.value,
                    cycle: event.cycle,
                    value_origin,
                };
                let key = SelfModifyingSite { cycle: 0, ..site.clone() };
                if !seen.insert(key) {
                    continue;
                }

                match role {
                    ByteRole::OperandLow(instr) => {
                        self.modified_operand(run, index, instr, FragmentKind::Low, &site, diagnostics)
                    }
                    ByteRole::OperandHigh(instr) => {
                        self.modified_operand(run, index, instr, FragmentKind::High, &site, diagnostics)
                    }
                    ByteRole::ImmediateOperand(_) | ByteRole::RelativeOperand(_) => {
                        diagnostics.info(format!(
                            "${:04X} writes ${:02X} into the {} at ${:04X}; value does not depend on the load address",
                            event.instruction_address,
                            event.value,
                            role,
                            event.address
                        ));
                    }
                    _ => self.errors.push(AnalysisError::at(
                        RelocationErrorKind::UnsupportedSelfModification,
                        target,
                        format!(
                            "${:04X} writes ${:02X} to ${:04X}, which is {}",
                            event.instruction_address, event.value, event.address, role
                        ),
                    )),
                }
                self.sites.push(site);
            }
        }
        debug!("dynamic pass: {} self-modifying sites", self.sites.len());
    }

    /// A write into one half of an absolute operand
    fn modified_operand(
        &mut self,
        run: &TraceRun,
        index: usize,
        instr: usize,
        half: FragmentKind,
        site: &SelfModifyingSite,
        diagnostics: &mut Diagnostics,
    ) {
        let target = site.target_operand_offset;
        let written = site.written_value;

        let described = match self.next_operand_fetch(run, index, instr) {
            Some((lo, hi)) => combine(half, written, lo, hi),
            None => {
                if run.outcome == RunOutcome::Timeout {
                    self.errors.push(AnalysisError::at(
                        RelocationErrorKind::TraceTimeout,
                        target,
                        format!(
                            "operand at ${:04X} was modified but the trace from ${:04X} ran out of cycles before it executed",
                            self.image.address_of(target),
                            run.entry_point
                        ),
                    ));
                    return;
                }
                let other_offset = match half {
                    FragmentKind::Low => target + 1,
                    FragmentKind::High => target - 1,
                };
                let other = self.memory_before(run, index, other_offset);
                combine(half, written, other, other)
            }
        };

        let entry = self
            .runtime_operands
            .entry(instr)
            .or_insert_with(|| RuntimeOperand {
                instruction_offset: instr,
                describes: Vec::new(),
                written_low: false,
                written_high: false,
            });
        match half {
            FragmentKind::Low => entry.written_low = true,
            FragmentKind::High => entry.written_high = true,
        }
        if !entry.describes.contains(&described) {
            entry.describes.push(described);
        }

        if !self.image.contains_address(described) {
            diagnostics.info(format!(
                "operand of ${:04X} rewritten to external address ${:04X}",
                self.image.address_of(instr),
                described
            ));
            return;
        }

        match &site.value_origin {
            ValueOrigin::ImageByte { offset, via } => {
                trace!(
                    "operand {:#06x} <- {:#06x} via {:?}: {:?} half of ${:04X}",
                    target,
                    offset,
                    via,
                    half,
                    described
                );
                self.promote(*offset, half, described, target);
            }
            _ => self.errors.push(AnalysisError::at(
                RelocationErrorKind::UnsupportedSelfModification,
                target,
                format!(
                    "value ${:02X} written to operand at ${:04X} cannot be traced to an address fragment in the image",
                    written,
                    self.image.address_of(target)
                ),
            )),
        }
    }

    /// Operand bytes fetched by the next execution of `instr` after event `index`
    fn next_operand_fetch(&self, run: &TraceRun, index: usize, instr: usize) -> Option<(u8, u8)> {
        let address = self.image.address_of(instr);
        let step = run
            .steps
            .iter()
            .find(|step| step.first_event > index && step.address == address)?;
        let mut fetches = run
            .step_events(step)
            .iter()
            .filter(|e| e.kind == AccessKind::OperandFetch)
            .map(|e| e.value);
        Some((fetches.next()?, fetches.next()?))
    }

    /// Content of an image byte just before event `index`
    fn memory_before(&self, run: &TraceRun, index: usize, offset: usize) -> u8 {
        let address = self.image.address_of(offset);
        run.events[..index]
            .iter()
            .rev()
            .find(|e| e.is_write() && e.address == address)
            .map(|e| e.value)
            .unwrap_or(self.image.bytes()[offset])
    }

    /// Follow `value`, stored at `events[store]`, back to the image byte it
    /// came from. The search walks back through the instructions that last
    /// set the stored register, across register transfers and RAM temporaries.
    fn provenance(
        &self,
        events: &[MemoryAccessEvent],
        store: usize,
        value: u8,
        depth: usize,
        mut via: Vec<u16>,
    ) -> ValueOrigin {
        if depth >= MAX_PROVENANCE_DEPTH {
            return ValueOrigin::Untraced;
        }
        let Some(mut end) = instruction_start(events, store) else {
            return ValueOrigin::Untraced;
        };
        let Some(mut register) = opcode_tables::lookup(events[end].value)
            .and_then(|info| Register::stored_by(info.mnemonic))
        else {
            return ValueOrigin::Untraced;
        };

        while let Some(begin) = instruction_start(events, end.wrapping_sub(1)) {
            let Some(info) = opcode_tables::lookup(events[begin].value) else {
                return ValueOrigin::Untraced;
            };
            let range = begin..end;
            end = begin;

            match register.set_by(info.mnemonic, info.mode) {
                RegisterEffect::Unchanged => {}
                RegisterEffect::Transfer(from) => register = from,
                RegisterEffect::Computed => return ValueOrigin::Untraced,
                RegisterEffect::Load => {
                    let source = if info.mode == AddressingMode::Immediate {
                        range.clone().find(|&i| events[i].kind == AccessKind::OperandFetch)
                    } else {
                        range.clone().rev().find(|&i| {
                            events[i].is_read()
                                && matches!(events[i].kind, AccessKind::Data | AccessKind::Stack)
                        })
                    };
                    let Some(j) = source.filter(|&j| events[j].value == value) else {
                        return ValueOrigin::Untraced;
                    };
                    let read = &events[j];

                    if let Some(offset) = self.image.offset_of(read.address) {
                        let accepted = read.kind != AccessKind::OperandFetch
                            || matches!(
                                self.roles[offset],
                                ByteRole::ImmediateOperand(_) | ByteRole::AddressFragmentData { .. }
                            );
                        return if accepted {
                            ValueOrigin::ImageByte { offset, via }
                        } else {
                            ValueOrigin::Untraced
                        };
                    }
                    // Through a RAM temporary: continue from the store that filled it
                    let filled = events[..j].iter().rposition(|w| {
                        w.is_write() && w.address == read.address && w.kind != AccessKind::Dummy
                    });
                    return match filled {
                        Some(k) if events[k].value == value => {
                            via.push(read.address);
                            self.provenance(events, k, value, depth + 1, via)
                        }
                        _ => ValueOrigin::Untraced,
                    };
                }
            }
        }
        ValueOrigin::Untraced
    }

    /// Turn the source byte of a traced value into an address fragment
    fn promote(&mut self, offset: usize, kind: FragmentKind, describes: u16, consumer: usize) {
        let fragment = ByteRole::AddressFragmentData { kind, describes };
        match self.roles[offset] {
            ByteRole::PlainData | ByteRole::ImmediateOperand(_) => self.roles[offset] = fragment,
            existing if existing == fragment => {}
            ByteRole::AddressFragmentData {
                kind: other_kind,
                describes: other,
            } => {
                // Two readings agree if they relocate to the same byte
                if kind.of(self.shift(describes)) != other_kind.of(self.shift(other))
                    || kind.of(describes) != other_kind.of(other)
                {
                    self.errors.push(AnalysisError::at(
                        RelocationErrorKind::AmbiguousByteRole,
                        offset,
                        format!(
                            "byte is the {:?} half of ${:04X} and the {:?} half of ${:04X}",
                            other_kind, other, kind, describes
                        ),
                    ));
                }
            }
            existing => self.errors.push(AnalysisError::at(
                RelocationErrorKind::UnsupportedSelfModification,
                consumer,
                format!(
                    "address fragment for ${:04X} comes from ${:04X}, which is {}",
                    describes,
                    self.image.address_of(offset),
                    existing
                ),
            )),
        }
    }

    // Pass 3

    fn pointer_pass(&mut self, trace: &ExecutionTrace, diagnostics: &mut Diagnostics) {
        let mut checked: IndexSet<(u16, u16, u16)> = IndexSet::new();

        for run in &trace.runs {
            for step in &run.steps {
                let Some(info) = opcode_tables::lookup(step.opcode) else {
                    continue;
                };
                let events = run.step_events(step);
                let in_image = self.image.offset_of(step.address);

                if matches!(info.mode, AddressingMode::ZeroPageX | AddressingMode::ZeroPageY) {
                    // Indexed zero-page accesses keep the whole span together
                    let data = events.iter().find(|e| e.kind == AccessKind::Data);
                    if let (Some(offset), Some(data)) = (in_image, data) {
                        self.note_span(offset, events[1].value, data.address as u8);
                    }
                    continue;
                }
                if matches!(info.mode, AddressingMode::AbsoluteX | AddressingMode::AbsoluteY) {
                    if let Some(offset) = in_image {
                        self.note_indexed_access(offset, events);
                    }
                    continue;
                }
                if !matches!(
                    info.mode,
                    AddressingMode::Indirect | AddressingMode::IndirectX | AddressingMode::IndirectY
                ) {
                    continue;
                }

                let pointers: Vec<usize> = step
                    .event_range()
                    .filter(|&i| run.events[i].kind == AccessKind::Pointer)
                    .collect();
                let &[low, high] = pointers.as_slice() else {
                    continue;
                };
                if let (AddressingMode::IndirectX, Some(offset)) = (info.mode, in_image) {
                    self.note_span(offset, events[1].value, run.events[high].address as u8);
                }

                let value = u16::from_le_bytes([run.events[low].value, run.events[high].value]);
                let effective = events
                    .iter()
                    .find(|e| e.kind == AccessKind::Data)
                    .map(|e| e.address);
                let into_image = self.image.contains_address(value)
                    || effective.is_some_and(|a| self.image.contains_address(a));
                if !into_image || !checked.insert((step.address, run.events[low].address, value)) {
                    continue;
                }

                if !self.image.contains_address(value) {
                    self.errors.push(AnalysisError::new(
                        RelocationErrorKind::UntraceablePointer,
                        in_image,
                        format!(
                            "pointer ${:04X} used at ${:04X} lies outside the image but reaches into it",
                            value, step.address
                        ),
                    ));
                    continue;
                }

                for (kind, index) in [(FragmentKind::Low, low), (FragmentKind::High, high)] {
                    self.trace_pointer_byte(run, index, kind, value, step.address, diagnostics);
                }
            }
        }
    }

    /// Zero-page run `base..=end` touched by one indexed instruction
    fn note_span(&mut self, instr: usize, base: u8, end: u8) {
        if end > base {
            let span = self.spans.entry(instr).or_insert(end);
            *span = (*span).max(end);
        }
    }

    /// Record where an absolute-indexed access with a base outside the image landed
    fn note_indexed_access(&mut self, instr: usize, events: &[MemoryAccessEvent]) {
        let Some(base) = self.instructions.get(&instr).map(|i| i.operand_value()) else {
            return;
        };
        if self.image.contains_address(base) || self.runtime_operands.contains_key(&instr) {
            return;
        }
        for event in events.iter().filter(|e| e.kind == AccessKind::Data) {
            let inside = self.image.contains_address(event.address);
            let reach = self.indexed_reach.entry(instr).or_insert((false, false));
            if inside {
                reach.0 = true;
            } else {
                reach.1 = true;
            }
        }
    }

    fn trace_pointer_byte(
        &mut self,
        run: &TraceRun,
        index: usize,
        kind: FragmentKind,
        value: u16,
        user: u16,
        diagnostics: &mut Diagnostics,
    ) {
        let pointer = run.events[index];
        let consumer = self.image.offset_of(user).unwrap_or(0);

        if let Some(offset) = self.image.offset_of(pointer.address) {
            diagnostics.trace(format!(
                "pointer byte at ${:04X} holds the {:?} half of ${:04X}",
                pointer.address, kind, value
            ));
            self.promote(offset, kind, value, consumer);
            return;
        }

        let store = run.events[..index].iter().rposition(|e| {
            e.is_write() && e.address == pointer.address && e.kind != AccessKind::Dummy
        });
        let origin = match store {
            Some(k) if run.events[k].value == pointer.value => {
                self.provenance(&run.events, k, pointer.value, 0, vec![pointer.address])
            }
            _ => ValueOrigin::Untraced,
        };

        match origin {
            ValueOrigin::ImageByte { offset, .. } => self.promote(offset, kind, value, consumer),
            _ => self.errors.push(AnalysisError::new(
                RelocationErrorKind::UntraceablePointer,
                self.image.offset_of(user),
                format!(
                    "{:?} byte of pointer ${:04X} at ${:04X} (used by ${:04X}) cannot be traced to the image",
                    kind, value, pointer.address, user
                ),
            )),
        }
    }

    // Pass 4

    fn finish(mut self, diagnostics: &mut Diagnostics) -> Result<RelocationMap, Vec<AnalysisError>> {
        let mut footprint = ZeroPageFootprint::new();
        for (offset, instruction) in &self.instructions {
            let class = instruction.operand_class();
            let zp = instruction.operand_value() as u8;
            if class.is_zero_page_pointer() {
                footprint.add_pointer(zp);
            } else if class.is_zero_page() {
                footprint.add(zp);
            }
            if let Some(&end) = self.spans.get(offset) {
                footprint.add_span(zp, end);
            }
        }

        let zp_map = match build_zp_map(&footprint, self.target.zp_range) {
            Ok(map) => map,
            Err(e) => {
                self.errors.push(e);
                IndexMap::new()
            }
        };

        let mut indexed_operands = IndexSet::new();
        for (&instr, &(inside, outside)) in &self.indexed_reach {
            if !inside {
                continue;
            }
            let address = self.image.address_of(instr);
            if outside {
                self.errors.push(AnalysisError::at(
                    RelocationErrorKind::AmbiguousByteRole,
                    instr + 1,
                    format!(
                        "indexed base of ${:04X} reaches both into the image and outside it",
                        address
                    ),
                ));
            } else {
                diagnostics.info(format!(
                    "indexed base of ${:04X} lies outside the image but every access lands inside; moving it with the code",
                    address
                ));
                indexed_operands.insert(instr);
            }
        }

        if let Some(offset) = self.roles.iter().position(|r| *r == ByteRole::Unclassified) {
            self.errors.push(AnalysisError::at(
                RelocationErrorKind::AmbiguousByteRole,
                offset,
                "byte left unclassified",
            ));
        }

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let mut map = RelocationMap {
            origin: self.image.origin(),
            length: self.image.len(),
            code_base: self.target.code_base,
            code_delta: self.code_delta,
            zp_window: self.target.zp_range,
            zp_map,
            fragment_fixups: Vec::new(),
            roles: self.roles,
            runtime_operands: self.runtime_operands,
            indexed_operands,
            sites: self.sites,
        };

        let mut errors = Vec::new();
        for runtime in map.runtime_operands.values() {
            let first = map.relocate_address(runtime.primary());
            for &other in &runtime.describes[1..] {
                let relocated = map.relocate_address(other);
                let low_clash = !runtime.written_low && first as u8 != relocated as u8;
                let high_clash = !runtime.written_high && first >> 8 != relocated >> 8;
                if low_clash || high_clash {
                    errors.push(AnalysisError::at(
                        RelocationErrorKind::AmbiguousByteRole,
                        runtime.instruction_offset + 1,
                        format!(
                            "operand is used for ${:04X} and ${:04X}, which relocate differently",
                            runtime.primary(),
                            other
                        ),
                    ));
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        map.fragment_fixups = map
            .roles
            .iter()
            .enumerate()
            .filter_map(|(offset, role)| match *role {
                ByteRole::AddressFragmentData { kind, describes } => Some(FragmentFixup {
                    offset,
                    kind,
                    describes,
                    new_value: kind.of(map.relocate_address(describes)),
                }),
                _ => None,
            })
            .collect();

        diagnostics.info(format!(
            "relocation map: delta {:+}, {} zero-page entries, {} fragments, {} runtime operands",
            map.code_delta,
            map.zp_map.len(),
            map.fragment_fixups.len(),
            map.runtime_operands.len()
        ));
        for site in &map.sites {
            diagnostics.trace(format!(
                "self-modifying write of ${:02X} into {:#06x} from {:?}",
                site.written_value, site.target_operand_offset, site.value_origin
            ));
        }
        if log::log_enabled!(log::Level::Trace) {
            let disasm = Disassembler::new(self.image.bytes(), self.image.origin());
            for &offset in self.instructions.keys() {
                trace!("{}", disasm.line_at(offset).0);
            }
        }
        Ok(map)
    }
}

/// Address whose `half` is `written` and whose other half comes from `lo`/`hi`
fn combine(half: FragmentKind, written: u8, lo: u8, hi: u8) -> u16 {
    match half {
        FragmentKind::Low => u16::from_le_bytes([written, hi]),
        FragmentKind::High => u16::from_le_bytes([lo, written]),
    }
}

/// Index of the opcode fetch that starts the instruction owning `events[index]`
fn instruction_start(events: &[MemoryAccessEvent], index: usize) -> Option<usize> {
    if index >= events.len() {
        return None;
    }
    events[..=index]
        .iter()
        .rposition(|e| e.kind == AccessKind::OpcodeFetch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    A,
    X,
    Y,
}

/// What one instruction did to the register a value is followed through
enum RegisterEffect {
    Unchanged,
    /// Loaded unchanged from memory or an immediate operand
    Load,
    /// Copied from another register
    Transfer(Register),
    Computed,
}

impl Register {
    /// Register whose content `mnemonic` writes to memory. Read-modify-write
    /// instructions and `PHP` store values no register held.
    fn stored_by(mnemonic: Mnemonic) -> Option<Register> {
        match mnemonic {
            Mnemonic::Sta | Mnemonic::Pha => Some(Register::A),
            Mnemonic::Stx => Some(Register::X),
            Mnemonic::Sty => Some(Register::Y),
            _ => None,
        }
    }

    fn set_by(self, mnemonic: Mnemonic, mode: AddressingMode) -> RegisterEffect {
        use Mnemonic::*;
        match (self, mnemonic) {
            (Register::A, Lda | Pla) | (Register::X, Ldx) | (Register::Y, Ldy) => RegisterEffect::Load,
            (Register::A, Txa) => RegisterEffect::Transfer(Register::X),
            (Register::A, Tya) => RegisterEffect::Transfer(Register::Y),
            (Register::X, Tax) | (Register::Y, Tay) => RegisterEffect::Transfer(Register::A),
            (Register::A, Adc | Sbc | And | Ora | Eor) => RegisterEffect::Computed,
            (Register::A, Asl | Lsr | Rol | Ror) if mode == AddressingMode::Accumulator => {
                RegisterEffect::Computed
            }
            (Register::X, Tsx | Inx | Dex) | (Register::Y, Iny | Dey) => RegisterEffect::Computed,
            _ => RegisterEffect::Unchanged,
        }
    }
}

#[cfg(test)]
#[path = "analyzer_tests.rs"]
mod tests;
