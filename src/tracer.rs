//! Execution tracing: runs the CPU over an image and records every bus access

use crate::cpu::{AccessKind, Cpu, MemoryBus, Ram, Registers};
use crate::diagnostics::Diagnostics;
use crate::error::CpuError;
use crate::image::ProgramImage;
use crate::instruction::Mnemonic;
use indexmap::IndexSet;
use log::{debug, trace};
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessDirection {
    Read,
    Write,
}

/// One machine cycle's bus access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessEvent {
    /// Run-local cycle number, starting at 0
    pub cycle: u64,
    /// Address of the instruction performing the access
    pub instruction_address: u16,
    /// Offset of that instruction within the image, if it lies inside
    pub instruction_offset: Option<usize>,
    pub address: u16,
    pub value: u8,
    pub direction: AccessDirection,
    pub kind: AccessKind,
}

impl MemoryAccessEvent {
    pub fn is_read(&self) -> bool {
        self.direction == AccessDirection::Read
    }

    pub fn is_write(&self) -> bool {
        self.direction == AccessDirection::Write
    }
}

impl fmt::Display for MemoryAccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let arrow = match self.direction {
            AccessDirection::Read => "->",
            AccessDirection::Write => "<-",
        };
        write!(
            f,
            "#{:<6} ${:04X}: ${:04X} {} ${:02X} ({:?})",
            self.cycle, self.instruction_address, self.address, arrow, self.value, self.kind
        )
    }
}

/// Bus decorator that records every access passing through it
pub struct TracingBus<'a, B: MemoryBus> {
    inner: &'a mut B,
    image_range: Range<u32>,
    origin: u16,
    instruction_address: u16,
    cycle: u64,
    events: Vec<MemoryAccessEvent>,
}

impl<'a, B: MemoryBus> TracingBus<'a, B> {
    pub fn new(inner: &'a mut B, image: &ProgramImage) -> Self {
        TracingBus {
            inner,
            image_range: image.address_range(),
            origin: image.origin(),
            instruction_address: image.origin(),
            cycle: 0,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[MemoryAccessEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<MemoryAccessEvent> {
        self.events
    }

    fn record(&mut self, address: u16, value: u8, direction: AccessDirection, kind: AccessKind) {
        let instruction_offset = if self.image_range.contains(&(self.instruction_address as u32)) {
            Some((self.instruction_address - self.origin) as usize)
        } else {
            None
        };
        self.events.push(MemoryAccessEvent {
            cycle: self.cycle,
            instruction_address: self.instruction_address,
            instruction_offset,
            address,
            value,
            direction,
            kind,
        });
        self.cycle += 1;
    }
}

impl<B: MemoryBus> MemoryBus for TracingBus<'_, B> {
    fn read(&mut self, address: u16) -> u8 {
        self.read_as(address, AccessKind::Data)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.write_as(address, value, AccessKind::Data)
    }

    fn read_as(&mut self, address: u16, kind: AccessKind) -> u8 {
        if kind == AccessKind::OpcodeFetch {
            self.instruction_address = address;
        }
        let value = self.inner.read_as(address, kind);
        self.record(address, value, AccessDirection::Read, kind);
        value
    }

    fn write_as(&mut self, address: u16, value: u8, kind: AccessKind) {
        self.inner.write_as(address, value, kind);
        self.record(address, value, AccessDirection::Write, kind);
    }
}

/// One executed instruction and the slice of events it produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub address: u16,
    pub opcode: u8,
    pub first_event: usize,
    pub event_count: usize,
}

impl StepRecord {
    pub fn event_range(&self) -> Range<usize> {
        self.first_event..self.first_event + self.event_count
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The entry routine returned to its caller
    Returned,
    /// BRK executed at this address
    Break(u16),
    /// Unassigned opcode at this address
    Jammed { address: u16, opcode: u8 },
    /// Cycle budget exhausted; the trace is partial
    Timeout,
}

/// Trace of a single entry point
#[derive(Debug, Clone)]
pub struct TraceRun {
    pub entry_point: u16,
    pub events: Vec<MemoryAccessEvent>,
    pub steps: Vec<StepRecord>,
    /// Instruction addresses executed, in first-execution order
    pub executed: IndexSet<u16>,
    pub outcome: RunOutcome,
    pub cycles: u64,
    pub final_registers: Registers,
}

impl TraceRun {
    pub fn step_events(&self, step: &StepRecord) -> &[MemoryAccessEvent] {
        &self.events[step.event_range()]
    }

    /// Data writes that land outside both `code` and `zero_page`
    pub fn external_writes<'a>(
        &'a self,
        code: Range<u32>,
        zero_page: Range<u16>,
    ) -> impl Iterator<Item = (u16, u8)> + 'a {
        self.events
            .iter()
            .filter(|e| e.is_write() && e.kind == AccessKind::Data)
            .filter(move |e| !code.contains(&(e.address as u32)) && !zero_page.contains(&e.address))
            .map(|e| (e.address, e.value))
    }
}

/// Non-fatal problems found while tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFailure {
    Timeout(u16),
}

impl fmt::Display for TraceFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TraceFailure::Timeout(entry) => {
                write!(f, "trace from ${:04X} exceeded its cycle budget", entry)
            }
        }
    }
}

/// Traces of all entry points, in entry-point order
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    pub runs: Vec<TraceRun>,
}

impl ExecutionTrace {
    /// All events, runs concatenated; cycle numbers stay run-local
    pub fn events(&self) -> impl Iterator<Item = &MemoryAccessEvent> {
        self.runs.iter().flat_map(|run| run.events.iter())
    }

    pub fn failures(&self) -> Vec<TraceFailure> {
        self.runs
            .iter()
            .filter(|run| run.outcome == RunOutcome::Timeout)
            .map(|run| TraceFailure::Timeout(run.entry_point))
            .collect()
    }

    /// Every executed instruction address across all runs
    pub fn executed_addresses(&self) -> IndexSet<u16> {
        self.runs
            .iter()
            .flat_map(|run| run.executed.iter().copied())
            .collect()
    }
}

/// Drives a CPU over an image, one fresh machine per entry point
pub struct Tracer {
    cpu: Cpu,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Tracer { cpu: Cpu::new() }
    }

    pub fn trace(
        &mut self,
        image: &ProgramImage,
        entry_points: &[u16],
        max_cycles_per_run: u64,
        diagnostics: &mut Diagnostics,
    ) -> ExecutionTrace {
        let mut trace = ExecutionTrace::default();
        for &entry in entry_points {
            let run = self.run(image, entry, max_cycles_per_run);
            report_outcome(&run, diagnostics);
            trace.runs.push(run);
        }
        trace
    }

    /// Trace one entry point against fresh RAM holding only the image
    pub fn run(&mut self, image: &ProgramImage, entry: u16, max_cycles: u64) -> TraceRun {
        let mut ram = Ram::with_image(image);
        self.cpu.reset();
        self.cpu.set_pc(entry);
        let entry_stack = self.cpu.regs.s;

        let mut bus = TracingBus::new(&mut ram, image);
        let mut steps = Vec::new();
        let mut executed = IndexSet::new();

        let outcome = loop {
            if self.cpu.cycles() >= max_cycles {
                break RunOutcome::Timeout;
            }

            let first_event = bus.events().len();
            let step = match self.cpu.step(&mut bus) {
                Ok(step) => step,
                Err(CpuError::Jammed { pc, opcode }) => {
                    debug!("stepped a jammed CPU at ${:04X}", pc);
                    break RunOutcome::Jammed { address: pc, opcode };
                }
            };
            steps.push(StepRecord {
                address: step.address,
                opcode: step.opcode,
                first_event,
                event_count: bus.events().len() - first_event,
            });
            executed.insert(step.address);

            match step.mnemonic {
                None => {
                    break RunOutcome::Jammed {
                        address: step.address,
                        opcode: step.opcode,
                    }
                }
                Some(Mnemonic::Brk) => break RunOutcome::Break(step.address),
                Some(Mnemonic::Rts) | Some(Mnemonic::Rti) if self.cpu.regs.s > entry_stack => {
                    break RunOutcome::Returned
                }
                _ => {}
            }
        };

        let events = bus.into_events();
        trace!(
            "run ${:04X}: {} instructions, {} events, {:?}",
            entry,
            steps.len(),
            events.len(),
            outcome
        );

        TraceRun {
            entry_point: entry,
            events,
            steps,
            executed,
            outcome,
            cycles: self.cpu.cycles(),
            final_registers: self.cpu.regs,
        }
    }
}

fn report_outcome(run: &TraceRun, diagnostics: &mut Diagnostics) {
    let entry = run.entry_point;
    match run.outcome {
        RunOutcome::Returned => diagnostics.trace(format!(
            "trace ${:04X}: returned after {} cycles",
            entry, run.cycles
        )),
        RunOutcome::Break(address) => diagnostics.info(format!(
            "trace ${:04X}: BRK at ${:04X} after {} cycles",
            entry, address, run.cycles
        )),
        RunOutcome::Jammed { address, opcode } => diagnostics.warning(format!(
            "trace ${:04X}: CPU jammed by opcode ${:02X} at ${:04X}",
            entry, opcode, address
        )),
        RunOutcome::Timeout => diagnostics.warning(format!(
            "trace timeout: {} ({} instructions traced)",
            TraceFailure::Timeout(entry),
            run.steps.len()
        )),
    }
}
