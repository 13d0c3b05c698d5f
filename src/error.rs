// Relocation and assembler error handling

use crate::diagnostics::Diagnostic;
use serde::Serialize;
use std::fmt;

/// Why a relocation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RelocationErrorKind {
    InvalidOpcodeEncountered,
    TraceTimeout,
    UnsupportedSelfModification,
    ZeroPageWindowTooSmall,
    AddressOutOfRange,
    UnresolvedLabel,
    AmbiguousByteRole,
    UntraceablePointer,
    InvalidTarget,
}

impl fmt::Display for RelocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RelocationErrorKind::InvalidOpcodeEncountered => "invalid opcode encountered",
            RelocationErrorKind::TraceTimeout => "trace timeout",
            RelocationErrorKind::UnsupportedSelfModification => "unsupported self-modification",
            RelocationErrorKind::ZeroPageWindowTooSmall => "zero-page window too small",
            RelocationErrorKind::AddressOutOfRange => "address out of range",
            RelocationErrorKind::UnresolvedLabel => "unresolved label",
            RelocationErrorKind::AmbiguousByteRole => "ambiguous byte role",
            RelocationErrorKind::UntraceablePointer => "untraceable pointer",
            RelocationErrorKind::InvalidTarget => "invalid target",
        };
        f.write_str(name)
    }
}

/// One classification problem found during analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisError {
    pub kind: RelocationErrorKind,
    /// Offset of the offending byte within the image, when there is one
    pub offset: Option<usize>,
    pub message: String,
}

impl AnalysisError {
    pub fn new(kind: RelocationErrorKind, offset: Option<usize>, message: impl Into<String>) -> Self {
        AnalysisError {
            kind,
            offset,
            message: message.into(),
        }
    }

    pub fn at(kind: RelocationErrorKind, offset: usize, message: impl Into<String>) -> Self {
        Self::new(kind, Some(offset), message)
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} at offset {:#06x}: {}", self.kind, offset, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// The single failure type of a relocation call. Carries the whole diagnostics log.
#[derive(Debug, Clone)]
pub struct RelocationError {
    pub kind: RelocationErrorKind,
    pub message: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl RelocationError {
    pub fn new(kind: RelocationErrorKind, message: impl Into<String>) -> Self {
        RelocationError {
            kind,
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: &[Diagnostic]) -> Self {
        self.diagnostics = diagnostics.to_vec();
        self
    }

    /// Fold a batch of analysis errors into one failure; the first error decides the kind
    pub fn from_analysis(errors: &[AnalysisError]) -> Self {
        let kind = errors
            .first()
            .map(|e| e.kind)
            .unwrap_or(RelocationErrorKind::InvalidTarget);
        let mut message = format!("{} analysis error(s)", errors.len());
        for error in errors {
            message.push_str("\n  ");
            message.push_str(&error.to_string());
        }
        RelocationError::new(kind, message)
    }
}

impl fmt::Display for RelocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Relocation failed ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for RelocationError {}

impl From<AssemblerError> for RelocationError {
    fn from(error: AssemblerError) -> Self {
        let kind = match error {
            AssemblerError::UnresolvedLabel(_) => RelocationErrorKind::UnresolvedLabel,
            AssemblerError::InvalidImage(_) => RelocationErrorKind::InvalidTarget,
            _ => RelocationErrorKind::AddressOutOfRange,
        };
        RelocationError::new(kind, error.to_string())
    }
}

/// Errors raised while finalizing an assembled program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    UnresolvedLabel(String),
    DuplicateLabel(String),
    /// No opcode encodes this mnemonic with this addressing mode
    InvalidAddressingMode(String),
    BranchOutOfRange { at: u16, displacement: i32 },
    /// Operand value does not fit its field
    ValueOutOfRange { at: u16, value: i32 },
    InvalidImage(String),
}

impl fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssemblerError::UnresolvedLabel(name) => write!(f, "Unresolved label '{}'", name),
            AssemblerError::DuplicateLabel(name) => write!(f, "Duplicate label '{}'", name),
            AssemblerError::InvalidAddressingMode(what) => {
                write!(f, "Invalid addressing mode: {}", what)
            }
            AssemblerError::BranchOutOfRange { at, displacement } => write!(
                f,
                "Branch at ${:04X} out of range (displacement {})",
                at, displacement
            ),
            AssemblerError::ValueOutOfRange { at, value } => {
                write!(f, "Value {} out of range for operand at ${:04X}", value, at)
            }
            AssemblerError::InvalidImage(msg) => write!(f, "Invalid image: {}", msg),
        }
    }
}

impl std::error::Error for AssemblerError {}

/// CPU oracle failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    /// Stepped a CPU that executed an unassigned opcode
    Jammed { pc: u16, opcode: u8 },
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CpuError::Jammed { pc, opcode } => {
                write!(f, "CPU jammed by opcode ${:02X} at ${:04X}", opcode, pc)
            }
        }
    }
}

impl std::error::Error for CpuError {}
