//! The relocation engine: trace, analyze, patch

use crate::analyzer;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{AnalysisError, RelocationError, RelocationErrorKind};
use crate::image::{ProgramImage, RelocationTarget};
use crate::patcher;
use crate::relocation_map::RelocationMap;
use crate::tracer::Tracer;
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Tracing,
    Analyzing,
    Patched,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Tracing => "tracing",
            EngineState::Analyzing => "analyzing",
            EngineState::Patched => "patched",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Moves finished machine code to a new code base and zero-page window.
///
/// Diagnostics accumulate across calls until `clear_diagnostics`.
pub struct Relocator {
    tracer: Tracer,
    diagnostics: Diagnostics,
    state: EngineState,
    last_map: Option<RelocationMap>,
}

impl Default for Relocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Relocator {
    pub fn new() -> Self {
        Relocator {
            tracer: Tracer::new(),
            diagnostics: Diagnostics::new(),
            state: EngineState::Idle,
            last_map: None,
        }
    }

    /// Relocate `image` so it runs at `target`. Either every byte is accounted
    /// for by the relocation map, or nothing is returned.
    pub fn relocate(
        &mut self,
        image: &ProgramImage,
        entry_points: &[u16],
        target: RelocationTarget,
        max_cycles_per_run: u64,
    ) -> Result<Vec<u8>, RelocationError> {
        let mark = self.diagnostics.len();
        self.last_map = None;
        self.state = EngineState::Idle;

        if let Err(error) = self.validate(image, entry_points, target) {
            return Err(self.fail(&[error]));
        }

        self.state = EngineState::Tracing;
        self.diagnostics.trace(format!(
            "relocating {} bytes from ${:04X} to ${:04X}, zero page {}",
            image.len(),
            image.origin(),
            target.code_base,
            target.zp_range
        ));
        let trace = self.tracer.trace(
            image,
            entry_points,
            max_cycles_per_run,
            &mut self.diagnostics,
        );

        self.state = EngineState::Analyzing;
        let map = match analyzer::analyze(image, &trace, entry_points, target, &mut self.diagnostics)
        {
            Ok(map) => map,
            Err(errors) => return Err(self.fail(&errors)),
        };

        // Error diagnostics are only logged by `fail`
        debug_assert!(!self.diagnostics.has_errors_since(mark));

        let bytes = match patcher::apply(image, &map) {
            Ok(bytes) => bytes,
            Err(error) => return Err(self.fail(&[error])),
        };

        self.diagnostics.info(format!(
            "relocated {} bytes to ${:04X} (delta {:+})",
            bytes.len(),
            map.code_base,
            map.code_delta
        ));
        debug!("relocation map:\n{}", map);
        self.last_map = Some(map);
        self.state = EngineState::Patched;
        Ok(bytes)
    }

    fn validate(
        &self,
        image: &ProgramImage,
        entry_points: &[u16],
        target: RelocationTarget,
    ) -> Result<(), AnalysisError> {
        if image.is_empty() {
            return Err(AnalysisError::new(
                RelocationErrorKind::InvalidTarget,
                None,
                "image is empty",
            ));
        }
        if !target.zp_range.is_valid() {
            return Err(AnalysisError::new(
                RelocationErrorKind::InvalidTarget,
                None,
                format!("zero-page window {} leaves page zero", target.zp_range),
            ));
        }
        if let Some(&entry) = entry_points.iter().find(|&&e| !image.contains_address(e)) {
            return Err(AnalysisError::new(
                RelocationErrorKind::InvalidTarget,
                None,
                format!(
                    "entry point ${:04X} lies outside the image ${:04X}-${:04X}",
                    entry,
                    image.origin(),
                    image.address_range().end - 1
                ),
            ));
        }
        Ok(())
    }

    fn fail(&mut self, errors: &[AnalysisError]) -> RelocationError {
        for error in errors {
            self.diagnostics.error(error.to_string());
        }
        self.state = EngineState::Failed;
        self.last_map = None;
        RelocationError::from_analysis(errors).with_diagnostics(self.diagnostics.entries())
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.entries()
    }

    pub fn clear_diagnostics(&mut self) {
        self.diagnostics.clear();
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Map of the last successful relocation
    pub fn relocation_map(&self) -> Option<&RelocationMap> {
        self.last_map.as_ref()
    }

    /// Write the last relocation map as text
    pub fn format_relocation_map(&self, out: &mut impl fmt::Write) -> fmt::Result {
        match &self.last_map {
            Some(map) => map.format(out),
            None => writeln!(out, "No relocation map ({})", self.state),
        }
    }
}
