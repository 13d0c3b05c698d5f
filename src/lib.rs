//! Relocation of finished 6502 machine code.
//!
//! The engine ([`relocator::Relocator`]) traces an image on a cycle-accurate
//! CPU, classifies every byte, and rewrites the image for a new code base and
//! zero-page window. The assembler, disassembler and CPU are usable on their own.

#[macro_use]
extern crate lazy_static;

pub mod analyzer;
pub mod assembler;
pub mod config;
pub mod cpu;
pub mod diagnostics;
pub mod disassembler;
pub mod error;
pub mod expr;
pub mod image;
pub mod instruction;
pub mod opcode_tables;
pub mod patcher;
pub mod relocation_map;
pub mod relocator;
pub mod tracer;
pub mod zeropage;

pub use error::{RelocationError, RelocationErrorKind};
pub use image::{ProgramImage, RamZpRange, RelocationTarget};
pub use relocator::Relocator;
