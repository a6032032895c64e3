//! Program producers and printers: the emitter API, the assembly listing
//! format and the disassembler.

pub mod asm;
pub mod builder;
pub mod dump;

pub use asm::{AsmError, AsmErrorKind, assemble};
pub use builder::{EmitError, EmitResult, Label, ProgramBuilder};
