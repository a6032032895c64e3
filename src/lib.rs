//! tiervm - a register-based bytecode VM with a tiering JIT
//!
//! Programs are built with [`compiler::ProgramBuilder`], assembled from a
//! text listing, or loaded from a binary image, then run on a [`Vm`].

pub mod compiler;
pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

use std::path::Path;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use vm::{Program, Value, Vm, VmError};

/// Failure to turn a file into a [`Program`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Image(#[from] vm::bytecode::ImageError),
    #[error(transparent)]
    Asm(#[from] compiler::AsmError),
    #[error("listing is not valid UTF-8")]
    NotUtf8,
}

/// Load a binary image or an assembly listing, told apart by the image magic.
pub fn load_bytes(data: &[u8]) -> Result<Program, LoadError> {
    if vm::bytecode::is_image(data) {
        return Ok(vm::bytecode::deserialize(data)?);
    }
    let source = std::str::from_utf8(data).map_err(|_| LoadError::NotUtf8)?;
    Ok(compiler::assemble(source)?)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<Program, LoadError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_bytes(&data)
}
