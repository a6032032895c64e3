//! JIT compilation infrastructure for tiervm.
//!
//! This module provides:
//! - Executable memory allocation
//! - Code buffer with label patching
//! - x86-64 instruction encoding
//! - Template-based per-function compiler
//!
//! This module is only compiled when the `jit` feature is enabled. On targets
//! without a backend, [`compile`] always aborts and every function stays in
//! the interpreter.

mod codebuf;
mod memory;
#[cfg(target_arch = "x86_64")]
pub mod compiler_x86_64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

pub use codebuf::{CodeBuffer, Label, UnboundLabel};
pub use memory::{ExecutableMemory, MemoryError};

use crate::vm::cfg::CfgError;
use crate::vm::{Opcode, Program, Value};

/// Why a function could not be compiled. The function then stays interpreted.
#[derive(Debug, thiserror::Error)]
pub enum JitAbort {
    #[error("unsupported opcode {opcode} at {pos}")]
    UnsupportedOpcode { opcode: Opcode, pos: usize },
    #[error("no JIT backend for this target")]
    UnsupportedTarget,
    #[error("no function with index {0}")]
    UnknownFunction(usize),
    #[error("constant or function index {index} out of range at {pos}")]
    InvalidConstant { pos: usize, index: usize },
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("executable memory: {0}")]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    UnboundLabel(#[from] UnboundLabel),
}

pub type CompilationResult = Result<CompiledFunction, JitAbort>;

/// Native entry: receives a pointer to the callee's register 0 and returns
/// the result or [`Value::BAILOUT`].
type NativeEntry = unsafe extern "C" fn(*mut Value) -> Value;

/// Native code for one function.
pub struct CompiledFunction {
    /// Keeps the code mapped for as long as `entry` may be called
    memory: ExecutableMemory,
    entry: NativeEntry,
    register_count: usize,
    code_size: usize,
}

impl CompiledFunction {
    fn new(memory: ExecutableMemory, register_count: usize, code_size: usize) -> CompilationResult {
        let ptr = memory.entry_ptr().ok_or(MemoryError::ProtectionFailed)?;
        // SAFETY: the mapping is executable and starts with a function that
        // follows the NativeEntry ABI.
        let entry = unsafe { std::mem::transmute::<*const u8, NativeEntry>(ptr) };
        Ok(Self {
            memory,
            entry,
            register_count,
            code_size,
        })
    }

    /// Run on a register window. A window shorter than the function's frame
    /// bails out without executing anything.
    pub fn invoke(&self, registers: &mut [Value]) -> Value {
        if registers.len() < self.register_count {
            return Value::BAILOUT;
        }
        debug_assert!(self.memory.is_executable());
        // SAFETY: compiled code only touches registers below register_count,
        // all of which lie inside `registers`.
        unsafe { (self.entry)(registers.as_mut_ptr()) }
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// Size of the emitted machine code in bytes.
    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

/// Compile function `index` of `program` to native code.
#[cfg(target_arch = "x86_64")]
pub fn compile(program: &Program, index: usize) -> CompilationResult {
    compiler_x86_64::compile(program, index)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn compile(_program: &Program, _index: usize) -> CompilationResult {
    Err(JitAbort::UnsupportedTarget)
}
