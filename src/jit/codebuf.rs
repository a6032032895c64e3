//! Code buffer for building JIT code.
//!
//! Machine code is assembled here, branch displacements are patched once
//! every label is bound, and the result is copied into executable memory.

use super::memory::{ExecutableMemory, MemoryError};

/// A branch target inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// A label was referenced but never bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("label {0} was never bound")]
pub struct UnboundLabel(pub usize);

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Offset of each label, once bound
    labels: Vec<Option<usize>>,
    /// rel32 fields to patch: (field offset, target)
    fixups: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// Emit a rel32 placeholder that will point at `label`.
    pub fn emit_rel32(&mut self, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.emit_u32(0);
    }

    /// Resolve every rel32 field. Displacements are relative to the end of
    /// the field, which is the end of every instruction that uses one here.
    pub fn patch(&mut self) -> Result<(), UnboundLabel> {
        for (at, label) in self.fixups.drain(..) {
            let target = self.labels[label.0].ok_or(UnboundLabel(label.0))?;
            let rel = target as i64 - (at as i64 + 4);
            self.code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Copy the (patched) code into fresh executable memory.
    pub fn finalize(&self) -> Result<ExecutableMemory, MemoryError> {
        let mut mem = ExecutableMemory::new(self.code.len())?;
        mem.write(0, &self.code)?;
        mem.make_executable()?;
        Ok(mem)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
