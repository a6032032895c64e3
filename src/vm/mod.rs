mod value;
mod ops;
mod error;
mod heap;
mod vm;
pub mod bytecode;
pub mod cfg;
pub mod native;

pub use value::{Tag, Value, ValueKind, tags};
pub use ops::{
    Format, Instruction, J_ZERO, MAX_A, MAX_B, MAX_BX, MAX_C, MAX_JUMP, Opcode, jump_offset,
};
pub use error::{ErrorKind, VmError, VmResult};
pub use heap::{Block, GcStats, Heap, MAX_ARRAY_LEN};
pub use native::{NativeContext, NativeFn, NativeRegistry};
pub use vm::{Vm, VmStats};

/// Registers reserved for the bootstrap frame (`CALL 1, main, 0; HALT`).
pub const BOOTSTRAP_REGISTERS: usize = 2;

/// A function in the program's function table.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub arity: u8,
    /// Index of the first instruction in [`Program::code`].
    pub entry_point: usize,
    pub code_size: usize,
    /// Derived at load time, see [`register_count`].
    pub register_count: usize,
    /// Call counter deciding JIT promotion.
    pub hotness: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, arity: u8, entry_point: usize, code_size: usize) -> Self {
        Self {
            name: name.into(),
            arity,
            entry_point,
            code_size,
            register_count: 0,
            hotness: 0,
        }
    }

    pub fn code_range(&self) -> std::ops::Range<usize> {
        self.entry_point..self.entry_point + self.code_size
    }
}

/// Structural problems found while assembling a [`Program`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    #[error("function '{name}' spans {start}..{end} but the code has {len} instructions")]
    FunctionOutOfRange {
        name: String,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("entry point {entry} is outside the code ({len} instructions)")]
    EntryOutOfRange { entry: usize, len: usize },
    #[error("entry point {0} is not a `CALL main; HALT` bootstrap")]
    MalformedBootstrap(usize),
    #[error("duplicate function name '{0}'")]
    DuplicateFunction(String),
    #[error("too many functions ({0})")]
    TooManyFunctions(usize),
}

/// A loaded program: constant pools, function table and one flat code array.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub functions: Vec<Function>,
    pub code: Vec<Instruction>,
    /// Index of the bootstrap sequence in `code`.
    pub entry_point: usize,
}

impl Program {
    /// Validate the layout and derive every function's register count.
    pub fn new(
        ints: Vec<i32>,
        floats: Vec<f32>,
        mut functions: Vec<Function>,
        code: Vec<Instruction>,
        entry_point: usize,
    ) -> Result<Self, ProgramError> {
        if functions.len() > MAX_BX as usize + 1 {
            return Err(ProgramError::TooManyFunctions(functions.len()));
        }
        if entry_point + 1 >= code.len() {
            return Err(ProgramError::EntryOutOfRange {
                entry: entry_point,
                len: code.len(),
            });
        }
        let is_bootstrap = code[entry_point].opcode() == Some(Opcode::Call)
            && code[entry_point + 1].opcode() == Some(Opcode::Halt);
        if !is_bootstrap {
            return Err(ProgramError::MalformedBootstrap(entry_point));
        }

        let mut seen = std::collections::HashSet::new();
        for func in &mut functions {
            let range = func.code_range();
            if range.end > code.len() {
                return Err(ProgramError::FunctionOutOfRange {
                    name: func.name.clone(),
                    start: range.start,
                    end: range.end,
                    len: code.len(),
                });
            }
            if !seen.insert(func.name.clone()) {
                return Err(ProgramError::DuplicateFunction(func.name.clone()));
            }
            func.register_count = register_count(&code[range], func.arity);
        }

        Ok(Self {
            ints,
            floats,
            functions,
            code,
            entry_point,
        })
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn function_code(&self, index: usize) -> &[Instruction] {
        &self.code[self.functions[index].code_range()]
    }
}

/// One past the highest register an instruction stream touches; at least
/// `arity` and at least 1. Calls count their whole argument window.
pub fn register_count(code: &[Instruction], arity: u8) -> usize {
    let highest = code
        .iter()
        .filter_map(|&ins| highest_register(ins))
        .max()
        .map_or(0, |r| r + 1);
    highest.max(arity as usize).max(1)
}

fn highest_register(ins: Instruction) -> Option<usize> {
    let (a, b, c) = (ins.a() as usize, ins.b() as usize, ins.c() as usize);
    let op = ins.opcode()?;
    let reg = match op {
        Opcode::Halt | Opcode::ReturnNil | Opcode::Jmp => return None,
        Opcode::Call | Opcode::NativeCall => a + c,
        Opcode::InvokeDynamic => (a + c).max(b),
        Opcode::LoadInt
        | Opcode::LoadFloat
        | Opcode::LoadFunc
        | Opcode::LoadNil
        | Opcode::JmpT
        | Opcode::JmpF
        | Opcode::Return => a,
        Opcode::Move | Opcode::Neg | Opcode::NewArray | Opcode::Len => a.max(b),
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Eq
        | Opcode::Neq
        | Opcode::Lt
        | Opcode::Le
        | Opcode::GetElem
        | Opcode::SetElem => a.max(b).max(c),
    };
    Some(reg)
}
