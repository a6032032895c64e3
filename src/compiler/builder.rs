//! Program builder: the emitter side of the bytecode contract.
//!
//! Functions are emitted one at a time between `begin_function` and
//! `end_function`. Jumps name a [`Label`]; `end_function` resolves every
//! label of the function to a biased offset and fails if one does not fit.
//! `finish` appends the `CALL main; HALT` bootstrap and validates the result.

use std::collections::HashMap;

use crate::vm::{
    Format, Function, Instruction, MAX_A, MAX_B, MAX_BX, MAX_C, Opcode, Program, ProgramError,
    jump_offset,
};

/// A jump target inside the function being emitted. Labels belong to the
/// function that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    function: usize,
    index: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmitError {
    #[error("label {0} is used but never bound in '{1}'")]
    UnboundLabel(usize, String),
    #[error("label {0} is bound twice")]
    DuplicateLabel(usize),
    #[error("label {0} does not belong to the current function")]
    ForeignLabel(usize),
    #[error("jump at {pos} to {target} does not fit the offset field")]
    JumpOutOfRange { pos: usize, target: usize },
    #[error("{op}: operand {operand} out of range (max {max})")]
    OperandOutOfRange {
        op: Opcode,
        operand: u32,
        max: u32,
    },
    #[error("{op} does not take {expected:?} operands")]
    WrongFormat { op: Opcode, expected: Format },
    #[error("constant pool full")]
    PoolFull,
    #[error("function '{0}' is defined twice")]
    DuplicateFunction(String),
    #[error("function '{name}' declared with arity {declared} but defined with {defined}")]
    ArityConflict {
        name: String,
        declared: u8,
        defined: u8,
    },
    #[error("function '{0}' is declared but never defined")]
    UndefinedFunction(String),
    #[error("no function named 'main'")]
    MissingMain,
    #[error("'main' must take no arguments (takes {0})")]
    MainTakesArguments(u8),
    #[error("'{0}' begins inside another function")]
    NestedFunction(String),
    #[error("instruction emitted outside a function")]
    NotInFunction,
    #[error("function '{0}' was never ended")]
    UnterminatedFunction(String),
    #[error(transparent)]
    Program(#[from] ProgramError),
}

pub type EmitResult<T> = Result<T, EmitError>;

struct Declared {
    name: String,
    arity: u8,
    /// (entry point, code size) once the body has been emitted
    body: Option<(usize, usize)>,
}

/// State of the function between `begin_function` and `end_function`.
struct OpenFunction {
    index: usize,
    start: usize,
    labels: Vec<Option<usize>>,
    /// (absolute position of the jump, target label)
    jumps: Vec<(usize, Label)>,
}

/// Builds a [`Program`] one function at a time.
#[derive(Default)]
pub struct ProgramBuilder {
    ints: Vec<i32>,
    int_index: HashMap<i32, u32>,
    floats: Vec<f32>,
    float_index: HashMap<u32, u32>,
    functions: Vec<Declared>,
    names: HashMap<String, usize>,
    code: Vec<Instruction>,
    open: Option<OpenFunction>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function so it can be referenced before its body is emitted.
    /// Declaring the same name again with the same arity is a no-op.
    pub fn declare_function(&mut self, name: &str, arity: u8) -> EmitResult<usize> {
        if let Some(&index) = self.names.get(name) {
            let declared = self.functions[index].arity;
            if declared != arity {
                return Err(EmitError::ArityConflict {
                    name: name.to_string(),
                    declared,
                    defined: arity,
                });
            }
            return Ok(index);
        }
        if self.functions.len() > MAX_B as usize {
            return Err(EmitError::OperandOutOfRange {
                op: Opcode::Call,
                operand: self.functions.len() as u32,
                max: MAX_B,
            });
        }
        let index = self.functions.len();
        self.functions.push(Declared {
            name: name.to_string(),
            arity,
            body: None,
        });
        self.names.insert(name.to_string(), index);
        Ok(index)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn begin_function(&mut self, name: &str, arity: u8) -> EmitResult<usize> {
        if self.open.is_some() {
            return Err(EmitError::NestedFunction(name.to_string()));
        }
        let index = self.declare_function(name, arity)?;
        if self.functions[index].body.is_some() {
            return Err(EmitError::DuplicateFunction(name.to_string()));
        }
        self.open = Some(OpenFunction {
            index,
            start: self.code.len(),
            labels: Vec::new(),
            jumps: Vec::new(),
        });
        Ok(index)
    }

    fn open(&mut self) -> EmitResult<&mut OpenFunction> {
        self.open.as_mut().ok_or(EmitError::NotInFunction)
    }

    /// Position of the next instruction, relative to the function start.
    pub fn position(&self) -> Option<usize> {
        self.open.as_ref().map(|f| self.code.len() - f.start)
    }

    pub fn new_label(&mut self) -> EmitResult<Label> {
        let open = self.open()?;
        open.labels.push(None);
        Ok(Label {
            function: open.index,
            index: open.labels.len() - 1,
        })
    }

    /// The binding slot of `label` in the open function.
    fn label_slot(&mut self, label: Label) -> EmitResult<&mut Option<usize>> {
        let open = self.open()?;
        if label.function != open.index {
            return Err(EmitError::ForeignLabel(label.index));
        }
        open.labels
            .get_mut(label.index)
            .ok_or(EmitError::ForeignLabel(label.index))
    }

    /// Bind `label` to the next instruction emitted.
    pub fn bind_label(&mut self, label: Label) -> EmitResult<()> {
        let pos = self.code.len();
        let slot = self.label_slot(label)?;
        if slot.is_some() {
            return Err(EmitError::DuplicateLabel(label.index));
        }
        *slot = Some(pos);
        Ok(())
    }

    /// Index of `n` in the int pool, adding it if needed.
    pub fn int_constant(&mut self, n: i32) -> EmitResult<u32> {
        if let Some(&index) = self.int_index.get(&n) {
            return Ok(index);
        }
        let index = pool_index(self.ints.len())?;
        self.ints.push(n);
        self.int_index.insert(n, index);
        Ok(index)
    }

    /// Index of `f` in the float pool, adding it if needed. Deduplicates by
    /// bit pattern so `0.0` and `-0.0` stay distinct.
    pub fn float_constant(&mut self, f: f32) -> EmitResult<u32> {
        if let Some(&index) = self.float_index.get(&f.to_bits()) {
            return Ok(index);
        }
        let index = pool_index(self.floats.len())?;
        self.floats.push(f);
        self.float_index.insert(f.to_bits(), index);
        Ok(index)
    }

    fn push(&mut self, ins: Instruction) -> EmitResult<usize> {
        let start = self.open()?.start;
        self.code.push(ins);
        Ok(self.code.len() - 1 - start)
    }

    /// Emit an instruction of format `None`, `A`, `AB` or `ABC`. Pass zero
    /// for operands the format does not use.
    pub fn emit_abc(&mut self, op: Opcode, a: u32, b: u32, c: u32) -> EmitResult<usize> {
        match op.format() {
            Format::None | Format::A | Format::AB | Format::ABC => {}
            expected => return Err(EmitError::WrongFormat { op, expected }),
        }
        check(op, a, MAX_A)?;
        check(op, b, MAX_B)?;
        check(op, c, MAX_C)?;
        self.push(Instruction::abc(op, a, b, c))
    }

    pub fn emit_abx(&mut self, op: Opcode, a: u32, bx: u32) -> EmitResult<usize> {
        if op.format() != Format::ABx {
            return Err(EmitError::WrongFormat {
                op,
                expected: Format::ABx,
            });
        }
        check(op, a, MAX_A)?;
        check(op, bx, MAX_BX)?;
        self.push(Instruction::abx(op, a, bx))
    }

    pub fn emit_load_int(&mut self, a: u32, n: i32) -> EmitResult<usize> {
        let index = self.int_constant(n)?;
        self.emit_abx(Opcode::LoadInt, a, index)
    }

    pub fn emit_load_float(&mut self, a: u32, f: f32) -> EmitResult<usize> {
        let index = self.float_constant(f)?;
        self.emit_abx(Opcode::LoadFloat, a, index)
    }

    /// `LOADFUNC` of a declared (possibly not yet defined) function.
    pub fn emit_load_func(&mut self, a: u32, name: &str) -> EmitResult<usize> {
        let index = self
            .function_index(name)
            .ok_or_else(|| EmitError::UndefinedFunction(name.to_string()))?;
        self.emit_abx(Opcode::LoadFunc, a, index as u32)
    }

    /// `CALL` of a declared function with `argc` arguments starting at `a`.
    pub fn emit_call(&mut self, a: u32, name: &str, argc: u32) -> EmitResult<usize> {
        let index = self
            .function_index(name)
            .ok_or_else(|| EmitError::UndefinedFunction(name.to_string()))?;
        self.emit_abc(Opcode::Call, a, index as u32, argc)
    }

    /// Emit `JMP`, `JMPT` or `JMPF` to `label`. The offset is filled in by
    /// `end_function`.
    pub fn emit_jump(&mut self, op: Opcode, a: u32, label: Label) -> EmitResult<usize> {
        if !op.is_jump() {
            return Err(EmitError::WrongFormat {
                op,
                expected: op.format(),
            });
        }
        check(op, a, MAX_A)?;
        self.label_slot(label)?;
        let at = self.code.len();
        let pos = self.push(Instruction::asbx(op, a, 0))?;
        self.open()?.jumps.push((at, label));
        Ok(pos)
    }

    /// Close the current function: append `RETURNNIL` if control could run
    /// off its end, then resolve every jump.
    pub fn end_function(&mut self) -> EmitResult<usize> {
        let open = self.open.take().ok_or(EmitError::NotInFunction)?;
        let end = self.code.len();
        let name = &self.functions[open.index].name;

        let falls_through = self.code[open.start..]
            .last()
            .and_then(|ins| ins.opcode())
            .is_none_or(|op| !op.is_unconditional_transfer());
        let label_at_end = open.labels.iter().any(|&l| l == Some(end));
        if falls_through || label_at_end {
            self.code.push(Instruction::abc(Opcode::ReturnNil, 0, 0, 0));
        }

        for &(at, label) in &open.jumps {
            let target = open
                .labels
                .get(label.index)
                .copied()
                .flatten()
                .ok_or_else(|| EmitError::UnboundLabel(label.index, name.clone()))?;
            let offset = jump_offset(at, target).ok_or(EmitError::JumpOutOfRange {
                pos: at - open.start,
                target: target - open.start,
            })?;
            let ins = self.code[at];
            let op = ins.opcode().ok_or(EmitError::NotInFunction)?;
            self.code[at] = Instruction::asbx(op, ins.a(), offset);
        }

        let size = self.code.len() - open.start;
        self.functions[open.index].body = Some((open.start, size));
        Ok(open.index)
    }

    /// Append the bootstrap and produce the validated program.
    pub fn finish(mut self) -> EmitResult<Program> {
        if let Some(open) = &self.open {
            return Err(EmitError::UnterminatedFunction(
                self.functions[open.index].name.clone(),
            ));
        }
        let main = self.function_index("main").ok_or(EmitError::MissingMain)?;
        let arity = self.functions[main].arity;
        if arity != 0 {
            return Err(EmitError::MainTakesArguments(arity));
        }

        let mut functions = Vec::with_capacity(self.functions.len());
        for declared in self.functions {
            let (entry, size) = declared
                .body
                .ok_or_else(|| EmitError::UndefinedFunction(declared.name.clone()))?;
            functions.push(Function::new(declared.name, declared.arity, entry, size));
        }

        let entry_point = self.code.len();
        self.code.push(Instruction::abc(Opcode::Call, 1, main as u32, 0));
        self.code.push(Instruction::abc(Opcode::Halt, 0, 0, 0));
        Ok(Program::new(
            self.ints,
            self.floats,
            functions,
            self.code,
            entry_point,
        )?)
    }
}

fn check(op: Opcode, operand: u32, max: u32) -> EmitResult<()> {
    if operand > max {
        return Err(EmitError::OperandOutOfRange { op, operand, max });
    }
    Ok(())
}

fn pool_index(len: usize) -> EmitResult<u32> {
    if len > MAX_BX as usize {
        return Err(EmitError::PoolFull);
    }
    Ok(len as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JitMode, RuntimeConfig};
    use crate::vm::{MAX_JUMP, Value, Vm};

    fn run(program: Program) -> Value {
        let config = RuntimeConfig {
            jit_mode: JitMode::Off,
            ..RuntimeConfig::default()
        };
        Vm::with_config(program, &config).run().unwrap()
    }

    #[test]
    fn test_simple_main() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        b.emit_load_int(0, 2).unwrap();
        b.emit_load_int(1, 3).unwrap();
        b.emit_abc(Opcode::Add, 2, 0, 1).unwrap();
        b.emit_abc(Opcode::Return, 2, 0, 0).unwrap();
        b.end_function().unwrap();
        let program = b.finish().unwrap();

        assert_eq!(program.ints, vec![2, 3]);
        assert_eq!(program.entry_point, 4);
        assert_eq!(run(program), Value::int(5));
    }

    #[test]
    fn test_constants_are_pooled() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.int_constant(7).unwrap(), 0);
        assert_eq!(b.int_constant(8).unwrap(), 1);
        assert_eq!(b.int_constant(7).unwrap(), 0);
        assert_eq!(b.float_constant(0.0).unwrap(), 0);
        assert_eq!(b.float_constant(-0.0).unwrap(), 1);
    }

    #[test]
    fn test_implicit_return_nil() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        b.emit_load_int(0, 1).unwrap();
        b.end_function().unwrap();
        let program = b.finish().unwrap();
        assert_eq!(program.functions[0].code_size, 2);
        assert_eq!(program.code[1].opcode(), Some(Opcode::ReturnNil));
        assert_eq!(run(program), Value::NIL);
    }

    #[test]
    fn test_forward_backward_and_self_jumps() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let top = b.new_label().unwrap();
        let done = b.new_label().unwrap();
        let stay = b.new_label().unwrap();
        b.emit_load_int(0, 3).unwrap();
        b.emit_load_int(1, 1).unwrap();
        b.bind_label(top).unwrap();
        b.emit_jump(Opcode::JmpF, 0, done).unwrap();
        b.emit_abc(Opcode::Sub, 0, 0, 1).unwrap();
        b.emit_jump(Opcode::Jmp, 0, top).unwrap();
        b.bind_label(stay).unwrap();
        b.emit_jump(Opcode::Jmp, 0, stay).unwrap();
        b.bind_label(done).unwrap();
        b.emit_abc(Opcode::Return, 0, 0, 0).unwrap();
        b.end_function().unwrap();
        let program = b.finish().unwrap();

        // Each jump lands on its label's position.
        assert_eq!(program.code[2].jump_target(2), 6);
        assert_eq!(program.code[4].jump_target(4), 2);
        assert_eq!(program.code[5].sbx(), -1);
        assert_eq!(program.code[5].jump_target(5), 5);
        assert_eq!(run(program), Value::int(0));
    }

    #[test]
    fn test_label_at_end_gets_return_nil() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let end = b.new_label().unwrap();
        b.emit_jump(Opcode::Jmp, 0, end).unwrap();
        b.bind_label(end).unwrap();
        b.end_function().unwrap();
        let program = b.finish().unwrap();
        assert_eq!(program.functions[0].code_size, 2);
        assert_eq!(run(program), Value::NIL);
    }

    #[test]
    fn test_unbound_and_duplicate_labels() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let label = b.new_label().unwrap();
        b.emit_jump(Opcode::Jmp, 0, label).unwrap();
        assert!(matches!(b.end_function(), Err(EmitError::UnboundLabel(0, _))));

        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let label = b.new_label().unwrap();
        b.bind_label(label).unwrap();
        assert_eq!(b.bind_label(label), Err(EmitError::DuplicateLabel(0)));
    }

    #[test]
    fn test_label_from_another_function_is_rejected() {
        let mut b = ProgramBuilder::new();
        b.begin_function("f", 0).unwrap();
        b.new_label().unwrap();
        let second = b.new_label().unwrap();
        b.end_function().unwrap();

        b.begin_function("main", 0).unwrap();
        assert_eq!(b.bind_label(second), Err(EmitError::ForeignLabel(1)));
        assert_eq!(
            b.emit_jump(Opcode::Jmp, 0, second),
            Err(EmitError::ForeignLabel(1))
        );
        // Nothing was emitted for the rejected jump.
        assert_eq!(b.position(), Some(0));

        // Same index, different owner.
        let first = b.new_label().unwrap();
        let own = b.new_label().unwrap();
        assert_eq!(b.bind_label(second), Err(EmitError::ForeignLabel(1)));
        b.bind_label(first).unwrap();
        b.emit_jump(Opcode::Jmp, 0, own).unwrap();
        b.bind_label(own).unwrap();
        b.end_function().unwrap();
        assert_eq!(run(b.finish().unwrap()), Value::NIL);
    }

    #[test]
    fn test_jump_too_long_for_offset_field() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let far = b.new_label().unwrap();
        b.emit_jump(Opcode::Jmp, 0, far).unwrap();
        for _ in 0..=MAX_JUMP {
            b.emit_abc(Opcode::Move, 0, 0, 0).unwrap();
        }
        b.bind_label(far).unwrap();
        b.emit_abc(Opcode::ReturnNil, 0, 0, 0).unwrap();
        assert_eq!(
            b.end_function(),
            Err(EmitError::JumpOutOfRange {
                pos: 0,
                target: MAX_JUMP as usize + 2,
            })
        );
    }

    #[test]
    fn test_longest_forward_jump_fits() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        let far = b.new_label().unwrap();
        b.emit_jump(Opcode::Jmp, 0, far).unwrap();
        for _ in 0..MAX_JUMP {
            b.emit_abc(Opcode::Move, 0, 0, 0).unwrap();
        }
        b.bind_label(far).unwrap();
        b.emit_abc(Opcode::ReturnNil, 0, 0, 0).unwrap();
        b.end_function().unwrap();
        let program = b.finish().unwrap();
        assert_eq!(program.code[0].sbx(), MAX_JUMP);
    }

    #[test]
    fn test_operand_checks() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        assert!(matches!(
            b.emit_abc(Opcode::Add, 256, 0, 0),
            Err(EmitError::OperandOutOfRange { operand: 256, .. })
        ));
        assert!(matches!(
            b.emit_abc(Opcode::LoadInt, 0, 0, 0),
            Err(EmitError::WrongFormat { .. })
        ));
        assert!(matches!(
            b.emit_abx(Opcode::Add, 0, 0),
            Err(EmitError::WrongFormat { .. })
        ));
    }

    #[test]
    fn test_function_table_errors() {
        let mut b = ProgramBuilder::new();
        b.begin_function("main", 0).unwrap();
        assert!(matches!(
            b.begin_function("f", 0),
            Err(EmitError::NestedFunction(_))
        ));
        b.end_function().unwrap();
        assert!(matches!(
            b.begin_function("main", 0),
            Err(EmitError::DuplicateFunction(_))
        ));

        let mut b = ProgramBuilder::new();
        b.declare_function("f", 1).unwrap();
        assert!(matches!(
            b.begin_function("f", 2),
            Err(EmitError::ArityConflict { .. })
        ));
        b.begin_function("main", 0).unwrap();
        b.end_function().unwrap();
        assert_eq!(
            b.finish().unwrap_err(),
            EmitError::UndefinedFunction("f".to_string())
        );

        let mut b = ProgramBuilder::new();
        b.begin_function("main", 1).unwrap();
        b.end_function().unwrap();
        assert_eq!(b.finish().unwrap_err(), EmitError::MainTakesArguments(1));

        assert_eq!(ProgramBuilder::new().finish().unwrap_err(), EmitError::MissingMain);
    }

    #[test]
    fn test_forward_call() {
        let mut b = ProgramBuilder::new();
        b.declare_function("double", 1).unwrap();
        b.begin_function("main", 0).unwrap();
        b.emit_load_int(1, 21).unwrap();
        b.emit_call(1, "double", 1).unwrap();
        // The callee's result lands in the caller's r0.
        b.emit_abc(Opcode::Return, 0, 0, 0).unwrap();
        b.end_function().unwrap();
        b.begin_function("double", 1).unwrap();
        b.emit_abc(Opcode::Add, 0, 0, 0).unwrap();
        b.emit_abc(Opcode::Return, 0, 0, 0).unwrap();
        b.end_function().unwrap();
        assert_eq!(run(b.finish().unwrap()), Value::int(42));
    }
}
