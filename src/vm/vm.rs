use std::io::{self, Write};

use serde::Serialize;
use tracing::debug;

use crate::config::RuntimeConfig;
#[cfg(feature = "jit")]
use crate::jit::{self, CompiledFunction};

use super::error::{VmError, VmResult};
use super::heap::{GcStats, Heap};
use super::native::{NativeContext, NativeFn, NativeRegistry};
use super::ops::{Instruction, Opcode};
use super::value::{Tag, Value, ValueKind};
use super::{BOOTSTRAP_REGISTERS, Program};

/// A call frame: where to resume the caller.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    return_ip: usize,
    base_ptr: usize,
    /// Caller's function (None for the bootstrap frame)
    function: Option<usize>,
}

/// Execution tier of one function.
enum Tier {
    Interpreted,
    #[cfg(feature = "jit")]
    Compiled(CompiledFunction),
    /// The JIT gave up on this function; it stays interpreted.
    Aborted,
}

/// Counters reported after a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmStats {
    pub gc: GcStats,
    pub jit_compiled: usize,
    pub jit_aborted: usize,
    pub native_calls: usize,
    pub bailouts: usize,
}

/// The register virtual machine.
pub struct Vm {
    program: Program,
    registers: Box<[Value]>,
    frames: Vec<CallFrame>,
    ip: usize,
    fp: usize,
    current: Option<usize>,
    heap: Heap,
    natives: NativeRegistry,
    tiers: Vec<Tier>,
    jit_enabled: bool,
    jit_threshold: u32,
    max_call_depth: usize,
    stats: VmStats,
    /// Argument window saved across a native call, restored on bailout.
    saved_args: Vec<Value>,
    /// Output stream for the `print` host function
    output: Box<dyn Write>,
}

enum Flow {
    Continue,
    Halt(Value),
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, &RuntimeConfig::default())
    }

    pub fn with_config(program: Program, config: &RuntimeConfig) -> Self {
        Self::with_output(program, config, Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(program: Program, config: &RuntimeConfig, output: Box<dyn Write>) -> Self {
        let tiers = program.functions.iter().map(|_| Tier::Interpreted).collect();
        let stack_size = config.stack_size.max(BOOTSTRAP_REGISTERS);
        Self {
            program,
            registers: vec![Value::NIL; stack_size].into_boxed_slice(),
            frames: Vec::with_capacity(64),
            ip: 0,
            fp: 0,
            current: None,
            heap: Heap::new_with_config(config.gc_threshold, config.gc_enabled),
            natives: NativeRegistry::with_defaults(),
            tiers,
            jit_enabled: config.jit_mode.enabled(),
            jit_threshold: config.jit_threshold,
            max_call_depth: config.max_call_depth,
            stats: VmStats::default(),
            saved_args: Vec::new(),
            output,
        }
    }

    /// Install a host function at `index`.
    pub fn register_native(&mut self, index: usize, name: &'static str, func: NativeFn) {
        self.natives.register(index, name, func);
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            gc: self.heap.stats().clone(),
            ..self.stats.clone()
        }
    }

    /// Value of absolute register `index`.
    pub fn register(&self, index: usize) -> Option<Value> {
        self.registers.get(index).copied()
    }

    pub fn is_compiled(&self, function: usize) -> bool {
        match self.tiers.get(function) {
            #[cfg(feature = "jit")]
            Some(Tier::Compiled(_)) => true,
            _ => false,
        }
    }

    pub fn is_jit_aborted(&self, function: usize) -> bool {
        matches!(self.tiers.get(function), Some(Tier::Aborted))
    }

    pub fn jit_compile_count(&self) -> usize {
        self.stats.jit_compiled
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.fp = 0;
        self.current = None;
        self.registers.fill(Value::NIL);
    }

    /// Run the program from its bootstrap and return `main`'s result.
    pub fn run(&mut self) -> VmResult<Value> {
        self.reset();
        self.ip = self.program.entry_point;
        self.execute()
    }

    /// Call one function directly with `args` and return its result.
    pub fn invoke(&mut self, function: usize, args: &[Value]) -> VmResult<Value> {
        self.reset();
        let end = 1 + args.len();
        if end > self.registers.len() {
            return Err(VmError::RegisterOverflow {
                needed: end,
                available: self.registers.len(),
            });
        }
        self.registers[1..end].copy_from_slice(args);
        // The callee returns to the bootstrap's HALT.
        self.ip = self.program.entry_point + 1;
        self.call(function, 1, args.len() as u32)?;
        self.execute()
    }

    /// Force a full collection rooted at the live register windows.
    pub fn collect_garbage(&mut self) -> usize {
        let extent = self.root_extent().min(self.registers.len());
        self.heap.collect(&self.registers[..extent])
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_gc() {
            self.collect_garbage();
        }
    }

    fn frame_size(&self, function: Option<usize>) -> usize {
        match function {
            Some(index) => self.program.functions[index].register_count,
            None => BOOTSTRAP_REGISTERS,
        }
    }

    /// One past the highest register of any active frame.
    fn root_extent(&self) -> usize {
        self.frames
            .iter()
            .map(|f| f.base_ptr + self.frame_size(f.function))
            .fold(self.fp + self.frame_size(self.current), usize::max)
    }

    #[inline]
    fn reg(&self, r: u32) -> Value {
        self.registers[self.fp + r as usize]
    }

    #[inline]
    fn set_reg(&mut self, r: u32, value: Value) {
        self.registers[self.fp + r as usize] = value;
    }

    fn execute(&mut self) -> VmResult<Value> {
        loop {
            let ip = self.ip;
            let ins = *self
                .program
                .code
                .get(ip)
                .ok_or(VmError::IpOutOfRange { ip: ip as i64 })?;
            self.ip = ip + 1;

            if let Flow::Halt(value) = self.step(ip, ins)? {
                return Ok(value);
            }
        }
    }

    fn step(&mut self, ip: usize, ins: Instruction) -> VmResult<Flow> {
        let op = ins.opcode().ok_or(VmError::InvalidOpcode {
            opcode: ins.raw_opcode(),
            ip,
        })?;
        let (a, b, c) = (ins.a(), ins.b(), ins.c());

        match op {
            Opcode::Halt => return Ok(Flow::Halt(self.registers[0])),
            Opcode::LoadInt => {
                let index = ins.bx() as usize;
                let n = *self
                    .program
                    .ints
                    .get(index)
                    .ok_or(VmError::InvalidIntConstant { index })?;
                self.set_reg(a, Value::int(n));
            }
            Opcode::LoadFloat => {
                let index = ins.bx() as usize;
                let f = *self
                    .program
                    .floats
                    .get(index)
                    .ok_or(VmError::InvalidFloatConstant { index })?;
                self.set_reg(a, Value::float(f));
            }
            Opcode::LoadNil => self.set_reg(a, Value::NIL),
            Opcode::LoadFunc => {
                let index = ins.bx() as usize;
                if index >= self.program.functions.len() {
                    return Err(VmError::InvalidFunction { index });
                }
                self.set_reg(a, Value::callable(index as u32));
            }
            Opcode::Move => self.set_reg(a, self.reg(b)),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let result = arith(op, self.reg(b), self.reg(c))?;
                self.set_reg(a, result);
            }
            Opcode::Neg => {
                let value = self.reg(b);
                let result = match value.kind() {
                    ValueKind::Int(n) => Value::int(n.wrapping_neg()),
                    ValueKind::Float(f) => Value::float(-f),
                    _ => return Err(VmError::expected("NEG", Tag::Int, value.tag())),
                };
                self.set_reg(a, result);
            }
            Opcode::Eq => {
                let eq = values_equal(self.reg(b), self.reg(c));
                self.set_reg(a, Value::int(eq as i32));
            }
            Opcode::Neq => {
                let eq = values_equal(self.reg(b), self.reg(c));
                self.set_reg(a, Value::int(!eq as i32));
            }
            Opcode::Lt | Opcode::Le => {
                let result = compare(op, self.reg(b), self.reg(c))?;
                self.set_reg(a, Value::int(result as i32));
            }
            Opcode::Jmp => self.jump(ins, ip)?,
            Opcode::JmpT => {
                if self.reg(a).is_truthy() {
                    self.jump(ins, ip)?;
                }
            }
            Opcode::JmpF => {
                if !self.reg(a).is_truthy() {
                    self.jump(ins, ip)?;
                }
            }
            Opcode::Call => self.call(b as usize, a as usize, c)?,
            Opcode::InvokeDynamic => {
                let callee = self.reg(b);
                match callee.kind() {
                    ValueKind::Callable(index) => self.call(index as usize, a as usize, c)?,
                    _ => return Err(VmError::NotCallable { found: callee.tag() }),
                }
            }
            Opcode::NativeCall => self.native_call(a, b as usize, c)?,
            Opcode::Return => return Ok(self.return_value(self.reg(a))),
            Opcode::ReturnNil => return Ok(self.return_value(Value::NIL)),
            Opcode::NewArray => {
                let len = self.reg(b);
                let n = len
                    .as_int()
                    .ok_or(VmError::expected("NEWARRAY", Tag::Int, len.tag()))?;
                if n < 0 {
                    return Err(VmError::NegativeLength { len: n });
                }
                self.maybe_collect();
                let index = self.heap.alloc_array(n as usize)?;
                self.set_reg(a, Value::object(index));
            }
            Opcode::GetElem => {
                let array = self.array_operand("GETELEM", self.reg(b))?;
                let index = self.index_operand("GETELEM", self.reg(c))?;
                let value = self.heap.get(array, index)?;
                self.set_reg(a, value);
            }
            Opcode::SetElem => {
                let array = self.array_operand("SETELEM", self.reg(a))?;
                let index = self.index_operand("SETELEM", self.reg(b))?;
                let value = self.reg(c);
                self.heap.set(array, index, value)?;
            }
            Opcode::Len => {
                let array = self.array_operand("LEN", self.reg(b))?;
                let len = self.heap.len(array)?;
                self.set_reg(a, Value::int(len as i32));
            }
        }
        Ok(Flow::Continue)
    }

    fn array_operand(&self, op: &'static str, value: Value) -> VmResult<u32> {
        value
            .as_object()
            .ok_or(VmError::expected(op, Tag::Object, value.tag()))
    }

    fn index_operand(&self, op: &'static str, value: Value) -> VmResult<i32> {
        value
            .as_int()
            .ok_or(VmError::expected(op, Tag::Int, value.tag()))
    }

    fn jump(&mut self, ins: Instruction, ip: usize) -> VmResult<()> {
        let target = ins.jump_target(ip);
        if target < 0 || target as usize >= self.program.code.len() {
            return Err(VmError::IpOutOfRange { ip: target });
        }
        self.ip = target as usize;
        Ok(())
    }

    /// Pop the current frame and deliver `value` to the caller's register 0.
    fn return_value(&mut self, value: Value) -> Flow {
        match self.frames.pop() {
            Some(frame) => {
                self.ip = frame.return_ip;
                self.fp = frame.base_ptr;
                self.current = frame.function;
                self.registers[self.fp] = value;
                Flow::Continue
            }
            None => Flow::Halt(value),
        }
    }

    fn call(&mut self, index: usize, a: usize, argc: u32) -> VmResult<()> {
        let func = self
            .program
            .functions
            .get(index)
            .ok_or(VmError::InvalidFunction { index })?;
        if argc != func.arity as u32 {
            return Err(VmError::ArityMismatch {
                name: func.name.clone(),
                expected: func.arity,
                got: argc,
            });
        }
        let new_fp = self.fp + a;
        let needed = new_fp + func.register_count;
        if needed > self.registers.len() {
            return Err(VmError::RegisterOverflow {
                needed,
                available: self.registers.len(),
            });
        }
        if self.frames.len() >= self.max_call_depth {
            return Err(VmError::StackOverflow {
                depth: self.frames.len(),
            });
        }

        self.maybe_collect();

        let func = &mut self.program.functions[index];
        func.hotness = func.hotness.saturating_add(1);
        let entry = func.entry_point;

        #[cfg(feature = "jit")]
        {
            self.maybe_compile(index);
            if let Some(result) = self.call_compiled(index, new_fp, argc as usize, needed) {
                self.registers[self.fp] = result;
                return Ok(());
            }
        }

        self.frames.push(CallFrame {
            return_ip: self.ip,
            base_ptr: self.fp,
            function: self.current,
        });
        self.fp = new_fp;
        self.current = Some(index);
        self.ip = entry;
        Ok(())
    }

    /// Run the native tier of `index`, if any. `None` means "interpret the call":
    /// either there is no native code or it bailed out, in which case the
    /// argument window has been restored.
    #[cfg(feature = "jit")]
    fn call_compiled(&mut self, index: usize, new_fp: usize, argc: usize, end: usize) -> Option<Value> {
        let Tier::Compiled(code) = &self.tiers[index] else {
            return None;
        };

        self.saved_args.clear();
        self.saved_args
            .extend_from_slice(&self.registers[new_fp..new_fp + argc]);

        let result = code.invoke(&mut self.registers[new_fp..end]);
        if !result.is_bailout() {
            return Some(result);
        }

        self.registers[new_fp..new_fp + argc].copy_from_slice(&self.saved_args);
        self.stats.bailouts += 1;
        debug!(
            function = %self.program.functions[index].name,
            "bailout, re-dispatching to interpreter"
        );
        None
    }

    #[cfg(feature = "jit")]
    fn maybe_compile(&mut self, index: usize) {
        if !self.jit_enabled || !matches!(self.tiers[index], Tier::Interpreted) {
            return;
        }
        let func = &self.program.functions[index];
        if func.hotness <= self.jit_threshold {
            return;
        }
        debug!(function = %func.name, hotness = func.hotness, "hot function detected");

        match jit::compile(&self.program, index) {
            Ok(code) => {
                debug!(
                    function = %self.program.functions[index].name,
                    bytes = code.code_size(),
                    "compiled"
                );
                self.tiers[index] = Tier::Compiled(code);
                self.stats.jit_compiled += 1;
            }
            Err(abort) => {
                debug!(
                    function = %self.program.functions[index].name,
                    %abort,
                    "compilation aborted"
                );
                self.tiers[index] = Tier::Aborted;
                self.stats.jit_aborted += 1;
            }
        }
    }

    fn native_call(&mut self, a: u32, index: usize, argc: u32) -> VmResult<()> {
        let native = self.natives.get(index)?;
        let start = self.fp + a as usize;
        let end = start + argc as usize;
        if end > self.registers.len() {
            return Err(VmError::RegisterOverflow {
                needed: end,
                available: self.registers.len(),
            });
        }

        let result = {
            let mut ctx = NativeContext {
                heap: &mut self.heap,
                output: &mut *self.output,
            };
            (native.func)(&mut ctx, &self.registers[start..end])?
        };
        self.stats.native_calls += 1;

        if let Some(value) = result {
            if a > 0 {
                self.set_reg(a - 1, value);
            }
        }
        Ok(())
    }
}

/// Int/float polymorphic arithmetic shared by every tier.
pub(crate) fn arith(op: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Int(x), ValueKind::Int(y)) => {
            let n = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div if y == 0 => return Err(VmError::DivisionByZero),
                Opcode::Div => x.wrapping_div(y),
                Opcode::Mod if y == 0 => return Err(VmError::DivisionByZero),
                Opcode::Mod => x.wrapping_rem(y),
                _ => unreachable!("not an arithmetic opcode: {}", op),
            };
            Ok(Value::int(n))
        }
        (
            ValueKind::Int(_) | ValueKind::Float(_),
            ValueKind::Int(_) | ValueKind::Float(_),
        ) => {
            let (x, y) = (as_f32(lhs), as_f32(rhs));
            let f = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                Opcode::Mod if y == 0.0 => return Err(VmError::DivisionByZero),
                Opcode::Mod => x % y,
                _ => unreachable!("not an arithmetic opcode: {}", op),
            };
            Ok(Value::float(f))
        }
        _ => Err(VmError::mismatch(op.mnemonic(), lhs.tag(), rhs.tag())),
    }
}

fn as_f32(value: Value) -> f32 {
    match value.kind() {
        ValueKind::Int(n) => n as f32,
        ValueKind::Float(f) => f,
        _ => f32::NAN,
    }
}

/// `EQ`: mismatched tags are unequal; floats compare by IEEE `==`.
pub(crate) fn values_equal(lhs: Value, rhs: Value) -> bool {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Float(x), ValueKind::Float(y)) => x == y,
        _ => lhs.tag() == rhs.tag() && lhs.payload() == rhs.payload(),
    }
}

fn compare(op: Opcode, lhs: Value, rhs: Value) -> VmResult<bool> {
    let less_equal = op == Opcode::Le;
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Int(x), ValueKind::Int(y)) => Ok(if less_equal { x <= y } else { x < y }),
        (ValueKind::Float(x), ValueKind::Float(y)) => Ok(if less_equal { x <= y } else { x < y }),
        _ => Err(VmError::mismatch(op.mnemonic(), lhs.tag(), rhs.tag())),
    }
}
