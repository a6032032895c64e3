//! Baseline JIT compiler for tiervm functions on x86-64.
//!
//! Each bytecode instruction is lowered through a fixed template. Compiled
//! code works directly on the VM register window:
//!
//! - RDI (moved to RBX): pointer to the callee's register 0
//! - `[rbx + 8*r]`: register `r`
//! - RAX: return value
//!
//! Any situation the templates do not handle (mixed operand tags, integer
//! division by zero or -1, float modulo, non-int conditions) jumps to a shared
//! stub that returns the `BAILOUT` sentinel. The VM then restores the
//! arguments and interprets the call from the start.

use tracing::trace;

use super::codebuf::{CodeBuffer, Label};
use super::x86_64::{Cond, Reg, X86_64Assembler};
use super::{CompilationResult, CompiledFunction, JitAbort};
use crate::vm::cfg::{self, Cfg, CfgError};
use crate::vm::{Instruction, Opcode, Program, Value, tags};

/// Register conventions.
///
/// RBX is callee-saved and holds the register window for the whole function.
/// The rest are scratch.
pub mod regs {
    use super::Reg;

    pub const FRAME: Reg = Reg::Rbx;

    pub const TMP0: Reg = Reg::Rax;
    pub const TMP1: Reg = Reg::Rcx;
    pub const TMP2: Reg = Reg::Rdx;
    pub const TMP3: Reg = Reg::Rsi;
}

/// Size of a VM register in bytes.
pub const VALUE_SIZE: i32 = 8;

const FLOAT_TAG_BITS: u64 = (tags::TAG_FLOAT as u64) << 32;

fn slot(r: u32) -> i32 {
    r as i32 * VALUE_SIZE
}

/// JIT compiler for a single function.
pub struct JitCompiler<'p> {
    program: &'p Program,
    buf: CodeBuffer,
    cfg: Cfg,
    /// One label per real basic block, indexed by block id
    blocks: Vec<Label>,
    /// Shared bailout stub
    bailout: Label,
}

impl<'p> JitCompiler<'p> {
    pub fn new(program: &'p Program, code: &[Instruction]) -> Result<Self, CfgError> {
        let cfg = cfg::build(code)?;
        let mut buf = CodeBuffer::with_capacity(code.len() * 32);
        let blocks = cfg.real_blocks().iter().map(|_| buf.new_label()).collect();
        let bailout = buf.new_label();
        Ok(Self {
            program,
            buf,
            cfg,
            blocks,
            bailout,
        })
    }

    /// Compile `code` to native code.
    pub fn compile(mut self, code: &[Instruction], register_count: usize) -> CompilationResult {
        self.emit_prologue();

        for (pos, &ins) in code.iter().enumerate() {
            if let Some(block) = self.cfg.block_at(pos) {
                let label = self.blocks[block];
                self.buf.bind(label);
            }
            self.compile_op(pos, ins)?;
        }

        self.emit_bailout_stub();
        self.buf.patch()?;

        let code_size = self.buf.len();
        let memory = self.buf.finalize()?;
        trace!(bytes = code_size, "emitted native code");
        CompiledFunction::new(memory, register_count, code_size)
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    fn emit_prologue(&mut self) {
        let mut asm = self.asm();
        asm.push(regs::FRAME);
        asm.mov_rr(regs::FRAME, Reg::Rdi);
    }

    fn emit_epilogue(&mut self) {
        let mut asm = self.asm();
        asm.pop(regs::FRAME);
        asm.ret();
    }

    fn emit_bailout_stub(&mut self) {
        let bailout = self.bailout;
        self.buf.bind(bailout);
        self.asm().mov_ri64(regs::TMP0, Value::BAILOUT.to_bits());
        self.emit_epilogue();
    }

    fn load(&mut self, dst: Reg, r: u32) {
        self.asm().mov_rm(dst, regs::FRAME, slot(r));
    }

    fn store(&mut self, r: u32, src: Reg) {
        self.asm().mov_mr(regs::FRAME, slot(r), src);
    }

    /// `dst = src >> 32`, the tag word of a value.
    fn tag_of(&mut self, dst: Reg, src: Reg) {
        let mut asm = self.asm();
        asm.mov_rr(dst, src);
        asm.shr_ri(dst, 32);
    }

    fn jump_label(&self, pos: usize, ins: Instruction) -> Result<Label, JitAbort> {
        let target = ins.jump_target(pos);
        usize::try_from(target)
            .ok()
            .and_then(|t| self.cfg.block_at(t))
            .map(|block| self.blocks[block])
            .ok_or(JitAbort::Cfg(CfgError::JumpOutOfRange { pos, target }))
    }

    fn compile_op(&mut self, pos: usize, ins: Instruction) -> Result<(), JitAbort> {
        let op = ins.opcode().ok_or(JitAbort::Cfg(CfgError::InvalidOpcode {
            pos,
            opcode: ins.raw_opcode(),
        }))?;
        let (a, b, c) = (ins.a(), ins.b(), ins.c());

        match op {
            Opcode::LoadInt => {
                let index = ins.bx() as usize;
                let n = *self
                    .program
                    .ints
                    .get(index)
                    .ok_or(JitAbort::InvalidConstant { pos, index })?;
                self.emit_load_imm(a, Value::int(n));
            }
            Opcode::LoadFloat => {
                let index = ins.bx() as usize;
                let f = *self
                    .program
                    .floats
                    .get(index)
                    .ok_or(JitAbort::InvalidConstant { pos, index })?;
                self.emit_load_imm(a, Value::float(f));
            }
            Opcode::LoadNil => self.emit_load_imm(a, Value::NIL),
            Opcode::LoadFunc => {
                let index = ins.bx() as usize;
                if index >= self.program.functions.len() {
                    return Err(JitAbort::InvalidConstant { pos, index });
                }
                self.emit_load_imm(a, Value::callable(index as u32));
            }
            Opcode::Move => {
                self.load(regs::TMP0, b);
                self.store(a, regs::TMP0);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                self.emit_arith(op, a, b, c)
            }
            Opcode::Neg => self.emit_neg(a, b),
            Opcode::Eq => self.emit_cmp_int(Cond::E, a, b, c),
            Opcode::Neq => self.emit_cmp_int(Cond::Ne, a, b, c),
            Opcode::Lt => self.emit_cmp_int(Cond::L, a, b, c),
            Opcode::Le => self.emit_cmp_int(Cond::Le, a, b, c),
            Opcode::Jmp => {
                let target = self.jump_label(pos, ins)?;
                self.asm().jmp(target);
            }
            Opcode::JmpT | Opcode::JmpF => {
                let target = self.jump_label(pos, ins)?;
                self.emit_cond_jump(op == Opcode::JmpT, a, target);
            }
            Opcode::Return => {
                self.load(regs::TMP0, a);
                self.emit_epilogue();
            }
            Opcode::ReturnNil => {
                self.asm().mov_ri64(regs::TMP0, Value::NIL.to_bits());
                self.emit_epilogue();
            }
            // Calls, heap access and HALT stay in the interpreter.
            Opcode::Call
            | Opcode::InvokeDynamic
            | Opcode::NativeCall
            | Opcode::NewArray
            | Opcode::GetElem
            | Opcode::SetElem
            | Opcode::Len
            | Opcode::Halt => return Err(JitAbort::UnsupportedOpcode { opcode: op, pos }),
        }
        Ok(())
    }

    fn emit_load_imm(&mut self, r: u32, value: Value) {
        self.asm().mov_ri64(regs::TMP0, value.to_bits());
        self.store(r, regs::TMP0);
    }

    /// Load `R[b]` into RAX and `R[c]` into RCX, and bail out unless both
    /// carry the same tag word. Leaves the tag in EDX.
    fn emit_same_tag_operands(&mut self, b: u32, c: u32) {
        self.load(regs::TMP0, b);
        self.load(regs::TMP1, c);
        self.tag_of(regs::TMP2, regs::TMP0);
        self.tag_of(regs::TMP3, regs::TMP1);
        let bailout = self.bailout;
        let mut asm = self.asm();
        asm.cmp_rr(regs::TMP2, regs::TMP3);
        asm.jcc(Cond::Ne, bailout);
    }

    fn emit_arith(&mut self, op: Opcode, a: u32, b: u32, c: u32) {
        self.emit_same_tag_operands(b, c);
        let bailout = self.bailout;
        let mut asm = self.asm();
        let float_path = asm.new_label();
        let done = asm.new_label();

        asm.test_rr32(regs::TMP2, regs::TMP2);
        asm.jcc(Cond::Ne, float_path);

        // INT: dword ops; writing EAX clears the tag word.
        match op {
            Opcode::Add => asm.add_rr32(regs::TMP0, regs::TMP1),
            Opcode::Sub => asm.sub_rr32(regs::TMP0, regs::TMP1),
            Opcode::Mul => asm.imul_rr32(regs::TMP0, regs::TMP1),
            _ => {
                // idiv faults on 0 and on i32::MIN / -1.
                asm.test_rr32(regs::TMP1, regs::TMP1);
                asm.jcc(Cond::E, bailout);
                asm.cmp_ri8_32(regs::TMP1, -1);
                asm.jcc(Cond::E, bailout);
                asm.cdq();
                asm.idiv_r32(regs::TMP1);
                if op == Opcode::Mod {
                    asm.mov_rr32(regs::TMP0, regs::TMP2);
                }
            }
        }
        asm.mov_mr(regs::FRAME, slot(a), regs::TMP0);
        asm.jmp(done);

        asm.bind(float_path);
        asm.cmp_ri8_32(regs::TMP2, tags::TAG_FLOAT as i8);
        asm.jcc(Cond::Ne, bailout);
        if op == Opcode::Mod {
            asm.jmp(bailout);
        } else {
            asm.movd_xmm_r32(0, regs::TMP0);
            asm.movd_xmm_r32(1, regs::TMP1);
            match op {
                Opcode::Add => asm.addss(0, 1),
                Opcode::Sub => asm.subss(0, 1),
                Opcode::Mul => asm.mulss(0, 1),
                _ => asm.divss(0, 1),
            }
            asm.movd_r32_xmm(regs::TMP0, 0);
            asm.mov_ri64(regs::TMP2, FLOAT_TAG_BITS);
            asm.or_rr(regs::TMP0, regs::TMP2);
            asm.mov_mr(regs::FRAME, slot(a), regs::TMP0);
        }
        asm.bind(done);
    }

    fn emit_neg(&mut self, a: u32, b: u32) {
        self.load(regs::TMP0, b);
        self.tag_of(regs::TMP2, regs::TMP0);
        let bailout = self.bailout;
        let mut asm = self.asm();
        let not_int = asm.new_label();
        let done = asm.new_label();

        asm.test_rr32(regs::TMP2, regs::TMP2);
        asm.jcc(Cond::Ne, not_int);
        asm.neg_r32(regs::TMP0);
        asm.jmp(done);

        asm.bind(not_int);
        asm.cmp_ri8_32(regs::TMP2, tags::TAG_FLOAT as i8);
        asm.jcc(Cond::Ne, bailout);
        // Flip the f32 sign bit.
        asm.btc_ri(regs::TMP0, 31);

        asm.bind(done);
        asm.mov_mr(regs::FRAME, slot(a), regs::TMP0);
    }

    /// Integer-only comparison producing INT 0/1.
    fn emit_cmp_int(&mut self, cond: Cond, a: u32, b: u32, c: u32) {
        self.load(regs::TMP0, b);
        self.load(regs::TMP1, c);
        let bailout = self.bailout;
        let mut asm = self.asm();
        asm.mov_rr(regs::TMP2, regs::TMP0);
        asm.or_rr(regs::TMP2, regs::TMP1);
        asm.shr_ri(regs::TMP2, 32);
        asm.jcc(Cond::Ne, bailout);

        asm.xor_rr32(regs::TMP2, regs::TMP2);
        asm.cmp_rr32(regs::TMP0, regs::TMP1);
        asm.setcc(cond, regs::TMP2);
        asm.mov_mr(regs::FRAME, slot(a), regs::TMP2);
    }

    /// `JMPT`/`JMPF` on an INT or NIL condition.
    fn emit_cond_jump(&mut self, if_true: bool, a: u32, target: Label) {
        self.load(regs::TMP0, a);
        self.tag_of(regs::TMP2, regs::TMP0);
        let bailout = self.bailout;
        let mut asm = self.asm();
        let not_int = asm.new_label();
        let done = asm.new_label();

        asm.test_rr32(regs::TMP2, regs::TMP2);
        asm.jcc(Cond::Ne, not_int);
        asm.test_rr32(regs::TMP0, regs::TMP0);
        asm.jcc(if if_true { Cond::Ne } else { Cond::E }, target);
        asm.jmp(done);

        asm.bind(not_int);
        asm.cmp_ri8_32(regs::TMP2, tags::TAG_NIL as i8);
        asm.jcc(Cond::Ne, bailout);
        // NIL is false.
        if !if_true {
            asm.jmp(target);
        }
        asm.bind(done);
    }
}

/// Compile function `index` of `program`.
pub fn compile(program: &Program, index: usize) -> CompilationResult {
    let func = program
        .functions
        .get(index)
        .ok_or(JitAbort::UnknownFunction(index))?;
    let code = program.function_code(index);
    JitCompiler::new(program, code)?.compile(code, func.register_count)
}
