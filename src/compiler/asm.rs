//! Text assembly listings.
//!
//! ```text
//! ; sum 1..n
//! .func main 0
//!     LOADINT r1, 100
//!     CALL r1, sum, 1
//!     RETURN r0
//! .end
//!
//! .func sum 1
//!     LOADINT r1, 0
//!     LOADINT r2, 1
//! loop:
//!     JMPF r0, done
//!     ADD r1, r1, r0
//!     SUB r0, r0, r2
//!     JMP loop
//! done:
//!     RETURN r1
//! .end
//! ```
//!
//! Registers are written `rN`. `LOADINT`/`LOADFLOAT` take literals,
//! `CALL`/`LOADFUNC` take function names (forward references are fine),
//! `NATIVE_CALL` takes a host function name or index, jumps take labels.

use std::collections::HashMap;

use super::builder::{EmitError, Label, ProgramBuilder};
use crate::vm::native;
use crate::vm::{Format, Opcode, Program};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct AsmError {
    /// 1-based source line
    pub line: usize,
    pub kind: AsmErrorKind,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AsmErrorKind {
    #[error("unknown mnemonic '{0}'")]
    UnknownMnemonic(String),
    #[error("unknown directive '{0}'")]
    UnknownDirective(String),
    #[error("malformed directive, expected `.func <name> <arity>`")]
    MalformedFunc,
    #[error("{op} takes {expected} operands, found {found}")]
    OperandCount {
        op: Opcode,
        expected: usize,
        found: usize,
    },
    #[error("expected a register like r0, found '{0}'")]
    ExpectedRegister(String),
    #[error("expected an integer, found '{0}'")]
    ExpectedInt(String),
    #[error("expected a float, found '{0}'")]
    ExpectedFloat(String),
    #[error("unknown host function '{0}'")]
    UnknownNative(String),
    #[error("label '{0}' is defined twice")]
    DuplicateLabel(String),
    #[error("label '{0}' is never defined")]
    UndefinedLabel(String),
    #[error("instruction or label outside `.func`")]
    OutsideFunction,
    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Assemble a listing into a program.
pub fn assemble(source: &str) -> Result<Program, AsmError> {
    let mut asm = Assembler::default();
    asm.declare_functions(source)?;
    asm.emit_functions(source)?;
    let end = source.lines().count().max(1);
    asm.builder.finish().map_err(|e| AsmError {
        line: end,
        kind: e.into(),
    })
}

struct LabelInfo {
    label: Label,
    /// Line of the definition, once seen
    defined: Option<usize>,
    first_use: usize,
}

#[derive(Default)]
struct Assembler {
    builder: ProgramBuilder,
    labels: HashMap<String, LabelInfo>,
    /// Line of the open `.func`
    open: Option<usize>,
}

/// A source line without its comment, or `None` if nothing is left.
fn strip(line: &str) -> Option<&str> {
    let code = match line.find(';') {
        Some(i) => &line[..i],
        None => line,
    };
    let code = code.trim();
    (!code.is_empty()).then_some(code)
}

fn parse_func(rest: &str) -> Result<(&str, u8), AsmErrorKind> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(arity), None) => {
            let arity = arity.parse().map_err(|_| AsmErrorKind::MalformedFunc)?;
            Ok((name, arity))
        }
        _ => Err(AsmErrorKind::MalformedFunc),
    }
}

fn register(token: &str) -> Result<u32, AsmErrorKind> {
    token
        .strip_prefix('r')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| AsmErrorKind::ExpectedRegister(token.to_string()))
}

fn number(token: &str) -> Result<u32, AsmErrorKind> {
    token
        .parse()
        .map_err(|_| AsmErrorKind::ExpectedInt(token.to_string()))
}

impl Assembler {
    /// First pass: declare every function so calls may refer forward.
    fn declare_functions(&mut self, source: &str) -> Result<(), AsmError> {
        for (i, line) in source.lines().enumerate() {
            let Some(code) = strip(line) else { continue };
            if let Some(rest) = code.strip_prefix(".func") {
                let at = |kind| AsmError { line: i + 1, kind };
                let (name, arity) = parse_func(rest).map_err(at)?;
                self.builder
                    .declare_function(name, arity)
                    .map_err(|e| at(e.into()))?;
            }
        }
        Ok(())
    }

    fn emit_functions(&mut self, source: &str) -> Result<(), AsmError> {
        for (i, line) in source.lines().enumerate() {
            let Some(code) = strip(line) else { continue };
            self.line(code, i + 1)
                .map_err(|kind| AsmError { line: i + 1, kind })?;
        }
        match self.open {
            Some(line) => {
                let name = source
                    .lines()
                    .nth(line - 1)
                    .and_then(|l| parse_func(l.trim().trim_start_matches(".func")).ok())
                    .map_or_else(String::new, |(name, _)| name.to_string());
                Err(AsmError {
                    line,
                    kind: EmitError::UnterminatedFunction(name).into(),
                })
            }
            None => Ok(()),
        }
    }

    fn line(&mut self, code: &str, line: usize) -> Result<(), AsmErrorKind> {
        if let Some(directive) = code.strip_prefix('.') {
            let (name, rest) = directive
                .split_once(char::is_whitespace)
                .unwrap_or((directive, ""));
            return match name {
                "func" => {
                    let (name, arity) = parse_func(rest)?;
                    self.builder.begin_function(name, arity)?;
                    self.open = Some(line);
                    self.labels.clear();
                    Ok(())
                }
                "end" => self.end_function(),
                other => Err(AsmErrorKind::UnknownDirective(other.to_string())),
            };
        }

        if self.open.is_none() {
            return Err(AsmErrorKind::OutsideFunction);
        }

        if let Some(name) = code.strip_suffix(':') {
            let name = name.trim();
            let label = self.label(name, line)?;
            let info = self.labels.get_mut(name).ok_or(AsmErrorKind::OutsideFunction)?;
            if info.defined.is_some() {
                return Err(AsmErrorKind::DuplicateLabel(name.to_string()));
            }
            info.defined = Some(line);
            self.builder.bind_label(label)?;
            return Ok(());
        }

        let (mnemonic, rest) = code.split_once(char::is_whitespace).unwrap_or((code, ""));
        let op = Opcode::from_mnemonic(&mnemonic.to_ascii_uppercase())
            .ok_or_else(|| AsmErrorKind::UnknownMnemonic(mnemonic.to_string()))?;
        let operands: Vec<&str> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        self.instruction(op, &operands, line)
    }

    fn end_function(&mut self) -> Result<(), AsmErrorKind> {
        if self.open.take().is_none() {
            return Err(AsmErrorKind::OutsideFunction);
        }
        if let Some((name, _)) = self
            .labels
            .iter()
            .filter(|(_, info)| info.defined.is_none())
            .min_by_key(|(_, info)| info.first_use)
        {
            return Err(AsmErrorKind::UndefinedLabel(name.clone()));
        }
        self.builder.end_function()?;
        Ok(())
    }

    fn label(&mut self, name: &str, line: usize) -> Result<Label, AsmErrorKind> {
        if let Some(info) = self.labels.get(name) {
            return Ok(info.label);
        }
        let label = self.builder.new_label()?;
        self.labels.insert(
            name.to_string(),
            LabelInfo {
                label,
                defined: None,
                first_use: line,
            },
        );
        Ok(label)
    }

    fn instruction(&mut self, op: Opcode, operands: &[&str], line: usize) -> Result<(), AsmErrorKind> {
        let expected = match op.format() {
            Format::None => 0,
            Format::A | Format::SBx => 1,
            Format::AB | Format::ABx | Format::ASBx => 2,
            Format::ABC => 3,
        };
        if operands.len() != expected {
            return Err(AsmErrorKind::OperandCount {
                op,
                expected,
                found: operands.len(),
            });
        }

        match op {
            Opcode::LoadInt => {
                let n = operands[1]
                    .parse()
                    .map_err(|_| AsmErrorKind::ExpectedInt(operands[1].to_string()))?;
                self.builder.emit_load_int(register(operands[0])?, n)?;
            }
            Opcode::LoadFloat => {
                let f = operands[1]
                    .parse()
                    .map_err(|_| AsmErrorKind::ExpectedFloat(operands[1].to_string()))?;
                self.builder.emit_load_float(register(operands[0])?, f)?;
            }
            Opcode::LoadFunc => {
                self.builder.emit_load_func(register(operands[0])?, operands[1])?;
            }
            Opcode::Call => {
                self.builder.emit_call(register(operands[0])?, operands[1], number(operands[2])?)?;
            }
            Opcode::NativeCall => {
                let index = match native::default_index(operands[1]) {
                    Some(index) => index as u32,
                    None => number(operands[1])
                        .map_err(|_| AsmErrorKind::UnknownNative(operands[1].to_string()))?,
                };
                self.builder.emit_abc(op, register(operands[0])?, index, number(operands[2])?)?;
            }
            Opcode::InvokeDynamic => {
                self.builder.emit_abc(
                    op,
                    register(operands[0])?,
                    register(operands[1])?,
                    number(operands[2])?,
                )?;
            }
            Opcode::Jmp => {
                let label = self.label(operands[0], line)?;
                self.builder.emit_jump(op, 0, label)?;
            }
            Opcode::JmpT | Opcode::JmpF => {
                let a = register(operands[0])?;
                let label = self.label(operands[1], line)?;
                self.builder.emit_jump(op, a, label)?;
            }
            _ => {
                let mut regs = [0u32; 3];
                for (slot, token) in regs.iter_mut().zip(operands) {
                    *slot = register(token)?;
                }
                self.builder.emit_abc(op, regs[0], regs[1], regs[2])?;
            }
        }
        Ok(())
    }
}
