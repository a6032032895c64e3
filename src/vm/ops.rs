//! Instruction set and the 32-bit instruction encoding.
//!
//! ```text
//!  31      26 25         18 17           9 8            0
//! +----------+-------------+--------------+--------------+
//! |  opcode  |      A      |      B       |      C       |
//! +----------+-------------+--------------+--------------+
//! |  opcode  |      A      |             Bx              |
//! +----------+-------------+-----------------------------+
//! ```
//!
//! Jump offsets live in `Bx` biased by [`J_ZERO`].

use std::fmt;

pub const A_BITS: u32 = 8;
pub const B_BITS: u32 = 9;
pub const C_BITS: u32 = 9;
pub const BX_BITS: u32 = B_BITS + C_BITS;

pub const C_SHIFT: u32 = 0;
pub const B_SHIFT: u32 = C_SHIFT + C_BITS;
pub const A_SHIFT: u32 = B_SHIFT + B_BITS;
pub const OPCODE_SHIFT: u32 = A_SHIFT + A_BITS;

pub const MAX_A: u32 = (1 << A_BITS) - 1;
pub const MAX_B: u32 = (1 << B_BITS) - 1;
pub const MAX_C: u32 = (1 << C_BITS) - 1;
pub const MAX_BX: u32 = (1 << BX_BITS) - 1;

/// Bias added to signed jump offsets so they fit the unsigned `Bx` field.
pub const J_ZERO: u32 = MAX_BX >> 1;

pub const MIN_JUMP: i32 = -(J_ZERO as i32);
pub const MAX_JUMP: i32 = (MAX_BX - J_ZERO) as i32;

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    None,
    /// `A` only.
    A,
    /// `A B`.
    AB,
    /// `A B C`.
    ABC,
    /// `A Bx` with an unsigned immediate/index.
    ABx,
    /// Biased jump offset only.
    SBx,
    /// `A` plus a biased jump offset.
    ASBx,
}

macro_rules! opcodes {
    ($($name:ident = $num:literal, $mnemonic:literal, $format:ident;)*) => {
        /// Opcodes of the register VM. The numeric values are the binary contract.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $num,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u8(raw: u8) -> Option<Opcode> {
                match raw {
                    $($num => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $(Opcode::$name => Format::$format,)*
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Opcode> {
                let upper = name.to_ascii_uppercase();
                Opcode::ALL.iter().copied().find(|op| op.mnemonic() == upper)
            }
        }
    };
}

opcodes! {
    Halt = 0, "HALT", None;
    LoadInt = 1, "LOADINT", ABx;
    LoadFloat = 2, "LOADFLOAT", ABx;
    LoadNil = 3, "LOADNIL", A;
    LoadFunc = 4, "LOADFUNC", ABx;
    Move = 5, "MOVE", AB;
    Add = 6, "ADD", ABC;
    Sub = 7, "SUB", ABC;
    Mul = 8, "MUL", ABC;
    Div = 9, "DIV", ABC;
    Mod = 10, "MOD", ABC;
    Neg = 11, "NEG", AB;
    Eq = 12, "EQ", ABC;
    Neq = 13, "NEQ", ABC;
    Lt = 14, "LT", ABC;
    Le = 15, "LE", ABC;
    Jmp = 16, "JMP", SBx;
    JmpT = 17, "JMPT", ASBx;
    JmpF = 18, "JMPF", ASBx;
    Call = 19, "CALL", ABC;
    InvokeDynamic = 20, "INVOKEDYNAMIC", ABC;
    NativeCall = 21, "NATIVE_CALL", ABC;
    Return = 22, "RETURN", A;
    ReturnNil = 23, "RETURNNIL", None;
    NewArray = 24, "NEWARRAY", AB;
    GetElem = 25, "GETELEM", ABC;
    SetElem = 26, "SETELEM", ABC;
    Len = 27, "LEN", AB;
}

impl Opcode {
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::JmpT | Opcode::JmpF)
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(self, Opcode::JmpT | Opcode::JmpF)
    }

    /// Control never falls through to the next instruction.
    pub fn is_unconditional_transfer(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::Return | Opcode::ReturnNil | Opcode::Halt
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One encoded 32-bit instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u32);

impl Instruction {
    pub const fn from_raw(word: u32) -> Self {
        Instruction(word)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Encode an `A B C` instruction. Fields are masked to their widths;
    /// range checking is the emitter's job.
    pub const fn abc(op: Opcode, a: u32, b: u32, c: u32) -> Self {
        Instruction(
            ((op as u32) << OPCODE_SHIFT)
                | ((a & MAX_A) << A_SHIFT)
                | ((b & MAX_B) << B_SHIFT)
                | ((c & MAX_C) << C_SHIFT),
        )
    }

    pub const fn abx(op: Opcode, a: u32, bx: u32) -> Self {
        Instruction(((op as u32) << OPCODE_SHIFT) | ((a & MAX_A) << A_SHIFT) | (bx & MAX_BX))
    }

    /// Encode a jump with an already validated signed offset.
    pub const fn asbx(op: Opcode, a: u32, offset: i32) -> Self {
        Instruction::abx(op, a, (offset + J_ZERO as i32) as u32)
    }

    pub const fn raw_opcode(self) -> u8 {
        (self.0 >> OPCODE_SHIFT) as u8
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_u8(self.raw_opcode())
    }

    pub const fn a(self) -> u32 {
        (self.0 >> A_SHIFT) & MAX_A
    }

    pub const fn b(self) -> u32 {
        (self.0 >> B_SHIFT) & MAX_B
    }

    pub const fn c(self) -> u32 {
        (self.0 >> C_SHIFT) & MAX_C
    }

    pub const fn bx(self) -> u32 {
        self.0 & MAX_BX
    }

    /// Signed jump offset (`Bx - J_ZERO`).
    pub const fn sbx(self) -> i32 {
        self.bx() as i32 - J_ZERO as i32
    }

    /// Absolute target of a jump located at `index`.
    pub fn jump_target(self, index: usize) -> i64 {
        index as i64 + 1 + self.sbx() as i64
    }
}

/// Offset stored in a jump at `index` that lands on `target`, if it fits.
pub fn jump_offset(index: usize, target: usize) -> Option<i32> {
    let offset = target as i64 - index as i64 - 1;
    if (MIN_JUMP as i64..=MAX_JUMP as i64).contains(&offset) {
        Some(offset as i32)
    } else {
        None
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{}", DisplayOperands(*self, op)),
            None => write!(f, "<invalid {:#010x}>", self.0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct DisplayOperands(Instruction, Opcode);

impl fmt::Display for DisplayOperands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let DisplayOperands(ins, op) = *self;
        match op.format() {
            Format::None => write!(f, "{}", op),
            Format::A => write!(f, "{} r{}", op, ins.a()),
            Format::AB => write!(f, "{} r{}, r{}", op, ins.a(), ins.b()),
            Format::ABC => write!(f, "{} {}, {}, {}", op, ins.a(), ins.b(), ins.c()),
            Format::ABx => write!(f, "{} r{}, #{}", op, ins.a(), ins.bx()),
            Format::SBx => write!(f, "{} {:+}", op, ins.sbx()),
            Format::ASBx => write!(f, "{} r{}, {:+}", op, ins.a(), ins.sbx()),
        }
    }
}
