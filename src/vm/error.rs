use super::value::Tag;

/// Broad classification of a fatal VM error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operand of the wrong type.
    Type,
    /// A resource bound or index was violated.
    Resource,
    /// Arithmetic fault.
    Arithmetic,
    /// Raised by a host function.
    Host,
}

/// Fatal error raised while executing a program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("type mismatch in {op}: {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: Tag,
        rhs: Tag,
    },
    #[error("{op} expects {expected}, got {found}")]
    UnexpectedType {
        op: &'static str,
        expected: Tag,
        found: Tag,
    },
    #[error("value of type {found} is not callable")]
    NotCallable { found: Tag },
    #[error("division by zero")]
    DivisionByZero,
    #[error("call stack overflow (depth {depth})")]
    StackOverflow { depth: usize },
    #[error("register array overflow: frame needs {needed} registers, {available} available")]
    RegisterOverflow { needed: usize, available: usize },
    #[error("invalid function index {index}")]
    InvalidFunction { index: usize },
    #[error("invalid integer constant index {index}")]
    InvalidIntConstant { index: usize },
    #[error("invalid float constant index {index}")]
    InvalidFloatConstant { index: usize },
    #[error("invalid native function index {index}")]
    InvalidNative { index: usize },
    #[error("dangling heap index {index}")]
    InvalidHeapIndex { index: u32 },
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("negative array length {len}")]
    NegativeLength { len: i32 },
    #[error("cannot allocate array of length {len}")]
    ArrayTooLarge { len: usize },
    #[error("function '{name}' expects {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: u8,
        got: u32,
    },
    #[error("invalid opcode {opcode} at ip {ip}")]
    InvalidOpcode { opcode: u8, ip: usize },
    #[error("instruction pointer {ip} is outside the code")]
    IpOutOfRange { ip: i64 },
    #[error("{name}: {message}")]
    Host { name: &'static str, message: String },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::TypeMismatch { .. }
            | VmError::UnexpectedType { .. }
            | VmError::NotCallable { .. } => ErrorKind::Type,
            VmError::DivisionByZero => ErrorKind::Arithmetic,
            VmError::Host { .. } => ErrorKind::Host,
            VmError::StackOverflow { .. }
            | VmError::RegisterOverflow { .. }
            | VmError::InvalidFunction { .. }
            | VmError::InvalidIntConstant { .. }
            | VmError::InvalidFloatConstant { .. }
            | VmError::InvalidNative { .. }
            | VmError::InvalidHeapIndex { .. }
            | VmError::IndexOutOfBounds { .. }
            | VmError::NegativeLength { .. }
            | VmError::ArrayTooLarge { .. }
            | VmError::ArityMismatch { .. }
            | VmError::InvalidOpcode { .. }
            | VmError::IpOutOfRange { .. } => ErrorKind::Resource,
        }
    }

    pub(crate) fn mismatch(op: &'static str, lhs: Tag, rhs: Tag) -> Self {
        VmError::TypeMismatch { op, lhs, rhs }
    }

    pub(crate) fn expected(op: &'static str, expected: Tag, found: Tag) -> Self {
        VmError::UnexpectedType {
            op,
            expected,
            found,
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;
