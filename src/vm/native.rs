//! Host functions callable through `NATIVE_CALL`.

use std::io::Write;

use super::error::{VmError, VmResult};
use super::heap::Heap;
use super::value::{Value, ValueKind};

/// What a host function sees of the VM.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub output: &'a mut dyn Write,
}

/// Signature of a host function. `Ok(None)` means "no value".
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> VmResult<Option<Value>>;

#[derive(Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub func: NativeFn,
}

pub const PRINT: usize = 0;
pub const TO_FLOAT: usize = 1;
pub const TO_INT: usize = 2;
pub const SQRT: usize = 3;

/// Host functions installed in every new VM, in index order.
pub const DEFAULT_NATIVES: &[Native] = &[
    Native {
        name: "print",
        func: native_print,
    },
    Native {
        name: "to_float",
        func: native_to_float,
    },
    Native {
        name: "to_int",
        func: native_to_int,
    },
    Native {
        name: "sqrt",
        func: native_sqrt,
    },
];

/// Index of a default host function by name.
pub fn default_index(name: &str) -> Option<usize> {
    DEFAULT_NATIVES.iter().position(|n| n.name == name)
}

/// Host function table indexed by `NATIVE_CALL`'s B operand.
#[derive(Clone)]
pub struct NativeRegistry {
    entries: Vec<Option<Native>>,
}

impl NativeRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self {
            entries: DEFAULT_NATIVES.iter().copied().map(Some).collect(),
        }
    }

    /// Install `func` at `index`, replacing any previous entry.
    pub fn register(&mut self, index: usize, name: &'static str, func: NativeFn) {
        if self.entries.len() <= index {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(Native { name, func });
    }

    pub fn get(&self, index: usize) -> VmResult<Native> {
        self.entries
            .get(index)
            .copied()
            .flatten()
            .ok_or(VmError::InvalidNative { index })
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn expect_args(name: &'static str, args: &[Value], n: usize) -> VmResult<()> {
    if args.len() != n {
        return Err(VmError::Host {
            name,
            message: format!("expected {} argument(s), got {}", n, args.len()),
        });
    }
    Ok(())
}

fn not_numeric(name: &'static str, value: Value) -> VmError {
    VmError::Host {
        name,
        message: format!("expected a number, got {}", value.tag()),
    }
}

const PRINT_DEPTH: usize = 8;

/// Render a value, expanding arrays through the heap.
pub fn format_value(heap: &Heap, value: Value) -> String {
    let mut out = String::new();
    write_value(heap, value, 0, &mut out);
    out
}

fn write_value(heap: &Heap, value: Value, depth: usize, out: &mut String) {
    let ValueKind::Object(index) = value.kind() else {
        out.push_str(&value.to_string());
        return;
    };
    let Ok(elements) = heap.elements(index) else {
        out.push_str(&value.to_string());
        return;
    };
    if depth >= PRINT_DEPTH {
        out.push_str("[...]");
        return;
    }
    out.push('[');
    for (i, elem) in elements.into_iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_value(heap, elem, depth + 1, out);
    }
    out.push(']');
}

fn native_print(ctx: &mut NativeContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
    let line = args
        .iter()
        .map(|&v| format_value(ctx.heap, v))
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(ctx.output, "{}", line).map_err(|e| VmError::Host {
        name: "print",
        message: e.to_string(),
    })?;
    Ok(None)
}

fn native_to_float(_ctx: &mut NativeContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
    expect_args("to_float", args, 1)?;
    match args[0].kind() {
        ValueKind::Int(n) => Ok(Some(Value::float(n as f32))),
        ValueKind::Float(_) => Ok(Some(args[0])),
        _ => Err(not_numeric("to_float", args[0])),
    }
}

fn native_to_int(_ctx: &mut NativeContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
    expect_args("to_int", args, 1)?;
    match args[0].kind() {
        ValueKind::Int(_) => Ok(Some(args[0])),
        // `as` truncates toward zero and saturates; NaN becomes 0.
        ValueKind::Float(f) => Ok(Some(Value::int(f as i32))),
        _ => Err(not_numeric("to_int", args[0])),
    }
}

fn native_sqrt(_ctx: &mut NativeContext<'_>, args: &[Value]) -> VmResult<Option<Value>> {
    expect_args("sqrt", args, 1)?;
    let x = match args[0].kind() {
        ValueKind::Int(n) => n as f32,
        ValueKind::Float(f) => f,
        _ => return Err(not_numeric("sqrt", args[0])),
    };
    Ok(Some(Value::float(x.sqrt())))
}
