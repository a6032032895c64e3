use std::fmt;

/// Type tags stored in the high word of a [`Value`].
///
/// The numeric values are shared with JIT-generated code and must not change.
pub mod tags {
    pub const TAG_INT: u32 = 0;
    pub const TAG_FLOAT: u32 = 1;
    pub const TAG_NIL: u32 = 2;
    /// `NIL + 1`: out-of-band signal from native code, never a program value.
    pub const TAG_BAILOUT: u32 = TAG_NIL + 1;
    pub const TAG_CALLABLE: u32 = 4;
    pub const TAG_OBJECT: u32 = 5;

    /// GC mark bit, kept in the tag word of a heap block's header slot.
    pub const MARK_BIT: u32 = 1 << 31;
}

/// Decoded type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    Int = tags::TAG_INT,
    Float = tags::TAG_FLOAT,
    Nil = tags::TAG_NIL,
    Bailout = tags::TAG_BAILOUT,
    Callable = tags::TAG_CALLABLE,
    Object = tags::TAG_OBJECT,
}

impl Tag {
    pub fn from_u32(raw: u32) -> Option<Tag> {
        match raw {
            tags::TAG_INT => Some(Tag::Int),
            tags::TAG_FLOAT => Some(Tag::Float),
            tags::TAG_NIL => Some(Tag::Nil),
            tags::TAG_BAILOUT => Some(Tag::Bailout),
            tags::TAG_CALLABLE => Some(Tag::Callable),
            tags::TAG_OBJECT => Some(Tag::Object),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::Nil => "nil",
            Tag::Bailout => "bailout",
            Tag::Callable => "callable",
            Tag::Object => "array",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 64-bit tagged value.
///
/// Layout: `(tag << 32) | payload`. The payload is an `i32`, the bits of an
/// `f32`, a function-table index or a heap index depending on the tag. The
/// layout is `repr(transparent)` over `u64` so the register array can be
/// handed to JIT code as a plain pointer.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

/// Safe view of a [`Value`] for exhaustive matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    Int(i32),
    Float(f32),
    Nil,
    Callable(u32),
    Object(u32),
    Bailout,
}

impl Value {
    pub const NIL: Value = Value::pack(tags::TAG_NIL, 0);
    pub const BAILOUT: Value = Value::pack(tags::TAG_BAILOUT, 0);

    pub const fn pack(tag: u32, payload: u32) -> Value {
        Value(((tag as u64) << 32) | payload as u64)
    }

    pub const fn int(n: i32) -> Value {
        Value::pack(tags::TAG_INT, n as u32)
    }

    pub fn float(f: f32) -> Value {
        Value::pack(tags::TAG_FLOAT, f.to_bits())
    }

    pub const fn callable(index: u32) -> Value {
        Value::pack(tags::TAG_CALLABLE, index)
    }

    pub const fn object(index: u32) -> Value {
        Value::pack(tags::TAG_OBJECT, index)
    }

    pub const fn from_bits(bits: u64) -> Value {
        Value(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Raw tag word, including the mark bit.
    pub const fn raw_tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn payload(self) -> u32 {
        self.0 as u32
    }

    /// Unknown tags decode as [`Tag::Bailout`]: they can only come from
    /// native code and are never legitimate program values.
    pub fn tag(self) -> Tag {
        Tag::from_u32(self.raw_tag() & !tags::MARK_BIT).unwrap_or(Tag::Bailout)
    }

    pub fn kind(self) -> ValueKind {
        match self.tag() {
            Tag::Int => ValueKind::Int(self.payload() as i32),
            Tag::Float => ValueKind::Float(f32::from_bits(self.payload())),
            Tag::Nil => ValueKind::Nil,
            Tag::Callable => ValueKind::Callable(self.payload()),
            Tag::Object => ValueKind::Object(self.payload()),
            Tag::Bailout => ValueKind::Bailout,
        }
    }

    pub fn is_marked(self) -> bool {
        self.raw_tag() & tags::MARK_BIT != 0
    }

    pub fn with_mark(self, marked: bool) -> Value {
        let tag = if marked {
            self.raw_tag() | tags::MARK_BIT
        } else {
            self.raw_tag() & !tags::MARK_BIT
        };
        Value::pack(tag, self.payload())
    }

    pub fn is_nil(self) -> bool {
        self.tag() == Tag::Nil
    }

    pub fn is_bailout(self) -> bool {
        self.tag() == Tag::Bailout
    }

    pub fn as_int(self) -> Option<i32> {
        match self.kind() {
            ValueKind::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<u32> {
        match self.kind() {
            ValueKind::Object(index) => Some(index),
            _ => None,
        }
    }

    pub fn is_truthy(self) -> bool {
        match self.kind() {
            ValueKind::Int(n) => n != 0,
            ValueKind::Float(f) => f != 0.0,
            ValueKind::Nil | ValueKind::Bailout => false,
            ValueKind::Callable(_) | ValueKind::Object(_) => true,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NIL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Int(n) => write!(f, "Int({})", n),
            ValueKind::Float(x) => write!(f, "Float({})", x),
            ValueKind::Nil => write!(f, "Nil"),
            ValueKind::Callable(i) => write!(f, "Callable({})", i),
            ValueKind::Object(i) => write!(f, "Object({})", i),
            ValueKind::Bailout => write!(f, "Bailout({:#018x})", self.0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Int(n) => write!(f, "{}", n),
            ValueKind::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{}.0", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            ValueKind::Nil => write!(f, "nil"),
            ValueKind::Callable(i) => write!(f, "<fn #{}>", i),
            ValueKind::Object(i) => write!(f, "<array #{}>", i),
            ValueKind::Bailout => write!(f, "<bailout>"),
        }
    }
}
