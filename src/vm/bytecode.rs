//! Binary program image serialization/deserialization.
//!
//! Binary format (all integers little-endian):
//! - Magic: "TIER" (4 bytes)
//! - Version: u32
//! - Int pool: count + i32 values
//! - Float pool: count + f32 bit patterns
//! - Functions: count + (name, arity u8, entry u32, size u32)
//! - Code: count + u32 instruction words
//! - Entry point: u32

use std::io::{self, Read, Write};

use super::{Function, Instruction, Program, ProgramError};

/// Magic bytes for tiervm images
pub const MAGIC: &[u8; 4] = b"TIER";

/// Current image format version
pub const VERSION: u32 = 1;

/// Upper bound on up-front allocation while reading counts.
const PREALLOC_LIMIT: usize = 4096;

/// Error type for image operations
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid opcode {opcode} in instruction {index}")]
    InvalidOpcode { index: usize, opcode: u8 },
    #[error("invalid UTF-8 in function name")]
    InvalidUtf8,
    #[error("trailing bytes after the entry point")]
    TrailingData,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// Whether `data` starts with the image magic.
pub fn is_image(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Serialize a Program to bytes
pub fn serialize(program: &Program) -> Vec<u8> {
    let mut buf = Vec::new();
    write_program(&mut buf, program).expect("writing to Vec cannot fail");
    buf
}

/// Deserialize a Program from bytes
pub fn deserialize(data: &[u8]) -> Result<Program, ImageError> {
    let mut cursor = io::Cursor::new(data);
    let program = read_program(&mut cursor)?;
    if cursor.position() as usize != data.len() {
        return Err(ImageError::TrailingData);
    }
    Ok(program)
}

/// Write a Program to a writer
pub fn write_program<W: Write>(w: &mut W, program: &Program) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;

    write_u32(w, program.ints.len() as u32)?;
    for &n in &program.ints {
        w.write_all(&n.to_le_bytes())?;
    }

    write_u32(w, program.floats.len() as u32)?;
    for &f in &program.floats {
        write_u32(w, f.to_bits())?;
    }

    write_u32(w, program.functions.len() as u32)?;
    for func in &program.functions {
        write_function(w, func)?;
    }

    write_u32(w, program.code.len() as u32)?;
    for ins in &program.code {
        write_u32(w, ins.raw())?;
    }

    write_u32(w, program.entry_point as u32)
}

/// Read a Program from a reader. Register counts are recomputed.
pub fn read_program<R: Read>(r: &mut R) -> Result<Program, ImageError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| ImageError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(ImageError::InvalidMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let count = read_u32(r)? as usize;
    let mut ints = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for _ in 0..count {
        ints.push(read_u32(r)? as i32);
    }

    let count = read_u32(r)? as usize;
    let mut floats = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for _ in 0..count {
        floats.push(f32::from_bits(read_u32(r)?));
    }

    let count = read_u32(r)? as usize;
    let mut functions = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for _ in 0..count {
        functions.push(read_function(r)?);
    }

    let count = read_u32(r)? as usize;
    let mut code = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for index in 0..count {
        let ins = Instruction::from_raw(read_u32(r)?);
        if ins.opcode().is_none() {
            return Err(ImageError::InvalidOpcode {
                index,
                opcode: ins.raw_opcode(),
            });
        }
        code.push(ins);
    }

    let entry_point = read_u32(r)? as usize;
    Ok(Program::new(ints, floats, functions, code, entry_point)?)
}

fn write_function<W: Write>(w: &mut W, func: &Function) -> io::Result<()> {
    write_string(w, &func.name)?;
    w.write_all(&[func.arity])?;
    write_u32(w, func.entry_point as u32)?;
    write_u32(w, func.code_size as u32)
}

fn read_function<R: Read>(r: &mut R) -> Result<Function, ImageError> {
    let name = read_string(r)?;
    let arity = read_u8(r)?;
    let entry_point = read_u32(r)? as usize;
    let code_size = read_u32(r)? as usize;
    Ok(Function::new(name, arity, entry_point, code_size))
}

// Helper functions for reading/writing primitives

fn read_u8<R: Read>(r: &mut R) -> Result<u8, ImageError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| ImageError::UnexpectedEof)?;
    Ok(buf[0])
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, ImageError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| ImageError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, ImageError> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(ImageError::UnexpectedEof);
    }
    String::from_utf8(buf).map_err(|_| ImageError::InvalidUtf8)
}
