//! Disassembler and other human-readable views of a program.
//!
//! [`listing`] prints text that [`super::asm::assemble`] accepts again.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::vm::cfg::{self, CfgError};
use crate::vm::native::DEFAULT_NATIVES;
use crate::vm::{Format, Instruction, Opcode, Program};

/// Disassemble every function as an assembly listing.
pub fn listing(program: &Program) -> String {
    let mut out = String::new();
    for (index, func) in program.functions.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, ".func {} {}", func.name, func.arity);
        let code = program.function_code(index);
        let labels = jump_labels(code);
        for (pos, &ins) in code.iter().enumerate() {
            if let Some(label) = labels.get(&pos) {
                let _ = writeln!(out, "{label}:");
            }
            let _ = writeln!(out, "    {}", render(program, &labels, pos, ins));
        }
        out.push_str(".end\n");
    }
    out
}

/// Name every in-range jump target of a function: `L0`, `L1`, ... in
/// code order.
fn jump_labels(code: &[Instruction]) -> BTreeMap<usize, String> {
    let mut targets: Vec<usize> = code
        .iter()
        .enumerate()
        .filter(|(_, ins)| ins.opcode().is_some_and(Opcode::is_jump))
        .filter_map(|(pos, ins)| usize::try_from(ins.jump_target(pos)).ok())
        .filter(|&target| target < code.len())
        .collect();
    targets.sort_unstable();
    targets.dedup();
    targets
        .into_iter()
        .enumerate()
        .map(|(i, target)| (target, format!("L{i}")))
        .collect()
}

fn render(program: &Program, labels: &BTreeMap<usize, String>, pos: usize, ins: Instruction) -> String {
    let Some(op) = ins.opcode() else {
        return format!("; invalid instruction {:#010x}", ins.raw());
    };
    let (a, b, c, bx) = (ins.a(), ins.b(), ins.c(), ins.bx() as usize);
    let label = || {
        usize::try_from(ins.jump_target(pos))
            .ok()
            .and_then(|t| labels.get(&t))
            .cloned()
            .unwrap_or_else(|| format!("{:+}", ins.sbx()))
    };
    let function = |index: usize| {
        program
            .functions
            .get(index)
            .map_or_else(|| format!("#{index}"), |f| f.name.clone())
    };

    match op {
        Opcode::LoadInt => match program.ints.get(bx) {
            Some(n) => format!("{op} r{a}, {n}"),
            None => format!("; {op} r{a}, #{bx} (missing constant)"),
        },
        Opcode::LoadFloat => match program.floats.get(bx) {
            Some(f) => format!("{op} r{a}, {f:?}"),
            None => format!("; {op} r{a}, #{bx} (missing constant)"),
        },
        Opcode::LoadFunc => format!("{op} r{a}, {}", function(bx)),
        Opcode::Call => format!("{op} r{a}, {}, {c}", function(b as usize)),
        Opcode::NativeCall => match DEFAULT_NATIVES.get(b as usize) {
            Some(native) => format!("{op} r{a}, {}, {c}", native.name),
            None => format!("{op} r{a}, {b}, {c}"),
        },
        Opcode::InvokeDynamic => format!("{op} r{a}, r{b}, {c}"),
        Opcode::Jmp => format!("{op} {}", label()),
        Opcode::JmpT | Opcode::JmpF => format!("{op} r{a}, {}", label()),
        _ => match op.format() {
            Format::A => format!("{op} r{a}"),
            Format::AB => format!("{op} r{a}, r{b}"),
            Format::ABC => format!("{op} r{a}, r{b}, r{c}"),
            _ => op.to_string(),
        },
    }
}

/// Raw view of the whole code array: index, encoded word, decoded fields.
pub fn raw(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "ints: {:?}\nfloats: {:?}\nentry: {}",
        program.ints, program.floats, program.entry_point
    );
    for (ip, ins) in program.code.iter().enumerate() {
        if let Some(func) = program.functions.iter().find(|f| f.entry_point == ip && f.code_size > 0) {
            let _ = writeln!(
                out,
                "; {} (arity {}, {} registers)",
                func.name, func.arity, func.register_count
            );
        } else if ip == program.entry_point {
            let _ = writeln!(out, "; bootstrap");
        }
        let _ = writeln!(out, "{ip:>6}  {:08x}  {ins}", ins.raw());
    }
    out
}

/// Basic blocks and edges of one function.
pub fn cfg(program: &Program, index: usize) -> Result<String, CfgError> {
    let graph = cfg::build(program.function_code(index))?;
    Ok(format!(
        "; {}\n{}",
        program.functions[index].name, graph
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::asm::assemble;

    const SOURCE: &str = "
.func main 0
    LOADINT r1, -3
    LOADFLOAT r2, 0.1
    LOADFLOAT r2, inf
    LOADNIL r3
    LOADFUNC r4, helper
    NATIVE_CALL r1, print, 1
top:
    JMPT r1, out
    NEG r1, r1
    JMP top
out:
    CALL r1, helper, 2
    INVOKEDYNAMIC r1, r4, 2
    NEWARRAY r5, r1
    SETELEM r5, r1, r2
    GETELEM r6, r5, r1
    LEN r6, r5
    RETURN r0
.end

.func helper 2
    EQ r0, r0, r1
    RETURN r0
.end
";

    #[test]
    fn test_listing_roundtrip() {
        let program = assemble(SOURCE).unwrap();
        let text = listing(&program);
        let again = assemble(&text).unwrap();
        assert_eq!(again, program);
        assert_eq!(listing(&again), text);
    }

    #[test]
    fn test_listing_format() {
        let program = assemble(SOURCE).unwrap();
        let text = listing(&program);
        assert!(text.starts_with(".func main 0\n    LOADINT r1, -3\n"));
        assert!(text.contains("L0:\n    JMPT r1, L1\n"));
        assert!(text.contains("    LOADFLOAT r2, inf\n"));
        assert!(text.contains("    NATIVE_CALL r1, print, 1\n"));
        assert!(text.contains("    CALL r1, helper, 2\n"));
    }

    #[test]
    fn test_raw_view() {
        let program = assemble(".func main 0\n    RETURNNIL\n.end").unwrap();
        let text = raw(&program);
        assert!(text.contains("; main (arity 0, 1 registers)"));
        assert!(text.contains("     0  5c000000  RETURNNIL"));
        assert!(text.contains("; bootstrap"));
    }

    #[test]
    fn test_cfg_dump() {
        let program = assemble(SOURCE).unwrap();
        let text = cfg(&program, 1).unwrap();
        assert!(text.starts_with("; helper\n"));
    }
}
