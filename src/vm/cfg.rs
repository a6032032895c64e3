//! Control-flow graph construction for a single function.
//!
//! Positions are relative to the function's entry point. Every return (and
//! `HALT`) becomes an edge into one synthetic, instruction-free terminal
//! block whose id is the number of real blocks.

use std::collections::HashMap;
use std::fmt;

use super::ops::{Instruction, Opcode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    #[error("empty function")]
    EmptyFunction,
    #[error("jump at {pos} targets {target}, outside the function")]
    JumpOutOfRange { pos: usize, target: i64 },
    #[error("control falls off the end of the function after {pos}")]
    FallsOffEnd { pos: usize },
    #[error("invalid opcode {opcode} at {pos}")]
    InvalidOpcode { pos: usize, opcode: u8 },
}

/// How control leaves a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// One edge: an explicit `JMP` or a fall-through into the next leader.
    Goto(usize),
    /// Two edges from a conditional jump.
    Branch { taken: usize, fallthrough: usize },
    /// `RETURN`, `RETURNNIL` or `HALT`: the edge into the terminal block.
    Exit(usize),
    /// The terminal block.
    None,
}

impl Terminator {
    pub fn successors(&self) -> Vec<usize> {
        match *self {
            Terminator::Goto(to) | Terminator::Exit(to) => vec![to],
            Terminator::Branch { taken, fallthrough } => vec![taken, fallthrough],
            Terminator::None => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub id: usize,
    /// First position (inclusive).
    pub first: usize,
    /// Last position (inclusive). Equal to `first` for the terminal block.
    pub last: usize,
    pub instructions: Vec<Instruction>,
    pub predecessors: Vec<usize>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn is_terminal(&self) -> bool {
        self.terminator == Terminator::None
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    /// Indexed by block id; the terminal block is last.
    pub blocks: Vec<BasicBlock>,
    starts: HashMap<usize, usize>,
}

impl Cfg {
    pub fn terminal(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Block id starting at `pos`, if `pos` is a leader.
    pub fn block_at(&self, pos: usize) -> Option<usize> {
        self.starts.get(&pos).copied()
    }

    /// Real (non-terminal) blocks.
    pub fn real_blocks(&self) -> &[BasicBlock] {
        &self.blocks[..self.terminal()]
    }
}

fn decode(code: &[Instruction], pos: usize) -> Result<Opcode, CfgError> {
    let ins = code[pos];
    ins.opcode().ok_or(CfgError::InvalidOpcode {
        pos,
        opcode: ins.raw_opcode(),
    })
}

fn target_of(code: &[Instruction], pos: usize) -> Result<usize, CfgError> {
    let target = code[pos].jump_target(pos);
    if target < 0 || target as usize >= code.len() {
        return Err(CfgError::JumpOutOfRange { pos, target });
    }
    Ok(target as usize)
}

/// Partition `code` into basic blocks and resolve their edges.
pub fn build(code: &[Instruction]) -> Result<Cfg, CfgError> {
    if code.is_empty() {
        return Err(CfgError::EmptyFunction);
    }
    let len = code.len();

    // Pass 1: discover leaders; ids follow discovery order.
    let mut starts: HashMap<usize, usize> = HashMap::new();
    fn leader(pos: usize, starts: &mut HashMap<usize, usize>) {
        let next = starts.len();
        starts.entry(pos).or_insert(next);
    }
    leader(0, &mut starts);

    for pos in 0..len {
        let op = decode(code, pos)?;
        if op.is_jump() {
            let target = target_of(code, pos)?;
            leader(target, &mut starts);
        }
        if op.is_unconditional_transfer() {
            if pos + 1 < len {
                leader(pos + 1, &mut starts);
            }
            continue;
        }
        if pos + 1 == len {
            return Err(CfgError::FallsOffEnd { pos });
        }
        if op.is_conditional_jump() && !decode(code, pos + 1)?.is_unconditional_transfer() {
            leader(pos + 1, &mut starts);
        }
    }

    // Pass 2: group positions into blocks.
    let mut sorted: Vec<usize> = starts.keys().copied().collect();
    sorted.sort_unstable();

    let terminal = sorted.len();
    let mut blocks: Vec<Option<BasicBlock>> = vec![None; terminal];

    for (i, &first) in sorted.iter().enumerate() {
        let end = sorted.get(i + 1).copied().unwrap_or(len);
        let last = end - 1;
        let id = starts[&first];

        let terminator = terminator(code, first, last, &starts, terminal)?;
        blocks[id] = Some(BasicBlock {
            id,
            first,
            last,
            instructions: code[first..end].to_vec(),
            predecessors: Vec::new(),
            terminator,
        });
    }

    let mut blocks: Vec<BasicBlock> = blocks.into_iter().flatten().collect();
    blocks.push(BasicBlock {
        id: terminal,
        first: len,
        last: len,
        instructions: Vec::new(),
        predecessors: Vec::new(),
        terminator: Terminator::None,
    });

    // Pass 3: predecessors.
    for id in 0..terminal {
        for succ in blocks[id].terminator.successors() {
            if !blocks[succ].predecessors.contains(&id) {
                blocks[succ].predecessors.push(id);
            }
        }
    }

    Ok(Cfg { blocks, starts })
}

fn terminator(
    code: &[Instruction],
    first: usize,
    last: usize,
    starts: &HashMap<usize, usize>,
    terminal: usize,
) -> Result<Terminator, CfgError> {
    let block_of = |pos: usize| starts[&pos];
    let op = decode(code, last)?;
    let fused_cond = if last > first && decode(code, last - 1)?.is_conditional_jump() {
        Some(block_of(target_of(code, last - 1)?))
    } else {
        None
    };

    let term = match op {
        Opcode::Jmp => {
            let to = block_of(target_of(code, last)?);
            match fused_cond {
                Some(taken) => Terminator::Branch {
                    taken,
                    fallthrough: to,
                },
                None => Terminator::Goto(to),
            }
        }
        Opcode::Return | Opcode::ReturnNil | Opcode::Halt => match fused_cond {
            Some(taken) => Terminator::Branch {
                taken,
                fallthrough: terminal,
            },
            None => Terminator::Exit(terminal),
        },
        Opcode::JmpT | Opcode::JmpF => Terminator::Branch {
            taken: block_of(target_of(code, last)?),
            fallthrough: block_of(last + 1),
        },
        _ => Terminator::Goto(block_of(last + 1)),
    };
    Ok(term)
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            let preds = if block.predecessors.is_empty() {
                "-".to_string()
            } else {
                block
                    .predecessors
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            if block.is_terminal() {
                writeln!(f, "block {} (terminal)  preds: {}", block.id, preds)?;
                continue;
            }

            writeln!(
                f,
                "block {} [{}..={}]  preds: {}",
                block.id, block.first, block.last, preds
            )?;
            for (i, ins) in block.instructions.iter().enumerate() {
                writeln!(f, "  {:4}: {}", block.first + i, ins)?;
            }
            match block.terminator {
                Terminator::Goto(to) => writeln!(f, "  -> goto {}", to)?,
                Terminator::Branch { taken, fallthrough } => {
                    writeln!(f, "  -> branch {} / {}", taken, fallthrough)?
                }
                Terminator::Exit(to) => writeln!(f, "  -> exit {}", to)?,
                Terminator::None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abx(op: Opcode, a: u32, bx: u32) -> Instruction {
        Instruction::abx(op, a, bx)
    }

    fn jump(op: Opcode, a: u32, offset: i32) -> Instruction {
        Instruction::asbx(op, a, offset)
    }

    fn ret(a: u32) -> Instruction {
        Instruction::abc(Opcode::Return, a, 0, 0)
    }

    fn retnil() -> Instruction {
        Instruction::abc(Opcode::ReturnNil, 0, 0, 0)
    }

    #[test]
    fn test_straight_line() {
        let code = [abx(Opcode::LoadInt, 0, 0), ret(0)];
        let cfg = build(&code).unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.blocks[0].terminator, Terminator::Exit(1));
        assert_eq!(cfg.blocks[1].predecessors, vec![0]);
    }

    #[test]
    fn test_conditional_fused_with_return() {
        // LOADINT r0; JMPF r0, L; RETURN r0; L: RETURNNIL
        let code = [
            abx(Opcode::LoadInt, 0, 0),
            jump(Opcode::JmpF, 0, 1),
            ret(0),
            retnil(),
        ];
        let cfg = build(&code).unwrap();
        assert_eq!(cfg.real_blocks().len(), 2);
        assert_eq!(cfg.terminal(), 2);
        assert_eq!(
            cfg.blocks[0].terminator,
            Terminator::Branch {
                taken: 1,
                fallthrough: 2
            }
        );
        assert_eq!(cfg.blocks[0].instructions.len(), 3);
        assert_eq!(cfg.blocks[1].first, 3);
        assert_eq!(cfg.blocks[1].terminator, Terminator::Exit(2));
        assert_eq!(cfg.blocks[2].predecessors, vec![0, 1]);
        assert!(cfg.blocks[2].terminator.successors().is_empty());
    }

    #[test]
    fn test_conditional_fused_with_jump() {
        // 0: JMPT r0, +1 (-> 2); 1: JMP +1 (-> 3); 2: RETURN r0; 3: RETURNNIL
        let code = [
            jump(Opcode::JmpT, 0, 1),
            jump(Opcode::Jmp, 0, 1),
            ret(0),
            retnil(),
        ];
        let cfg = build(&code).unwrap();
        assert_eq!(cfg.real_blocks().len(), 3);
        let taken = cfg.block_at(2).unwrap();
        let fall = cfg.block_at(3).unwrap();
        assert_eq!(
            cfg.blocks[0].terminator,
            Terminator::Branch {
                taken,
                fallthrough: fall
            }
        );
    }

    #[test]
    fn test_lone_conditional_and_loop() {
        // 0: LOADINT r0; 1: JMPF r0 -> 4; 2: LOADNIL r1; 3: JMP -> 1; 4: RETURNNIL
        let code = [
            abx(Opcode::LoadInt, 0, 0),
            jump(Opcode::JmpF, 0, 2),
            abx(Opcode::LoadNil, 1, 0),
            jump(Opcode::Jmp, 0, -3),
            retnil(),
        ];
        let cfg = build(&code).unwrap();
        // Leaders discovered in order: 0, 4 (JMPF target), 2, 1 (JMP target).
        assert_eq!(cfg.block_at(0), Some(0));
        assert_eq!(cfg.block_at(4), Some(1));
        assert_eq!(cfg.block_at(2), Some(2));
        assert_eq!(cfg.block_at(1), Some(3));

        assert_eq!(cfg.blocks[0].terminator, Terminator::Goto(3));
        assert_eq!(
            cfg.blocks[3].terminator,
            Terminator::Branch {
                taken: 1,
                fallthrough: 2
            }
        );
        assert_eq!(cfg.blocks[2].terminator, Terminator::Goto(3));
        let mut preds = cfg.blocks[3].predecessors.clone();
        preds.sort();
        assert_eq!(preds, vec![0, 2]);
    }

    #[test]
    fn test_self_jump() {
        let code = [jump(Opcode::Jmp, 0, -1)];
        let cfg = build(&code).unwrap();
        assert_eq!(cfg.blocks[0].terminator, Terminator::Goto(0));
        assert_eq!(cfg.blocks[0].predecessors, vec![0]);
        assert!(cfg.blocks[1].predecessors.is_empty());
    }

    #[test]
    fn test_only_terminal_lacks_successors() {
        let code = [
            abx(Opcode::LoadInt, 0, 0),
            jump(Opcode::JmpT, 0, 0),
            abx(Opcode::LoadNil, 0, 0),
            ret(0),
        ];
        let cfg = build(&code).unwrap();
        for block in &cfg.blocks {
            let n = block.terminator.successors().len();
            if block.id == cfg.terminal() {
                assert_eq!(n, 0);
            } else {
                assert!(n == 1 || n == 2);
            }
        }
    }

    #[test]
    fn test_errors() {
        assert_eq!(build(&[]).unwrap_err(), CfgError::EmptyFunction);

        let code = [jump(Opcode::Jmp, 0, 5)];
        assert!(matches!(
            build(&code),
            Err(CfgError::JumpOutOfRange { pos: 0, target: 6 })
        ));

        let code = [abx(Opcode::LoadInt, 0, 0)];
        assert_eq!(build(&code).unwrap_err(), CfgError::FallsOffEnd { pos: 0 });

        let code = [Instruction::from_raw(63 << 26)];
        assert!(matches!(
            build(&code),
            Err(CfgError::InvalidOpcode { pos: 0, opcode: 63 })
        ));
    }
}
