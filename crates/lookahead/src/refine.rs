//! Backwards peephole pattern matching over the preceding instruction
//! stream (spec.md §4.6), and the stack-refinement pass it drives at
//! `JUMPI` forks whose condition is `⊤`.
//!
//! `matches_backwards` walks the `prev_pc_map` from a PC towards the start
//! of the contract, skipping `JUMPDEST` no-ops, matching each pattern
//! symbol against the real opcode at the current PC. `PUSH` and `DUP` are
//! wildcards: they match any `PUSHn`/`DUPn` and yield the immediate value
//! or duplicated-slot index as an argument rather than requiring an exact
//! opcode.

use ethereum_types::U256;

use crate::opcodes::Opcode;
use crate::prev_pc::PrevPcMap;
use crate::stack::AbsStack;
use crate::value::{meet, AbsVal};

/// One symbol of a backwards pattern: either a concrete opcode or one of
/// the two wildcards the refinement patterns need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSym {
    Op(Opcode),
    Push,
    Dup,
}

/// Per-symbol match output: the duplicated slot's zero-based depth for a
/// `Dup` symbol (`DUPn` duplicates the slot at depth `n - 1`), or the
/// immediate value for a `Push` symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchArg {
    pub dup_idx: Option<usize>,
    pub push_arg: Option<AbsVal>,
}

fn push_immediate(code: &[u8], pc: usize, size: usize) -> AbsVal {
    let start = (pc + 1).min(code.len());
    let end = (start + size).min(code.len());
    let mut buf = [0u8; 32];
    let avail = end - start;
    buf[32 - size..32 - size + avail].copy_from_slice(&code[start..end]);
    U256::from_big_endian(&buf)
}

/// Matches `pattern` against the real opcode stream walking backwards from
/// `pc` via `ppc_map`, skipping `JUMPDEST`. On success returns the matched
/// arguments (one per pattern symbol) and the PC one step before the first
/// matched instruction.
pub fn matches_backwards(
    code: &[u8],
    ppc_map: &PrevPcMap,
    pc: usize,
    pattern: &[PatternSym],
) -> Option<(Vec<MatchArg>, usize)> {
    let mut args = vec![MatchArg::default(); pattern.len()];
    let mut idx = 0;
    let mut pc = pc;
    while idx < pattern.len() {
        if pc >= code.len() {
            return None;
        }
        let actual_op = Opcode::from(code[pc]);
        let mut incr = 0;
        if actual_op != Opcode::JumpDest {
            match pattern[idx] {
                PatternSym::Dup => {
                    let n = actual_op.dup_index()?;
                    args[idx].dup_idx = Some(n as usize - 1);
                }
                PatternSym::Push => {
                    let size = actual_op.push_size()?;
                    args[idx].push_arg = Some(push_immediate(code, pc, size as usize));
                }
                PatternSym::Op(expected) => {
                    if actual_op != expected {
                        return None;
                    }
                }
            }
            incr = 1;
        }
        pc = ppc_map.get_prev_pc(pc)?;
        idx += incr;
    }
    Some((args, pc))
}

fn top_eq(stack: &AbsStack, v: u64) -> bool {
    stack.back(0) == Some(U256::from(v))
}

/// Strengthens `orig_stack` by walking up to `step_budget` steps backwards
/// from `pc`, applying the rules of spec.md §4.6 in order, first match
/// wins. `refined_stack` is the value returned (write-through target);
/// `cur_stack` simulates the state immediately before each undone
/// instruction so the rules can consult "what was on top before this op
/// ran" without losing track of `refined_stack`'s fixed length.
pub fn backwards_refine_stack(
    orig_stack: AbsStack,
    code: &[u8],
    ppc_map: &PrevPcMap,
    pc: usize,
    step_budget: usize,
) -> AbsStack {
    let mut refined_stack = orig_stack.clone_deep();
    let mut cur_stack = orig_stack;
    let refined_len = match refined_stack.len() {
        Some(n) => n,
        None => return refined_stack,
    };

    let index_in_refined = |cur_len: usize, cur_idx: usize| refined_len - cur_len + cur_idx;

    let mut pc = pc;
    for _ in 0..step_budget {
        if let Some((_, ppc)) = matches_backwards(code, ppc_map, pc, &[PatternSym::Push]) {
            let _ = cur_stack.pop();
            pc = ppc;
        } else if let Some((_, ppc)) =
            matches_backwards(code, ppc_map, pc, &[PatternSym::Op(Opcode::JumpDest)])
        {
            pc = ppc;
        } else if matches_backwards(
            code,
            ppc_map,
            pc,
            &[PatternSym::Op(Opcode::IsZero), PatternSym::Op(Opcode::IsZero)],
        )
        .is_some_and(|(_, _)| top_eq(&cur_stack, 0))
        {
            let (_, ppc) = matches_backwards(
                code,
                ppc_map,
                pc,
                &[PatternSym::Op(Opcode::IsZero), PatternSym::Op(Opcode::IsZero)],
            )
            .unwrap();
            pc = ppc;
        } else if let Some(next_pc) = match_iszero_comparator(code, ppc_map, pc, &mut cur_stack) {
            pc = next_pc;
        } else if matches_backwards(code, ppc_map, pc, &[PatternSym::Op(Opcode::IsZero)])
            .is_some_and(|_| top_eq(&cur_stack, 1))
        {
            let (_, ppc) =
                matches_backwards(code, ppc_map, pc, &[PatternSym::Op(Opcode::IsZero)]).unwrap();
            let _ = cur_stack.pop();
            let _ = cur_stack.push(U256::zero());
            pc = ppc;
        } else if let Some((args, ppc)) =
            matches_backwards(code, ppc_map, pc, &[PatternSym::Dup])
        {
            let val = cur_stack.pop().unwrap_or_else(crate::value::top_val);
            let idx = args[0].dup_idx.unwrap();
            let cur_len_before = cur_stack.len().unwrap_or(0);
            let dup_val = cur_stack.back(idx).unwrap_or_else(crate::value::top_val);
            if let Some(m) = meet(dup_val, val) {
                let _ = cur_stack.set_back(idx, m);
                let _ = refined_stack.set_back(index_in_refined(cur_len_before, idx), m);
            }
            pc = ppc;
        } else if let Some((args, ppc)) = matches_backwards(
            code,
            ppc_map,
            pc,
            &[
                PatternSym::Op(Opcode::Eq),
                PatternSym::Dup,
                PatternSym::Dup,
            ],
        )
        .filter(|(args, _)| args[1].dup_idx.unwrap_or(0) >= 1 && top_eq(&cur_stack, 1))
        {
            let _ = cur_stack.pop();
            let cur_len = cur_stack.len().unwrap_or(0);
            let idx1 = args[1].dup_idx.unwrap() - 1;
            let idx2 = args[2].dup_idx.unwrap();
            let val1 = cur_stack.back(idx1).unwrap_or_else(crate::value::top_val);
            let val2 = cur_stack.back(idx2).unwrap_or_else(crate::value::top_val);
            if let Some(m) = meet(val1, val2) {
                let _ = cur_stack.set_back(idx1, m);
                let _ = cur_stack.set_back(idx2, m);
                let _ = refined_stack.set_back(index_in_refined(cur_len, idx1), m);
                let _ = refined_stack.set_back(index_in_refined(cur_len, idx2), m);
            }
            pc = ppc;
        } else if let Some((args, ppc)) = matches_backwards(
            code,
            ppc_map,
            pc,
            &[
                PatternSym::Op(Opcode::Eq),
                PatternSym::Dup,
                PatternSym::Push,
            ],
        )
        .filter(|(args, _)| args[1].dup_idx.unwrap_or(0) >= 1 && top_eq(&cur_stack, 1))
        {
            let _ = cur_stack.pop();
            let cur_len = cur_stack.len().unwrap_or(0);
            let idx1 = args[1].dup_idx.unwrap() - 1;
            let val1 = cur_stack.back(idx1).unwrap_or_else(crate::value::top_val);
            let val2 = args[2].push_arg.unwrap();
            if let Some(m) = meet(val1, val2) {
                let _ = cur_stack.set_back(idx1, m);
                let _ = refined_stack.set_back(index_in_refined(cur_len, idx1), m);
            }
            pc = ppc;
        } else if let Some((args, ppc)) = matches_backwards(
            code,
            ppc_map,
            pc,
            &[
                PatternSym::Op(Opcode::Eq),
                PatternSym::Push,
                PatternSym::Dup,
            ],
        )
        .filter(|_| top_eq(&cur_stack, 1))
        {
            let _ = cur_stack.pop();
            let cur_len = cur_stack.len().unwrap_or(0);
            let val1 = args[1].push_arg.unwrap();
            let idx2 = args[2].dup_idx.unwrap();
            let val2 = cur_stack.back(idx2).unwrap_or_else(crate::value::top_val);
            if let Some(m) = meet(val1, val2) {
                let _ = cur_stack.set_back(idx2, m);
                let _ = refined_stack.set_back(index_in_refined(cur_len, idx2), m);
            }
            pc = ppc;
        } else {
            break;
        }
    }
    refined_stack
}

/// The five `ISZERO; {EQ|LT|GT|SLT|SGT}` patterns of rule 4 (spec.md
/// §4.6): with top of `cur_stack` known to be 0 (so the `ISZERO` held
/// false), the comparator's result must have been 1. Undoes just the
/// `ISZERO`, continuing from before it.
fn match_iszero_comparator(
    code: &[u8],
    ppc_map: &PrevPcMap,
    pc: usize,
    cur_stack: &mut AbsStack,
) -> Option<usize> {
    const COMPARATORS: &[Opcode] = &[Opcode::Eq, Opcode::Lt, Opcode::Gt, Opcode::SLt, Opcode::SGt];
    for &cmp in COMPARATORS {
        if matches_backwards(
            code,
            ppc_map,
            pc,
            &[PatternSym::Op(Opcode::IsZero), PatternSym::Op(cmp)],
        )
        .is_some_and(|_| top_eq(cur_stack, 0))
        {
            let _ = cur_stack.pop();
            let _ = cur_stack.push(U256::one());
            let (_, iszero_pc) =
                matches_backwards(code, ppc_map, pc, &[PatternSym::Op(Opcode::IsZero)]).unwrap();
            return Some(iszero_pc);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ppc_map(code: &[u8]) -> PrevPcMap {
        let mut map = PrevPcMap::new();
        let mut pc = 0usize;
        let mut prev: Option<usize> = None;
        while pc < code.len() {
            if let Some(p) = prev {
                map.add_prev_pc(pc, p);
            }
            let op = Opcode::from(code[pc]);
            let next = match op.push_size() {
                Some(n) => pc + 1 + n as usize,
                None => pc + 1,
            };
            prev = Some(pc);
            pc = next;
        }
        map
    }

    #[test]
    fn matches_backwards_push_then_iszero() {
        let code = [Opcode::Push1.as_u8(), 0x08, Opcode::IsZero.as_u8()];
        let ppc = build_ppc_map(&code);
        let (args, final_pc) = matches_backwards(
            &code,
            &ppc,
            2,
            &[PatternSym::Push, PatternSym::Op(Opcode::IsZero)],
        )
        .unwrap();
        assert_eq!(args[0].push_arg, Some(U256::from(8)));
        assert_eq!(final_pc, 0);
    }

    #[test]
    fn matches_backwards_skips_jumpdest() {
        let code = [
            Opcode::Push1.as_u8(),
            0x08,
            Opcode::JumpDest.as_u8(),
            Opcode::IsZero.as_u8(),
        ];
        let ppc = build_ppc_map(&code);
        let matched = matches_backwards(
            &code,
            &ppc,
            3,
            &[PatternSym::Push, PatternSym::Op(Opcode::IsZero)],
        );
        assert!(matched.is_some());
    }

    #[test]
    fn matches_backwards_dup_yields_zero_based_index() {
        let code = [Opcode::Push1.as_u8(), 0x01, Opcode::Dup2.as_u8()];
        let ppc = build_ppc_map(&code);
        let (args, _) = matches_backwards(&code, &ppc, 2, &[PatternSym::Dup]).unwrap();
        assert_eq!(args[0].dup_idx, Some(1));
    }

    #[test]
    fn matches_backwards_fails_without_prev_pc() {
        let code = [Opcode::IsZero.as_u8()];
        let ppc = PrevPcMap::new();
        assert!(matches_backwards(&code, &ppc, 0, &[PatternSym::Push, PatternSym::Op(Opcode::IsZero)]).is_none());
    }

    #[test]
    fn refine_undoes_push_immediate() {
        // PUSH1 0x08; JUMPI (stack before JUMPI: [dest, cond]); refine walks
        // back over the PUSH1 that produced `cond` without changing it, since
        // a bare PUSH carries no extra information once on the stack.
        let code = [Opcode::Push1.as_u8(), 0x08, Opcode::Jumpi.as_u8()];
        let ppc = build_ppc_map(&code);
        let stack = AbsStack::Values(vec![U256::from(8), U256::one()]);
        let refined = backwards_refine_stack(stack.clone(), &code, &ppc, 2, 16);
        assert_eq!(refined, stack);
    }

    #[test]
    fn refine_double_iszero_of_zero_is_noop() {
        let code = [
            Opcode::Push1.as_u8(),
            0x00,
            Opcode::IsZero.as_u8(),
            Opcode::IsZero.as_u8(),
            Opcode::Jumpi.as_u8(),
        ];
        let ppc = build_ppc_map(&code);
        let stack = AbsStack::Values(vec![U256::from(42), U256::zero()]);
        let refined = backwards_refine_stack(stack.clone(), &code, &ppc, 4, 16);
        assert_eq!(refined, stack);
    }
}
