//! The constant-propagation worklist fixpoint (spec.md §4.7): replays an
//! observed execution prefix to derive a starting abstract state, then
//! explores every abstractly-reachable suffix via a FIFO worklist, bailing
//! out the instant a step reports `mayFail`.

use std::collections::VecDeque;

use ethereum_types::U256;
use lazy_static::lazy_static;
use rustc_hash::{FxHashMap, FxHashSet};
use sha3::{Digest, Keccak256};

use crate::config::LookaheadConfig;
use crate::dispatch::{self, MemSizeOutcome, StepOutcome};
use crate::errors::StepError;
use crate::opcodes::Opcode;
use crate::prev_pc::PrevPcMap;
use crate::stack::MAX_STACK_DEPTH;
use crate::state::AbsState;
use crate::value::is_top;

lazy_static! {
    /// `keccak("AssertionFailed(string)")`, the ABI event signature
    /// `TargetAssertionFailed` mode hunts for at a `LOG1`.
    static ref ASSERTION_FAILED_TOPIC: U256 =
        U256::from_big_endian(&Keccak256::digest(b"AssertionFailed(string)"));
}

/// What the analyzer needs from the facade to gate invalid-opcode and
/// assertion-failed handling at a given program point (spec.md §4.4, §4.8).
pub struct TargetContext<'a> {
    pub targets: Option<&'a FxHashSet<usize>>,
    pub assertion_mode: bool,
    pub covered_assertions: &'a FxHashSet<usize>,
}

impl<'a> TargetContext<'a> {
    fn is_target(&self, pc: usize) -> bool {
        self.targets.is_some_and(|t| t.contains(&pc))
    }
}

/// Outcome of one complete `Analyze` call: either the suffix fixpoint ran
/// dry with no failure, a suffix step reported `mayFail`, or the prefix
/// replay itself failed before the suffix worklist ever started.
#[derive(Debug, Clone)]
pub enum AnalyzeResult {
    NoFail,
    MayFail(StepError),
    PrefixFail(StepError),
}

/// The per-opcode gating the original places ahead of the dispatch table:
/// target/assertion/covered-assertion checks on `INVALID`, the
/// assertion-failed `LOG1` hunt, `MinStack`/`MaxStack` validation, and
/// memory pre-sizing. Only once all of this passes does control reach
/// `dispatch::exec`.
#[allow(clippy::too_many_arguments)]
fn step(
    pc: usize,
    op: Opcode,
    mut st: AbsState,
    code: &[u8],
    ppc_map: &PrevPcMap,
    for_prefix: bool,
    config: &LookaheadConfig,
    ctx: &TargetContext,
) -> StepOutcome {
    if op == Opcode::Invalid {
        if ctx.assertion_mode {
            return StepOutcome::Next(Vec::new());
        }
        if ctx.is_target(pc) {
            return StepOutcome::Fail(StepError::ReachedTargetInstruction);
        }
        if ctx.covered_assertions.contains(&pc) {
            return StepOutcome::Next(Vec::new());
        }
        return StepOutcome::Fail(StepError::InvalidOpcode);
    }

    if ctx.assertion_mode && op.log_topics() == Some(1) {
        if let Some(outcome) = check_assertion_failed_log1(&st) {
            return outcome;
        }
    }

    if let Some(len) = st.stack.len() {
        let (pops, pushes) = op.stack_effect();
        let min_stack = pops;
        let max_stack = (MAX_STACK_DEPTH + pops).saturating_sub(pushes);
        if len < min_stack || len > max_stack {
            return StepOutcome::Fail(StepError::StackValidation);
        }
    }

    match dispatch::mem_size(op, &st.stack, for_prefix) {
        MemSizeOutcome::Overflow => return StepOutcome::Fail(StepError::MemoryOverflow),
        MemSizeOutcome::Unknown => {
            if config.fail_on_top_mem_resize {
                return StepOutcome::Fail(StepError::TopMemoryResize);
            }
        }
        MemSizeOutcome::Bytes(n) => st.mem.resize(n),
        MemSizeOutcome::NotApplicable => {}
    }

    dispatch::exec(op, pc, code, st, ppc_map, for_prefix, config.back_prop_steps)
}

/// Scenario G: `LOG1` with a concrete, non-top topic equal to the
/// `AssertionFailed(string)` signature is the target event; a concrete
/// topic that disagrees is provably not the event and falls through to
/// ordinary `LOG1` handling; a top topic (or too-short a stack to even
/// read one) is inconclusive and also falls through, matching the
/// original's behavior rather than the more conservative "could be the
/// event" treatment.
fn check_assertion_failed_log1(st: &AbsState) -> Option<StepOutcome> {
    let len = st.stack.len()?;
    if len < 3 {
        return None;
    }
    let topic = st.stack.back(2)?;
    if is_top(topic) {
        return None;
    }
    if topic == *ASSERTION_FAILED_TOPIC {
        Some(StepOutcome::Fail(StepError::ReachedAssertionFailed))
    } else {
        None
    }
}

/// Replays `prefix` (a list of PCs in execution order) from the initial
/// state, recording predecessor edges into `ppc_map` as it goes. Returns
/// the set of `(pc, state)` pairs reached immediately after the last
/// prefix instruction executes — these seed the suffix worklist.
fn calculate_precondition(
    code: &[u8],
    prefix: &[usize],
    ppc_map: &mut PrevPcMap,
    config: &LookaheadConfig,
    ctx: &TargetContext,
) -> Result<Vec<(usize, AbsState)>, StepError> {
    let mut cur: Vec<(usize, AbsState)> = vec![(0, AbsState::initial())];
    let mut prev_pc: Option<usize> = None;

    for &p in prefix {
        if let Some(prev) = prev_pc {
            ppc_map.add_prev_pc(p, prev);
        }

        let matching: Vec<&AbsState> = cur.iter().filter(|(pc, _)| *pc == p).map(|(_, s)| s).collect();
        let Some((first, rest)) = matching.split_first() else {
            return Err(StepError::Internal);
        };
        let mut joined = (*first).clone();
        for s in rest {
            let (j, _) = joined.join_states(s, true);
            joined = j;
        }

        let op = Opcode::from(*code.get(p).ok_or(StepError::Internal)?);
        match step(p, op, joined, code, ppc_map, true, config, ctx) {
            StepOutcome::Fail(e) => return Err(e),
            StepOutcome::Next(succs) => cur = succs,
        }
        prev_pc = Some(p);
    }

    Ok(cur)
}

/// A location key identifies a disjunct at a PC: its stack length, or
/// `-1` once the number of distinct lengths observed at that PC has
/// collapsed (spec.md §4.7).
type LocationKey = (usize, i64);

fn enqueue(
    pc: usize,
    state: AbsState,
    states: &mut FxHashMap<LocationKey, AbsState>,
    keys_per_pc: &mut FxHashMap<usize, FxHashSet<i64>>,
    worklist: &mut VecDeque<LocationKey>,
    config: &LookaheadConfig,
) {
    let len = state.stack.len().map(|n| n as i64).unwrap_or(-1);
    let candidate: LocationKey = (pc, len);

    let key = if states.contains_key(&candidate) {
        candidate
    } else {
        let distinct = keys_per_pc.get(&pc).map(|s| s.len()).unwrap_or(0);
        if len != -1 && distinct < config.max_disjuncts {
            keys_per_pc.entry(pc).or_default().insert(len);
            candidate
        } else {
            (pc, -1)
        }
    };

    match states.get(&key) {
        None => {
            states.insert(key, state);
            worklist.push_back(key);
        }
        Some(existing) => {
            let (joined, ascended) = existing.join_states(&state, true);
            if ascended && !config.bounded_joins {
                states.insert(key, joined);
                worklist.push_back(key);
            }
        }
    }
}

fn run_worklist(
    code: &[u8],
    seeds: Vec<(usize, AbsState)>,
    mut ppc_map: PrevPcMap,
    config: &LookaheadConfig,
    ctx: &TargetContext,
) -> AnalyzeResult {
    let mut states: FxHashMap<LocationKey, AbsState> = FxHashMap::default();
    let mut keys_per_pc: FxHashMap<usize, FxHashSet<i64>> = FxHashMap::default();
    let mut worklist: VecDeque<LocationKey> = VecDeque::new();

    for (pc, state) in seeds {
        enqueue(pc, state, &mut states, &mut keys_per_pc, &mut worklist, config);
    }

    while let Some(key) = worklist.pop_front() {
        let pc = key.0;
        let Some(state) = states.get(&key).cloned() else {
            continue;
        };
        if pc >= code.len() {
            continue;
        }
        let op = Opcode::from(code[pc]);
        match step(pc, op, state, code, &ppc_map, false, config, ctx) {
            StepOutcome::Fail(e) => return AnalyzeResult::MayFail(e),
            StepOutcome::Next(succs) => {
                for (npc, nstate) in succs {
                    ppc_map.add_prev_pc(npc, pc);
                    enqueue(npc, nstate, &mut states, &mut keys_per_pc, &mut worklist, config);
                }
            }
        }
    }

    AnalyzeResult::NoFail
}

/// Runs the full `Analyze(prefix)` algorithm of spec.md §4.7 against
/// `code`: prefix replay followed by suffix worklist exploration.
pub fn analyze(
    code: &[u8],
    prefix: &[usize],
    config: &LookaheadConfig,
    ctx: &TargetContext,
) -> AnalyzeResult {
    let mut ppc_map = PrevPcMap::new();
    match calculate_precondition(code, prefix, &mut ppc_map, config, ctx) {
        Err(e) => AnalyzeResult::PrefixFail(e),
        Ok(seeds) => run_worklist(code, seeds, ppc_map, config, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_all_concrete_prefix_reaches_target() {
        // PUSH1 0x0A; PUSH1 0x14; ADD; INVALID
        let code = [0x60, 0x0A, 0x60, 0x14, 0x01, 0xFE];
        let prefix = [0usize, 2, 4];
        let mut targets = FxHashSet::default();
        targets.insert(5usize);
        let covered = FxHashSet::default();
        let ctx = TargetContext {
            targets: Some(&targets),
            assertion_mode: false,
            covered_assertions: &covered,
        };
        let config = LookaheadConfig::default();
        match analyze(&code, &prefix, &config, &ctx) {
            AnalyzeResult::MayFail(e) => assert_eq!(e, StepError::ReachedTargetInstruction),
            other => panic!("expected MayFail(ReachedTargetInstruction), got {other:?}"),
        }
    }

    #[test]
    fn scenario_b_covered_assertion_is_a_sink() {
        let code = [0x60, 0x0A, 0x60, 0x14, 0x01, 0xFE];
        let prefix = [0usize, 2, 4];
        let mut covered = FxHashSet::default();
        covered.insert(5usize);
        let ctx = TargetContext {
            targets: None,
            assertion_mode: false,
            covered_assertions: &covered,
        };
        let config = LookaheadConfig::default();
        match analyze(&code, &prefix, &config, &ctx) {
            AnalyzeResult::NoFail => {}
            other => panic!("expected NoFail, got {other:?}"),
        }
    }

    #[test]
    fn scenario_c_jump_to_top() {
        // CALLDATASIZE; JUMP
        let code = [0x36, 0x56];
        let prefix = [0usize];
        let covered = FxHashSet::default();
        let ctx = TargetContext {
            targets: None,
            assertion_mode: false,
            covered_assertions: &covered,
        };
        let config = LookaheadConfig::default();
        match analyze(&code, &prefix, &config, &ctx) {
            AnalyzeResult::MayFail(e) => assert_eq!(e, StepError::JumpToTop),
            other => panic!("expected MayFail(JumpToTop), got {other:?}"),
        }
    }

    #[test]
    fn scenario_d_boolean_refinement_enables_both_branches() {
        // CALLDATASIZE; ISZERO; PUSH1 0x08; JUMPI; INVALID; JUMPDEST; STOP
        // (the pushed destination 8 is out of bounds, so the "jump taken"
        // alternative silently dies; only the fallthrough alternative
        // reaches the INVALID at pc 5, matching spec.md's Scenario D.)
        let code = [0x36, 0x15, 0x60, 0x08, 0x57, 0xFE, 0x5B, 0x00];
        let prefix = [0usize, 1, 2, 4];
        let covered = FxHashSet::default();
        let ctx = TargetContext {
            targets: None,
            assertion_mode: false,
            covered_assertions: &covered,
        };
        let config = LookaheadConfig::default();
        match analyze(&code, &prefix, &config, &ctx) {
            AnalyzeResult::MayFail(e) => assert_eq!(e, StepError::InvalidOpcode),
            other => panic!("expected MayFail(InvalidOpcode), got {other:?}"),
        }

        let mut covered2 = FxHashSet::default();
        covered2.insert(5usize);
        let ctx2 = TargetContext {
            targets: None,
            assertion_mode: false,
            covered_assertions: &covered2,
        };
        match analyze(&code, &prefix, &config, &ctx2) {
            AnalyzeResult::NoFail => {}
            other => panic!("expected NoFail once the INVALID at pc 5 is a covered assertion, got {other:?}"),
        }
    }

    #[test]
    fn overly_long_prefix_becomes_a_prefix_failure_when_replayed() {
        // A tight JUMPDEST loop: JUMPDEST; PUSH1 0x00; JUMP back to 0.
        let code = [0x5B, 0x60, 0x00, 0x56];
        let prefix: Vec<usize> = std::iter::repeat([0usize, 1, 3]).take(4).flatten().collect();
        let covered = FxHashSet::default();
        let ctx = TargetContext {
            targets: None,
            assertion_mode: false,
            covered_assertions: &covered,
        };
        let config = LookaheadConfig::default();
        // Replay alone should succeed (no overly-long-prefix check lives
        // here; that's the facade's responsibility before calling analyze).
        match analyze(&code, &prefix, &config, &ctx) {
            AnalyzeResult::NoFail | AnalyzeResult::MayFail(_) => {}
            AnalyzeResult::PrefixFail(e) => panic!("unexpected prefix failure: {e}"),
        }
    }
}
