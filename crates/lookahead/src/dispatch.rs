//! The abstract transformer table: one entry per opcode, deciding whether a
//! step can delegate to the concrete evaluator (every operand it reads is
//! already known) or must fall back to a conservative pop/push of `⊤`.
//!
//! Memory resizing happens one level up, in the worklist (`analyzer`):
//! by the time `exec` runs, `st.mem` has already been grown to the size
//! `mem_size` reported, so the per-opcode handlers below only ever read or
//! write within bounds. Likewise the "stack is top" and "stack depth in
//! range" checks happen in the worklist before `exec` is called, so every
//! handler here may assume `st.stack` is `AbsStack::Values`.

use ethereum_types::U256;

use crate::concrete::{self, ConcreteCtx};
use crate::errors::StepError;
use crate::memory::{AbsBytes, AbsMem};
use crate::opcodes::Opcode;
use crate::prev_pc::PrevPcMap;
use crate::refine::{self, PatternSym};
use crate::stack::AbsStack;
use crate::state::AbsState;
use crate::value::{is_top, top_val, AbsVal};

/// The result of one abstract step: zero or more `(pc, state)` successors,
/// or a conservative failure for the location that produced it.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Next(Vec<(usize, AbsState)>),
    Fail(StepError),
}

impl StepOutcome {
    fn empty() -> Self {
        StepOutcome::Next(Vec::new())
    }

    fn at(pc: usize, st: AbsState) -> Self {
        StepOutcome::Next(vec![(pc, st)])
    }

    fn next_pc(pc: usize, st: AbsState) -> Self {
        StepOutcome::at(pc + 1, st)
    }
}

macro_rules! pop {
    ($stack:expr) => {
        match $stack.pop() {
            Ok(v) => v,
            Err(e) => return StepOutcome::Fail(e),
        }
    };
}

/// How much memory (pre-word-alignment byte count) an opcode needs before it
/// executes. `NotApplicable` opcodes never touch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSizeOutcome {
    NotApplicable,
    Unknown,
    Bytes(usize),
    Overflow,
}

fn window_bytes(off: AbsVal, size: AbsVal) -> MemSizeOutcome {
    if is_top(off) || is_top(size) {
        return MemSizeOutcome::Unknown;
    }
    if size.is_zero() {
        return MemSizeOutcome::Bytes(0);
    }
    if off > U256::from(u32::MAX) || size > U256::from(u32::MAX) {
        return MemSizeOutcome::Overflow;
    }
    let (end, overflow) = off.overflowing_add(size);
    if overflow || end > U256::from(u32::MAX) {
        return MemSizeOutcome::Overflow;
    }
    MemSizeOutcome::Bytes(end.as_u32() as usize)
}

fn combine(a: MemSizeOutcome, b: MemSizeOutcome) -> MemSizeOutcome {
    use MemSizeOutcome::*;
    match (a, b) {
        (Overflow, _) | (_, Overflow) => Overflow,
        (Unknown, _) | (_, Unknown) => Unknown,
        (Bytes(x), Bytes(y)) => Bytes(x.max(y)),
        (NotApplicable, other) | (other, NotApplicable) => other,
    }
}

/// Mirrors `makeMemFn`: which stack slots (from the top) hold the
/// offset/size pair(s) this opcode reads memory through, if any.
pub fn mem_size(op: Opcode, stack: &AbsStack, for_prefix: bool) -> MemSizeOutcome {
    let back = |i: usize| stack.back(i).unwrap_or_else(top_val);
    match op {
        Opcode::Sha3 | Opcode::Log0 | Opcode::Log1 | Opcode::Log2 | Opcode::Log3 | Opcode::Log4 => {
            window_bytes(back(0), back(1))
        }
        Opcode::CallDataCopy | Opcode::CodeCopy | Opcode::ReturnDataCopy => {
            window_bytes(back(0), back(2))
        }
        Opcode::ExtCodeCopy => window_bytes(back(1), back(3)),
        Opcode::MLoad | Opcode::MStore => window_bytes(back(0), U256::from(32)),
        Opcode::MStore8 => window_bytes(back(0), U256::from(1)),
        Opcode::Call | Opcode::CallCode if for_prefix => {
            combine(window_bytes(back(3), back(4)), window_bytes(back(5), back(6)))
        }
        Opcode::DelegateCall | Opcode::StaticCall if for_prefix => {
            combine(window_bytes(back(2), back(3)), window_bytes(back(4), back(5)))
        }
        Opcode::Create if for_prefix => window_bytes(back(1), back(2)),
        Opcode::Create2 if for_prefix => window_bytes(back(1), back(2)),
        _ => MemSizeOutcome::NotApplicable,
    }
}

fn run_concrete_stack_only(
    op: Opcode,
    pc: usize,
    code: &[u8],
    stack: Vec<U256>,
) -> Option<(usize, Vec<U256>)> {
    let mut ctx = ConcreteCtx::new(code, pc, stack, Vec::new());
    concrete::execute(op, &mut ctx).ok()?;
    Some((ctx.pc, ctx.stack))
}

fn run_concrete_with_mem(
    op: Opcode,
    pc: usize,
    code: &[u8],
    stack: Vec<U256>,
    mem: Vec<u8>,
) -> Option<(usize, Vec<U256>, Vec<u8>)> {
    let mut ctx = ConcreteCtx::new(code, pc, stack, mem);
    concrete::execute(op, &mut ctx).ok()?;
    Some((ctx.pc, ctx.stack, ctx.memory))
}

/// `delegateConcStackOp`: opcodes that never need a top-check before
/// delegating, because moving a `⊤` sentinel word around (push, dup, swap)
/// or reading a pure fact about the program (code size, pc) is correct
/// whether or not the values involved happen to be `⊤`.
fn delegate_conc_stack_op(op: Opcode, pc: usize, code: &[u8], st: AbsState) -> StepOutcome {
    let AbsState { stack, mem } = st;
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_stack_only(op, pc, code, vals) {
        Some((next_pc, new_stack)) => {
            StepOutcome::at(next_pc, AbsState::new(AbsStack::Values(new_stack), mem))
        }
        None => StepOutcome::empty(),
    }
}

/// `makeStackOp`: if any of the `pop` top operands is `⊤`, conservatively
/// pop/push tops; otherwise delegate to the concrete evaluator.
fn stack_op(op: Opcode, pc: usize, code: &[u8], st: AbsState, pop: usize, push: usize) -> StepOutcome {
    let AbsState { mut stack, mem } = st;
    let any_top = (0..pop).any(|i| stack.back(i).map(is_top).unwrap_or(true));
    if any_top {
        for _ in 0..pop {
            let _ = stack.pop();
        }
        for _ in 0..push {
            let _ = stack.push(top_val());
        }
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_stack_only(op, pc, code, vals) {
        Some((next_pc, new_stack)) => {
            StepOutcome::at(next_pc, AbsState::new(AbsStack::Values(new_stack), mem))
        }
        None => StepOutcome::empty(),
    }
}

/// `makePopPushTopFn`: unconditionally pops `pop` values, pushes `push`
/// tops. Used for environment queries, `SLOAD`/`SSTORE`, `GAS`, `LOG`n, and
/// (in prefix mode) `CREATE`/`CREATE2`.
fn pop_push_top(pc: usize, st: AbsState, pop: usize, push: usize) -> StepOutcome {
    let AbsState { mut stack, mem } = st;
    for _ in 0..pop {
        let _ = stack.pop();
    }
    for _ in 0..push {
        let _ = stack.push(top_val());
    }
    StepOutcome::next_pc(pc, AbsState::new(stack, mem))
}

/// `makePopPushMemTopFn`: like `pop_push_top`, but additionally collapses
/// memory to `⊤` (or paints the argument/return window with `⊤` bytes) since
/// the callee's effects on memory aren't tracked. Prefix-mode only.
fn pop_push_mem_top(
    pc: usize,
    st: AbsState,
    pop: usize,
    push: usize,
    mem_off_idx: usize,
    mem_size_idx: usize,
) -> StepOutcome {
    let AbsState { mut stack, mut mem } = st;
    let mem_offset = stack.back(mem_off_idx).unwrap_or_else(top_val);
    let mem_size = stack.back(mem_size_idx).unwrap_or_else(top_val);
    for _ in 0..pop {
        let _ = stack.pop();
    }
    for _ in 0..push {
        let _ = stack.push(top_val());
    }
    if is_top(mem_offset) || is_top(mem_size) {
        mem = AbsMem::top();
    } else {
        match (concrete::to_usize(mem_offset), concrete::to_usize(mem_size)) {
            (Ok(off), Ok(sz)) => {
                let _ = mem.set(off, sz, &AbsBytes::top());
            }
            _ => mem = AbsMem::top(),
        }
    }
    StepOutcome::next_pc(pc, AbsState::new(stack, mem))
}

fn op_sha3(pc: usize, code: &[u8], st: AbsState) -> StepOutcome {
    let AbsState { mut stack, mem } = st;
    let offset = stack.back(0).unwrap_or_else(top_val);
    let size = stack.back(1).unwrap_or_else(top_val);
    let window_is_top = match (concrete::to_usize(offset), concrete::to_usize(size)) {
        (Ok(off), Ok(sz)) => mem.get(off, sz).is_top(),
        _ => true,
    };
    if is_top(offset) || is_top(size) || window_is_top {
        let _ = stack.pop();
        let _ = stack.pop();
        let _ = stack.push(top_val());
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    let AbsMem::Bytes(bytes) = mem else {
        unreachable!("window_is_top would have been true for top memory")
    };
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_with_mem(Opcode::Sha3, pc, code, vals, bytes) {
        Some((next_pc, new_stack, new_mem)) => StepOutcome::at(
            next_pc,
            AbsState::new(AbsStack::Values(new_stack), AbsMem::Bytes(new_mem)),
        ),
        None => StepOutcome::empty(),
    }
}

fn op_mload(pc: usize, st: AbsState) -> StepOutcome {
    let AbsState { mut stack, mem } = st;
    let offset = pop!(stack);
    let value = if is_top(offset) {
        top_val()
    } else {
        match concrete::to_usize(offset) {
            Ok(off) => match mem.get(off, 32) {
                AbsBytes::Top => top_val(),
                AbsBytes::Concrete(bytes) => {
                    let mut buf = [0u8; 32];
                    buf.copy_from_slice(&bytes);
                    U256::from_big_endian(&buf)
                }
            },
            Err(_) => top_val(),
        }
    };
    let _ = stack.push(value);
    StepOutcome::next_pc(pc, AbsState::new(stack, mem))
}

fn op_mstore(pc: usize, code: &[u8], st: AbsState, store_size: usize) -> StepOutcome {
    let AbsState { mut stack, mut mem } = st;
    let off = stack.back(0).unwrap_or_else(top_val);
    let val = stack.back(1).unwrap_or_else(top_val);
    if mem.is_top() {
        let _ = stack.pop();
        let _ = stack.pop();
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    if is_top(off) {
        let _ = stack.pop();
        let _ = stack.pop();
        mem = AbsMem::top();
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    if is_top(val) {
        let _ = stack.pop();
        let _ = stack.pop();
        match concrete::to_usize(off) {
            Ok(off) => {
                let _ = mem.set(off, store_size, &AbsBytes::top());
            }
            Err(_) => mem = AbsMem::top(),
        }
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    let AbsMem::Bytes(bytes) = mem else {
        unreachable!("checked not top above")
    };
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    let op = if store_size == 32 {
        Opcode::MStore
    } else {
        Opcode::MStore8
    };
    match run_concrete_with_mem(op, pc, code, vals, bytes) {
        Some((next_pc, new_stack, new_mem)) => StepOutcome::at(
            next_pc,
            AbsState::new(AbsStack::Values(new_stack), AbsMem::Bytes(new_mem)),
        ),
        None => StepOutcome::empty(),
    }
}

fn op_msize(pc: usize, code: &[u8], st: AbsState) -> StepOutcome {
    let AbsState { mut stack, mem } = st;
    if mem.is_top() {
        let _ = stack.push(top_val());
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    let AbsMem::Bytes(bytes) = mem else {
        unreachable!("checked not top above")
    };
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_with_mem(Opcode::MSize, pc, code, vals, bytes) {
        Some((next_pc, new_stack, new_mem)) => StepOutcome::at(
            next_pc,
            AbsState::new(AbsStack::Values(new_stack), AbsMem::Bytes(new_mem)),
        ),
        None => StepOutcome::empty(),
    }
}

fn op_jump(pc: usize, code: &[u8], st: AbsState) -> StepOutcome {
    let AbsState { stack, mem } = st;
    let dest = stack.back(0).unwrap_or_else(top_val);
    if is_top(dest) {
        return StepOutcome::Fail(StepError::JumpToTop);
    }
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_stack_only(Opcode::Jump, pc, code, vals) {
        Some((next_pc, new_stack)) => {
            StepOutcome::at(next_pc, AbsState::new(AbsStack::Values(new_stack), mem))
        }
        None => StepOutcome::empty(),
    }
}

/// The nine short `PUSH, <comparator-or-call>` backwards patterns that make
/// a `⊤` branch condition worth splitting into a `then`/`else` pair instead
/// of exploring a single unconstrained successor. `PatternSym::Push` is a
/// true wildcard: it matches any `PUSHn`, not literally `PUSH1`.
const BOOLEAN_COND_PATTERNS: &[[PatternSym; 2]] = &[
    [PatternSym::Push, PatternSym::Op(Opcode::IsZero)],
    [PatternSym::Push, PatternSym::Op(Opcode::Eq)],
    [PatternSym::Push, PatternSym::Op(Opcode::Lt)],
    [PatternSym::Push, PatternSym::Op(Opcode::Gt)],
    [PatternSym::Push, PatternSym::Op(Opcode::SLt)],
    [PatternSym::Push, PatternSym::Op(Opcode::SGt)],
    [PatternSym::Push, PatternSym::Op(Opcode::Call)],
    [PatternSym::Push, PatternSym::Op(Opcode::StaticCall)],
    [PatternSym::Push, PatternSym::Op(Opcode::DelegateCall)],
    [PatternSym::Push, PatternSym::Op(Opcode::CallCode)],
];

fn is_boolean_cond(code: &[u8], ppc_map: &PrevPcMap, ppc: usize) -> bool {
    BOOLEAN_COND_PATTERNS
        .iter()
        .any(|pattern| refine::matches_backwards(code, ppc_map, ppc, pattern).is_some())
}

fn op_jumpi(pc: usize, code: &[u8], st: AbsState, ppc_map: &PrevPcMap, back_prop_steps: usize) -> StepOutcome {
    let cond = st.stack.back(1).unwrap_or_else(top_val);

    let alts: Vec<AbsStack> = if is_top(cond) {
        let Some(ppc) = ppc_map.get_prev_pc(pc) else {
            return StepOutcome::Fail(StepError::Internal);
        };
        if is_boolean_cond(code, ppc_map, ppc) {
            let mut then_stack = st.stack.clone_deep();
            if then_stack.set_back(1, U256::one()).is_err() {
                return StepOutcome::Fail(StepError::StackValidation);
            }
            let then_stack = refine::backwards_refine_stack(then_stack, code, ppc_map, ppc, back_prop_steps);

            let mut else_stack = st.stack.clone_deep();
            if else_stack.set_back(1, U256::zero()).is_err() {
                return StepOutcome::Fail(StepError::StackValidation);
            }
            let else_stack = refine::backwards_refine_stack(else_stack, code, ppc_map, ppc, back_prop_steps);

            vec![then_stack, else_stack]
        } else {
            // No boolean-producing pattern precedes this branch: per
            // spec.md §4.5, keep a single alternative with `cond` still
            // top rather than forking. The per-alt loop below delegates
            // to the concrete VM, which reads the (nonzero) top sentinel
            // as truthy and always takes the jump — the fallthrough
            // continuation is not produced by this step in that case.
            vec![st.stack.clone_deep()]
        }
    } else {
        vec![st.stack.clone_deep()]
    };

    let mut new_states = Vec::new();
    for alt_stack in alts {
        let dest = alt_stack.back(0).unwrap_or_else(top_val);
        if is_top(dest) {
            return StepOutcome::Fail(StepError::JumpToTop);
        }
        let AbsStack::Values(vals) = alt_stack else {
            return StepOutcome::Fail(StepError::TopStack);
        };
        if let Some((next_pc, new_stack)) = run_concrete_stack_only(Opcode::Jumpi, pc, code, vals) {
            new_states.push((next_pc, AbsState::new(AbsStack::Values(new_stack), st.mem.clone_deep())));
        }
    }
    StepOutcome::Next(new_states)
}

fn op_bulk_copy_no_delegate(pc: usize, st: AbsState, discard_before_size: usize) -> StepOutcome {
    let AbsState { mut stack, mut mem } = st;
    let mem_offset = pop!(stack);
    for _ in 0..discard_before_size {
        let _ = pop!(stack);
    }
    let size = pop!(stack);
    if mem.is_top() {
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    if is_top(mem_offset) || is_top(size) {
        mem = AbsMem::top();
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    match (concrete::to_usize(mem_offset), concrete::to_usize(size)) {
        (Ok(off), Ok(sz)) => {
            let _ = mem.set(off, sz, &AbsBytes::top());
        }
        _ => mem = AbsMem::top(),
    }
    StepOutcome::next_pc(pc, AbsState::new(stack, mem))
}

fn op_extcodecopy(pc: usize, st: AbsState) -> StepOutcome {
    let AbsState { mut stack, mut mem } = st;
    let _address = pop!(stack);
    let mem_offset = pop!(stack);
    let _code_offset = pop!(stack);
    let size = pop!(stack);
    if mem.is_top() {
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    if is_top(mem_offset) || is_top(size) {
        mem = AbsMem::top();
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    match (concrete::to_usize(mem_offset), concrete::to_usize(size)) {
        (Ok(off), Ok(sz)) => {
            let _ = mem.set(off, sz, &AbsBytes::top());
        }
        _ => mem = AbsMem::top(),
    }
    StepOutcome::next_pc(pc, AbsState::new(stack, mem))
}

fn op_returndatacopy(pc: usize, code: &[u8], st: AbsState) -> StepOutcome {
    let AbsState { mut stack, mut mem } = st;
    let mem_offset = pop!(stack);
    let data_offset = pop!(stack);
    let size = pop!(stack);
    if is_top(data_offset) {
        return StepOutcome::Fail(StepError::TopOffset);
    }
    if mem.is_top() {
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    if is_top(mem_offset) || is_top(size) {
        mem = AbsMem::top();
        return StepOutcome::next_pc(pc, AbsState::new(stack, mem));
    }
    // All three operands are concrete: restore stack order and delegate, the
    // same way the real opcode would pop them itself.
    let _ = stack.push(size);
    let _ = stack.push(data_offset);
    let _ = stack.push(mem_offset);
    let AbsMem::Bytes(bytes) = mem else {
        unreachable!("checked not top above")
    };
    let AbsStack::Values(vals) = stack else {
        return StepOutcome::Fail(StepError::TopStack);
    };
    match run_concrete_with_mem(Opcode::ReturnDataCopy, pc, code, vals, bytes) {
        Some((next_pc, new_stack, new_mem)) => StepOutcome::at(
            next_pc,
            AbsState::new(AbsStack::Values(new_stack), AbsMem::Bytes(new_mem)),
        ),
        None => StepOutcome::empty(),
    }
}

/// Executes one abstract step. `for_prefix` selects between the two jump
/// tables the original builds: CALL-family opcodes are an unconditional
/// `unsupported-opcode` failure outside prefix mode (suffix exploration
/// never needs to model a callee), and a conservative pop/push-tops inside
/// it (a prefix the fuzzer already executed did make that call, so the
/// analyzer has to keep going past it).
pub fn exec(
    op: Opcode,
    pc: usize,
    code: &[u8],
    st: AbsState,
    ppc_map: &PrevPcMap,
    for_prefix: bool,
    back_prop_steps: usize,
) -> StepOutcome {
    use Opcode::*;
    match op {
        Stop | Return | Revert | SelfDestruct => StepOutcome::empty(),

        Add | Mul | Sub | Div | SDiv | Mod | SMod | Exp | SignExtend | Lt | Gt | SLt | SGt
        | Eq | And | Xor | Or | Byte | Shl | Shr | Sar => stack_op(op, pc, code, st, 2, 1),
        IsZero | Not => stack_op(op, pc, code, st, 1, 1),
        AddMod | MulMod => stack_op(op, pc, code, st, 3, 1),

        Sha3 => op_sha3(pc, code, st),

        CodeSize | Pc => delegate_conc_stack_op(op, pc, code, st),

        Address | Origin | Caller | CallValue | CallDataSize | GasPrice | ReturnDataSize
        | Coinbase | Timestamp | Number | Difficulty | GasLimit | ChainId | SelfBalance
        | Gas => pop_push_top(pc, st, 0, 1),

        Balance | CallDataLoad | ExtCodeSize | ExtCodeHash | BlockHash => {
            pop_push_top(pc, st, 1, 1)
        }

        CallDataCopy | CodeCopy => op_bulk_copy_no_delegate(pc, st, 1),
        ExtCodeCopy => op_extcodecopy(pc, st),
        ReturnDataCopy => op_returndatacopy(pc, code, st),

        Pop => pop_push_top(pc, st, 1, 0),

        MLoad => op_mload(pc, st),
        MStore => op_mstore(pc, code, st, 32),
        MStore8 => op_mstore(pc, code, st, 1),

        SLoad => pop_push_top(pc, st, 1, 1),
        SStore => pop_push_top(pc, st, 2, 0),

        Jump => op_jump(pc, code, st),
        Jumpi => op_jumpi(pc, code, st, ppc_map, back_prop_steps),

        MSize => op_msize(pc, code, st),
        JumpDest => StepOutcome::next_pc(pc, st),

        op if op.push_size().is_some() => delegate_conc_stack_op(op, pc, code, st),
        op if op.dup_index().is_some() => delegate_conc_stack_op(op, pc, code, st),
        op if op.swap_index().is_some() => delegate_conc_stack_op(op, pc, code, st),

        op if op.log_topics().is_some() => {
            let topics = op.log_topics().unwrap() as usize;
            pop_push_top(pc, st, 2 + topics, 0)
        }

        Create if for_prefix => pop_push_top(pc, st, 3, 1),
        Create2 if for_prefix => pop_push_top(pc, st, 4, 1),
        Call if for_prefix => pop_push_mem_top(pc, st, 7, 1, 5, 6),
        CallCode if for_prefix => pop_push_mem_top(pc, st, 7, 1, 5, 6),
        DelegateCall if for_prefix => pop_push_mem_top(pc, st, 6, 1, 4, 5),
        StaticCall if for_prefix => pop_push_mem_top(pc, st, 6, 1, 4, 5),

        op if op.is_call_family() => StepOutcome::Fail(StepError::UnsupportedOpcode),

        Invalid => StepOutcome::Fail(StepError::InvalidOpcode),
    }
}
