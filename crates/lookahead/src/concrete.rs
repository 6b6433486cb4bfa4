//! A minimal in-tree concrete evaluator, standing in for a real EVM
//! implementation (spec.md §9: "an in-tree minimal implementation suffices
//! for tests"). Abstract transformers delegate here whenever every operand
//! they read is already a known constant, so the abstract and concrete
//! results stay bit-identical (invariant 4, spec.md §8).
//!
//! Only the opcodes the dispatch table ever delegates to are implemented:
//! pure arithmetic/bitwise, `SHA3`, `CODESIZE`, `PC`, `PUSHn`, `DUPn`,
//! `SWAPn`, `MLOAD`/`MSTORE`/`MSTORE8`, `MSIZE`, `JUMP`/`JUMPI`, and
//! `RETURNDATACOPY` (which always errors here: this evaluator never tracks
//! real return data from a sub-call, so any non-empty copy is out of
//! bounds — the same outcome a dummy interpreter with no prior calls would
//! give).

use ethereum_types::{U256, U512};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::opcodes::Opcode;

/// Shifts the value to the right by 255 bits and checks the most
/// significant bit is a 1.
fn is_negative(value: U256) -> bool {
    value.bit(255)
}

/// Negates a number in two's complement.
fn negate(value: U256) -> U256 {
    let (negated, _overflowed) = (!value).overflowing_add(U256::one());
    negated
}

fn abs(value: U256) -> U256 {
    if is_negative(value) {
        negate(value)
    } else {
        value
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcreteError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid jump destination")]
    InvalidJumpDest,
    #[error("out of bounds memory/copy access")]
    OutOfBounds,
    #[error("unsupported opcode in concrete evaluator: {0:?}")]
    Unsupported(Opcode),
}

/// Scratch execution context for one delegated concrete step. `return_data`
/// is always empty: this evaluator never models real sub-calls, matching
/// the dummy interpreter the original analyzer hands to the concrete VM.
pub struct ConcreteCtx<'a> {
    pub code: &'a [u8],
    pub pc: usize,
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
}

impl<'a> ConcreteCtx<'a> {
    pub fn new(code: &'a [u8], pc: usize, stack: Vec<U256>, memory: Vec<u8>) -> Self {
        ConcreteCtx {
            code,
            pc,
            stack,
            memory,
        }
    }

    fn pop(&mut self) -> Result<U256, ConcreteError> {
        self.stack.pop().ok_or(ConcreteError::StackUnderflow)
    }

    fn push(&mut self, v: U256) -> Result<(), ConcreteError> {
        if self.stack.len() >= crate::stack::MAX_STACK_DEPTH {
            return Err(ConcreteError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn resize_to(&mut self, n: usize) {
        let target = crate::memory::to_word_size(n);
        if target > self.memory.len() {
            self.memory.resize(target, 0);
        }
    }

    fn load_word(&mut self, off: usize) -> U256 {
        self.resize_to(off + 32);
        U256::from_big_endian(&self.memory[off..off + 32])
    }

    fn store_word(&mut self, off: usize, v: U256) {
        self.resize_to(off + 32);
        let mut buf = [0u8; 32];
        v.to_big_endian(&mut buf);
        self.memory[off..off + 32].copy_from_slice(&buf);
    }
}

pub(crate) fn to_usize(v: U256) -> Result<usize, ConcreteError> {
    if v > U256::from(u32::MAX) {
        Err(ConcreteError::OutOfBounds)
    } else {
        Ok(v.as_u32() as usize)
    }
}

fn signextend(byte_size_minus_one: U256, value_to_extend: U256) -> U256 {
    if byte_size_minus_one > U256::from(31) {
        return value_to_extend;
    }
    let sign_bit_index = byte_size_minus_one * 8 + 7;
    let sign_bit = (value_to_extend >> sign_bit_index) & U256::one();
    let mask = (U256::one() << sign_bit_index) - U256::one();
    if sign_bit.is_zero() {
        value_to_extend & mask
    } else {
        value_to_extend | !mask
    }
}

/// `i` is the EVM's most-significant-byte-first index; `U256::byte` is
/// least-significant-first, so we flip it the same way the reference
/// `BYTE` handler does.
fn byte_at(i: U256, x: U256) -> U256 {
    match usize::try_from(i) {
        Ok(byte_index) if byte_index < 32 => U256::from(x.byte(31 - byte_index)),
        _ => U256::zero(),
    }
}

/// Executes one instruction against `ctx`, leaving `ctx.pc` pointing at the
/// next instruction to run (the jump destination for a taken `JUMP`/
/// `JUMPI`, otherwise one past this opcode and its immediate, if any).
pub fn execute(opcode: Opcode, ctx: &mut ConcreteCtx) -> Result<(), ConcreteError> {
    use Opcode::*;
    let start_pc = ctx.pc;
    match opcode {
        Add => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a.overflowing_add(b).0)?;
        }
        Mul => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a.overflowing_mul(b).0)?;
        }
        Sub => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a.overflowing_sub(b).0)?;
        }
        Div => {
            let (dividend, divisor) = (ctx.pop()?, ctx.pop()?);
            ctx.push(dividend.checked_div(divisor).unwrap_or_default())?;
        }
        SDiv => {
            let (dividend, divisor) = (ctx.pop()?, ctx.pop()?);
            let result = if divisor.is_zero() || dividend.is_zero() {
                U256::zero()
            } else {
                let abs_dividend = abs(dividend);
                let abs_divisor = abs(divisor);
                match abs_dividend.checked_div(abs_divisor) {
                    Some(quot) if is_negative(dividend) ^ is_negative(divisor) => negate(quot),
                    Some(quot) => quot,
                    None => U256::zero(),
                }
            };
            ctx.push(result)?;
        }
        Mod => {
            let (dividend, divisor) = (ctx.pop()?, ctx.pop()?);
            ctx.push(dividend.checked_rem(divisor).unwrap_or_default())?;
        }
        SMod => {
            let (dividend, divisor) = (ctx.pop()?, ctx.pop()?);
            let result = if divisor.is_zero() || dividend.is_zero() {
                U256::zero()
            } else {
                let abs_dividend = abs(dividend);
                let abs_divisor = abs(divisor);
                match abs_dividend.checked_rem(abs_divisor) {
                    Some(rem) if is_negative(dividend) => negate(rem),
                    Some(rem) => rem,
                    None => U256::zero(),
                }
            };
            ctx.push(result)?;
        }
        AddMod => {
            let (augend, addend, modulus) = (ctx.pop()?, ctx.pop()?, ctx.pop()?);
            let result = if modulus.is_zero() {
                U256::zero()
            } else {
                let sum = U512::from(augend) + U512::from(addend);
                (sum % U512::from(modulus)).try_into().unwrap_or_default()
            };
            ctx.push(result)?;
        }
        MulMod => {
            let (multiplicand, multiplier, modulus) = (ctx.pop()?, ctx.pop()?, ctx.pop()?);
            let result = if modulus.is_zero() {
                U256::zero()
            } else {
                let product = multiplicand.full_mul(multiplier);
                (product % U512::from(modulus)).try_into().unwrap_or_default()
            };
            ctx.push(result)?;
        }
        Exp => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a.overflowing_pow(b).0)?;
        }
        SignExtend => {
            let (k, x) = (ctx.pop()?, ctx.pop()?);
            ctx.push(signextend(k, x))?;
        }
        Lt => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(U256::from(u8::from(a < b)))?;
        }
        Gt => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(U256::from(u8::from(a > b)))?;
        }
        SLt => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            let lt = match (is_negative(a), is_negative(b)) {
                (true, false) => true,
                (false, true) => false,
                (true, true) => abs(a) > abs(b),
                (false, false) => abs(a) < abs(b),
            };
            ctx.push(U256::from(u8::from(lt)))?;
        }
        SGt => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            let gt = match (is_negative(a), is_negative(b)) {
                (true, false) => false,
                (false, true) => true,
                (true, true) => abs(a) < abs(b),
                (false, false) => abs(a) > abs(b),
            };
            ctx.push(U256::from(u8::from(gt)))?;
        }
        Eq => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(U256::from(u8::from(a == b)))?;
        }
        IsZero => {
            let a = ctx.pop()?;
            ctx.push(U256::from(u8::from(a.is_zero())))?;
        }
        And => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a & b)?;
        }
        Or => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a | b)?;
        }
        Xor => {
            let (a, b) = (ctx.pop()?, ctx.pop()?);
            ctx.push(a ^ b)?;
        }
        Not => {
            let a = ctx.pop()?;
            ctx.push(!a)?;
        }
        Byte => {
            let (i, x) = (ctx.pop()?, ctx.pop()?);
            ctx.push(byte_at(i, x))?;
        }
        Shl => {
            let (shift, value) = (ctx.pop()?, ctx.pop()?);
            ctx.push(if shift >= U256::from(256) {
                U256::zero()
            } else {
                value << shift
            })?;
        }
        Shr => {
            let (shift, value) = (ctx.pop()?, ctx.pop()?);
            ctx.push(if shift >= U256::from(256) {
                U256::zero()
            } else {
                value >> shift
            })?;
        }
        Sar => {
            let (shift, value) = (ctx.pop()?, ctx.pop()?);
            let negative = is_negative(value);
            let result = if shift >= U256::from(256) {
                if negative { U256::MAX } else { U256::zero() }
            } else if negative {
                let shifted = value >> shift;
                let mask = if shift.is_zero() {
                    U256::zero()
                } else {
                    !(U256::MAX >> shift)
                };
                shifted | mask
            } else {
                value >> shift
            };
            ctx.push(result)?;
        }
        Sha3 => {
            let (off, size) = (to_usize(ctx.pop()?)?, to_usize(ctx.pop()?)?);
            ctx.resize_to(off + size);
            let digest = Keccak256::digest(&ctx.memory[off..off + size]);
            ctx.push(U256::from_big_endian(&digest))?;
        }
        CodeSize => {
            ctx.push(U256::from(ctx.code.len()))?;
        }
        Pc => {
            ctx.push(U256::from(start_pc))?;
        }
        MSize => {
            ctx.push(U256::from(ctx.memory.len()))?;
        }
        MLoad => {
            let off = to_usize(ctx.pop()?)?;
            let word = ctx.load_word(off);
            ctx.push(word)?;
        }
        MStore => {
            let (off, v) = (to_usize(ctx.pop()?)?, ctx.pop()?);
            ctx.store_word(off, v);
        }
        MStore8 => {
            let (off, v) = (to_usize(ctx.pop()?)?, ctx.pop()?);
            ctx.resize_to(off + 1);
            ctx.memory[off] = v.byte(0);
        }
        Jump => {
            let dest = to_usize(ctx.pop()?)?;
            validate_jumpdest(ctx.code, dest)?;
            ctx.pc = dest;
            return Ok(());
        }
        Jumpi => {
            let (dest, cond) = (to_usize(ctx.pop()?)?, ctx.pop()?);
            if !cond.is_zero() {
                validate_jumpdest(ctx.code, dest)?;
                ctx.pc = dest;
                return Ok(());
            }
        }
        ReturnDataCopy => {
            let (_dest_off, _data_off, size) =
                (ctx.pop()?, ctx.pop()?, to_usize(ctx.pop()?)?);
            if size > 0 {
                return Err(ConcreteError::OutOfBounds);
            }
        }
        op if op.push_size().is_some() => {
            let n = op.push_size().unwrap() as usize;
            let bytes = &ctx.code[ctx.pc + 1..ctx.pc + 1 + n];
            let mut buf = [0u8; 32];
            buf[32 - n..].copy_from_slice(bytes);
            ctx.push(U256::from_big_endian(&buf))?;
            ctx.pc = start_pc + 1 + n;
            return Ok(());
        }
        op if op.dup_index().is_some() => {
            let k = op.dup_index().unwrap() as usize;
            let len = ctx.stack.len();
            if k > len {
                return Err(ConcreteError::StackUnderflow);
            }
            ctx.push(ctx.stack[len - k])?;
        }
        op if op.swap_index().is_some() => {
            let k = op.swap_index().unwrap() as usize;
            let len = ctx.stack.len();
            if k >= len {
                return Err(ConcreteError::StackUnderflow);
            }
            ctx.stack.swap(len - 1, len - 1 - k);
        }
        other => return Err(ConcreteError::Unsupported(other)),
    }
    ctx.pc = start_pc + 1;
    Ok(())
}

fn validate_jumpdest(code: &[u8], dest: usize) -> Result<(), ConcreteError> {
    if dest >= code.len() || Opcode::from(code[dest]) != Opcode::JumpDest {
        return Err(ConcreteError::InvalidJumpDest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(code: &'a [u8], pc: usize, stack: Vec<U256>) -> ConcreteCtx<'a> {
        ConcreteCtx::new(code, pc, stack, Vec::new())
    }

    #[test]
    fn add_wraps_on_overflow() {
        let code = [Opcode::Add.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::MAX, U256::from(1)]);
        execute(Opcode::Add, &mut c).unwrap();
        assert_eq!(c.stack.pop().unwrap(), U256::zero());
        assert_eq!(c.pc, 1);
    }

    #[test]
    fn div_by_zero_is_zero() {
        let code = [Opcode::Div.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(0), U256::from(10)]);
        execute(Opcode::Div, &mut c).unwrap();
        assert_eq!(c.stack.pop().unwrap(), U256::zero());
    }

    #[test]
    fn push1_reads_immediate_and_advances_pc() {
        let code = [Opcode::Push1.as_u8(), 0x2a];
        let mut c = ctx(&code, 0, vec![]);
        execute(Opcode::Push1, &mut c).unwrap();
        assert_eq!(c.stack.pop().unwrap(), U256::from(0x2a));
        assert_eq!(c.pc, 2);
    }

    #[test]
    fn jump_to_non_jumpdest_errors() {
        let code = [Opcode::Jump.as_u8(), Opcode::Add.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(1)]);
        assert_eq!(
            execute(Opcode::Jump, &mut c).unwrap_err(),
            ConcreteError::InvalidJumpDest
        );
    }

    #[test]
    fn jump_to_jumpdest_sets_pc() {
        let code = [Opcode::Jump.as_u8(), Opcode::JumpDest.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(1)]);
        execute(Opcode::Jump, &mut c).unwrap();
        assert_eq!(c.pc, 1);
    }

    #[test]
    fn mstore_then_mload_roundtrips() {
        let code = [Opcode::MStore.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(99), U256::from(0)]);
        execute(Opcode::MStore, &mut c).unwrap();
        assert_eq!(c.memory.len(), 32);
        let word = c.load_word(0);
        assert_eq!(word, U256::from(99));
    }

    #[test]
    fn returndatacopy_with_nonzero_size_errors() {
        let code = [Opcode::ReturnDataCopy.as_u8()];
        let mut c = ctx(
            &code,
            0,
            vec![U256::from(1), U256::from(0), U256::from(0)],
        );
        assert_eq!(
            execute(Opcode::ReturnDataCopy, &mut c).unwrap_err(),
            ConcreteError::OutOfBounds
        );
    }

    #[test]
    fn dup_duplicates_from_given_depth() {
        let code = [Opcode::Dup2.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(1), U256::from(2)]);
        execute(Opcode::Dup2, &mut c).unwrap();
        assert_eq!(c.stack, vec![U256::from(1), U256::from(2), U256::from(1)]);
    }

    #[test]
    fn swap_exchanges_top_with_depth() {
        let code = [Opcode::Swap1.as_u8()];
        let mut c = ctx(&code, 0, vec![U256::from(1), U256::from(2)]);
        execute(Opcode::Swap1, &mut c).unwrap();
        assert_eq!(c.stack, vec![U256::from(2), U256::from(1)]);
    }
}
