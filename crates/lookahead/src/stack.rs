//! The abstract stack: either `⊤` (any possible stack) or a bounded
//! sequence of `AbsVal`s, indexed from the top like the real VM stack.

use crate::errors::StepError;
use crate::value::{join, top_val, AbsVal};

/// Maximum depth the concrete VM stack can reach; the abstract stack
/// enforces the same bound so `invalid-stack` can be detected identically.
pub const MAX_STACK_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsStack {
    Top,
    Values(Vec<AbsVal>),
}

impl AbsStack {
    pub fn empty() -> Self {
        AbsStack::Values(Vec::new())
    }

    pub fn top() -> Self {
        AbsStack::Top
    }

    pub fn is_top(&self) -> bool {
        matches!(self, AbsStack::Top)
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            AbsStack::Top => None,
            AbsStack::Values(v) => Some(v.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AbsStack::Values(v) if v.is_empty())
    }

    /// Peek the `i`-th element from the top (`back(0)` is the top itself).
    pub fn back(&self, i: usize) -> Option<AbsVal> {
        match self {
            AbsStack::Top => Some(top_val()),
            AbsStack::Values(v) => {
                let len = v.len();
                if i >= len {
                    None
                } else {
                    Some(v[len - 1 - i])
                }
            }
        }
    }

    /// Whether any of `indices` (from the top) is `⊤`. A top stack counts
    /// as every index being top.
    pub fn has_top(&self, indices: &[usize]) -> bool {
        match self {
            AbsStack::Top => true,
            AbsStack::Values(_) => indices
                .iter()
                .any(|&i| self.back(i).map(crate::value::is_top).unwrap_or(true)),
        }
    }

    pub fn push(&mut self, v: AbsVal) -> Result<(), StepError> {
        match self {
            AbsStack::Top => Ok(()),
            AbsStack::Values(vals) => {
                if vals.len() >= MAX_STACK_DEPTH {
                    return Err(StepError::StackValidation);
                }
                vals.push(v);
                Ok(())
            }
        }
    }

    pub fn pop(&mut self) -> Result<AbsVal, StepError> {
        match self {
            AbsStack::Top => Ok(top_val()),
            AbsStack::Values(vals) => vals.pop().ok_or(StepError::StackValidation),
        }
    }

    /// Writes `v` into the `i`-th element from the top, in place. Used by
    /// backwards refinement's write-through step.
    pub fn set_back(&mut self, i: usize, v: AbsVal) -> Result<(), StepError> {
        match self {
            AbsStack::Top => Ok(()),
            AbsStack::Values(vals) => {
                let len = vals.len();
                if i >= len {
                    return Err(StepError::StackValidation);
                }
                vals[len - 1 - i] = v;
                Ok(())
            }
        }
    }

    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// Joins `self` with `other`. `avoid_shrink` keeps the longer length
    /// and copies through positions present on only one side (forcing
    /// ascent); otherwise the shorter length wins (sound but lossy).
    /// Returns the joined stack and whether the join strictly ascended.
    pub fn join_stacks(&self, other: &AbsStack, avoid_shrink: bool) -> (AbsStack, bool) {
        if self.is_top() || other.is_top() {
            return (AbsStack::Top, other.is_top() != self.is_top());
        }
        let (a, b) = match (self, other) {
            (AbsStack::Values(a), AbsStack::Values(b)) => (a, b),
            _ => unreachable!("top cases handled above"),
        };

        if avoid_shrink {
            let max_len = a.len().max(b.len());
            let mut ascended = a.len() != b.len();
            // Build from the top (index 0 = top element) down, then
            // reverse into bottom-to-top storage order.
            let mut from_top = Vec::with_capacity(max_len);
            for i in 0..max_len {
                let from_a = if i < a.len() { Some(a[a.len() - 1 - i]) } else { None };
                let from_b = if i < b.len() { Some(b[b.len() - 1 - i]) } else { None };
                let elem = match (from_a, from_b) {
                    (Some(va), Some(vb)) => {
                        let (joined, asc) = join(va, vb);
                        ascended |= asc;
                        joined
                    }
                    (Some(va), None) => va,
                    (None, Some(vb)) => vb,
                    (None, None) => unreachable!("i is always < max_len"),
                };
                from_top.push(elem);
            }
            from_top.reverse();
            (AbsStack::Values(from_top), ascended)
        } else {
            let min_len = a.len().min(b.len());
            let mut out = Vec::with_capacity(min_len);
            let mut ascended = a.len() != b.len();
            for i in 0..min_len {
                let ia = a.len() - min_len + i;
                let ib = b.len() - min_len + i;
                let (joined, asc) = join(a[ia], b[ib]);
                ascended |= asc;
                out.push(joined);
            }
            (AbsStack::Values(out), ascended)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn push_pop_roundtrip() {
        let mut s = AbsStack::empty();
        s.push(U256::from(1)).unwrap();
        s.push(U256::from(2)).unwrap();
        assert_eq!(s.back(0), Some(U256::from(2)));
        assert_eq!(s.pop().unwrap(), U256::from(2));
        assert_eq!(s.pop().unwrap(), U256::from(1));
    }

    #[test]
    fn pop_on_empty_is_stack_validation_error() {
        let mut s = AbsStack::empty();
        assert_eq!(s.pop().unwrap_err(), StepError::StackValidation);
    }

    #[test]
    fn top_stack_absorbs_push_pop() {
        let mut s = AbsStack::top();
        s.push(U256::from(5)).unwrap();
        assert!(s.is_top());
        assert_eq!(s.pop().unwrap(), top_val());
    }

    #[test]
    fn join_stacks_top_is_absorbing() {
        let s = AbsStack::empty();
        let (joined, _) = AbsStack::top().join_stacks(&s, true);
        assert!(joined.is_top());
        let (joined, _) = s.join_stacks(&AbsStack::top(), false);
        assert!(joined.is_top());
    }

    #[test]
    fn join_stacks_avoid_shrink_keeps_max_len() {
        let a = AbsStack::Values(vec![U256::from(1), U256::from(2)]);
        let b = AbsStack::Values(vec![U256::from(9)]);
        let (joined, ascended) = a.join_stacks(&b, true);
        assert_eq!(joined.len(), Some(2));
        assert!(ascended);
    }

    #[test]
    fn join_stacks_without_avoid_shrink_keeps_min_len() {
        let a = AbsStack::Values(vec![U256::from(1), U256::from(2)]);
        let b = AbsStack::Values(vec![U256::from(9)]);
        let (joined, _) = a.join_stacks(&b, false);
        assert_eq!(joined.len(), Some(1));
    }

    #[test]
    fn has_top_detects_sentinel_at_index() {
        let s = AbsStack::Values(vec![top_val(), U256::from(3)]);
        assert!(s.has_top(&[0]));
        assert!(!s.has_top(&[1]));
    }

    #[test]
    fn set_back_writes_through() {
        let mut s = AbsStack::Values(vec![U256::from(1), top_val()]);
        s.set_back(0, U256::from(42)).unwrap();
        assert_eq!(s.back(0), Some(U256::from(42)));
    }
}
