//! Abstract state: a stack/memory pair, or bottom ("no possible state",
//! used for unreachable program points and never placed on the worklist).

use crate::memory::AbsMem;
use crate::stack::AbsStack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsState {
    pub stack: AbsStack,
    pub mem: AbsMem,
}

impl AbsState {
    pub fn new(stack: AbsStack, mem: AbsMem) -> Self {
        AbsState { stack, mem }
    }

    pub fn initial() -> Self {
        AbsState::new(AbsStack::empty(), AbsMem::empty())
    }

    /// Joins two non-bottom states. `avoid_shrink` forwards to
    /// `join_stacks` (see §4.2); memory join has no such knob.
    pub fn join_states(&self, other: &AbsState, avoid_shrink: bool) -> (AbsState, bool) {
        let (stack, stack_ascended) = self.stack.join_stacks(&other.stack, avoid_shrink);
        let mem = self.mem.join_mems(&other.mem);
        let mem_ascended = mem != self.mem;
        (AbsState::new(stack, mem), stack_ascended || mem_ascended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn initial_state_is_empty() {
        let s = AbsState::initial();
        assert_eq!(s.stack.len(), Some(0));
        assert_eq!(s.mem.len(), Some(0));
    }

    #[test]
    fn join_states_propagates_ascent() {
        let mut a = AbsState::initial();
        a.stack.push(U256::from(1)).unwrap();
        let mut b = AbsState::initial();
        b.stack.push(U256::from(2)).unwrap();
        let (joined, ascended) = a.join_states(&b, true);
        assert!(ascended);
        assert!(crate::value::is_top(joined.stack.back(0).unwrap()));
    }
}
