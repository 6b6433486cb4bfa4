//! The constant-propagation abstract value domain: a known 256-bit word, or
//! the "top" sentinel standing in for "unknown".
//!
//! `⊤` is not `Option<U256>::None` on purpose: the original analyzer
//! represents it as a fixed, astronomically unlikely constant so that
//! abstract values can be stored, compared and hashed exactly like concrete
//! ones without an extra enum discriminant threading through the stack and
//! memory machinery. We keep that representation here rather than switching
//! to a tagged `enum AbsVal { Top, Const(U256) }`: every opcode transformer
//! in `dispatch` pops/pushes `AbsVal`s through the same code paths a real
//! concrete word would take, and a sentinel constant lets that code stay
//! untouched by the abstract/concrete distinction.

use ethereum_types::U256;

/// `4669523849932130508876392554713407521319117239637943224980015676156491`
/// truncated to 256 bits (a no-op here, the value already fits in 232 bits).
/// Picked to be vanishingly unlikely to occur as a genuine program constant.
pub const TOP_VAL: U256 = U256([
    0xce98_9021_806c_6a4b,
    0x91db_9a33_2506_b209,
    0xb1c4_b7c0_96dc_ea39,
    0x0000_00ad_33c7_b1d8,
]);

/// A constant-propagation abstract value: either a known 256-bit word or
/// the `⊤` sentinel meaning "no information".
pub type AbsVal = U256;

/// Returns the `⊤` abstract value.
pub fn top_val() -> AbsVal {
    TOP_VAL
}

/// Whether `v` is `⊤`.
pub fn is_top(v: AbsVal) -> bool {
    v == TOP_VAL
}

/// Join on the constant-propagation lattice: `v1` if both sides agree,
/// `⊤` otherwise. Returns whether the join actually moved upward, so
/// callers (the worklist fixpoint) can tell whether re-enqueuing a
/// successor is required.
pub fn join(v1: AbsVal, v2: AbsVal) -> (AbsVal, bool) {
    if is_top(v1) || v1 == v2 {
        (v1, false)
    } else {
        (top_val(), true)
    }
}

/// Meet on the constant-propagation lattice, used by backwards refinement
/// to narrow a value already believed to be `⊤` down to something a
/// peephole pattern has inferred. Returns `None` (bottom: an infeasible
/// combination) when both sides are known and disagree.
pub fn meet(v1: AbsVal, v2: AbsVal) -> Option<AbsVal> {
    if is_top(v2) {
        Some(v1)
    } else if is_top(v1) {
        Some(v2)
    } else if v1 == v2 {
        Some(v1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_is_top() {
        assert!(is_top(top_val()));
    }

    #[test]
    fn known_value_is_not_top() {
        assert!(!is_top(U256::from(42)));
    }

    #[test]
    fn join_of_equal_constants_is_that_constant() {
        let v = U256::from(7);
        assert_eq!(join(v, v), (v, false));
    }

    #[test]
    fn join_of_differing_constants_is_top() {
        let (joined, moved) = join(U256::from(1), U256::from(2));
        assert!(is_top(joined));
        assert!(moved);
    }

    #[test]
    fn join_is_absorbing_for_top() {
        let (joined, moved) = join(top_val(), U256::from(9));
        assert!(is_top(joined));
        assert!(!moved);
    }

    #[test]
    fn meet_of_top_and_constant_is_the_constant() {
        assert_eq!(meet(top_val(), U256::from(5)), Some(U256::from(5)));
        assert_eq!(meet(U256::from(5), top_val()), Some(U256::from(5)));
    }

    #[test]
    fn meet_of_disagreeing_constants_is_bottom() {
        assert_eq!(meet(U256::from(1), U256::from(2)), None);
    }

    #[test]
    fn meet_of_equal_constants_is_that_constant() {
        let v = U256::from(3);
        assert_eq!(meet(v, v), Some(v));
    }
}
