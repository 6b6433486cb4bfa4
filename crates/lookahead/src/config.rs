//! Core-internal configuration knobs (spec.md §6), gathered into one struct
//! instead of scattered constants so a harness embedding this crate can tune
//! disjunct budgets or enable verbose tracing without touching the analyzer.

/// Tunables for the worklist fixpoint and backwards refinement.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookaheadConfig {
    /// Prefixes longer than this are rejected with `PrefixTooLong` rather
    /// than replayed.
    pub max_prefix_len: usize,
    /// Distinct stack-length disjuncts kept per PC before collapsing to the
    /// `-1` key. `0` means "always collapse" (the original's default).
    pub max_disjuncts: usize,
    /// When set, a join that does not strictly ascend discards the new
    /// state rather than re-enqueuing — more conservative, cheaper.
    pub bounded_joins: bool,
    /// When set, resizing memory whose new length is driven by a top offset
    /// or size raises `MemoryOverflow` rather than collapsing to top memory.
    pub fail_on_top_mem_resize: bool,
    /// Step budget for `backwards_refine_stack` at each `JUMPI` fork.
    pub back_prop_steps: usize,
    /// Enables `tracing::trace!`-level detail around worklist steps and
    /// cache hits/misses, beyond the `debug`-level spans emitted regardless.
    pub verbose: bool,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        LookaheadConfig {
            max_prefix_len: 8192,
            max_disjuncts: 0,
            bounded_joins: false,
            fail_on_top_mem_resize: false,
            back_prop_steps: 16,
            verbose: false,
        }
    }
}
