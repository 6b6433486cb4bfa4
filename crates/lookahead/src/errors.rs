//! Error taxonomy for the two channels described by the failure model: a
//! `StepError` that a single abstract transformer can raise (expected,
//! cacheable, turned into a conservative `mayFail` verdict by the worklist)
//! and a `FacadeError` that only ever escapes at the library boundary
//! (unexpected, never cached, always counted against `num_errors`).

use thiserror::Error;

/// The exact failure-cause strings the analyzer reports, pinned to the
/// literals the original implementation uses so a harness parsing these by
/// string comparison keeps working unchanged.
pub mod failure_cause {
    pub const REACHED_TARGET_INSTRUCTION: &str = "reached-target-instruction";
    pub const REACHED_ASSERTION_FAILED: &str = "reached-assertion-failed";
    pub const INVALID_OPCODE: &str = "invalid-opcode";
    pub const UNSUPPORTED_OPCODE: &str = "unsupported-opcode";
    pub const MEMORY_OVERFLOW: &str = "memory-overflow-failure";
    pub const TOP_MEMORY_RESIZE: &str = "top-memory-resize-failure";
    pub const TOP_STACK: &str = "top-stack";
    pub const STACK_VALIDATION: &str = "invalid-stack";
    pub const JUMP_TO_TOP: &str = "jump-to-top";
    pub const TOP_OFFSET: &str = "top-offset-failure";
    pub const PREFIX_COMPUTATION: &str = "prefix-computation-failure";
    pub const STEP_EXEC: &str = "step-execution-failure";
    pub const INTERNAL: &str = "internal-failure";
}

/// A single abstract transformer step failing in an *expected* way: the
/// worklist turns this into a conservative `mayFail` verdict for the
/// location that produced it, rather than propagating it as a hard error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{}", failure_cause::INVALID_OPCODE)]
    InvalidOpcode,

    #[error("{}", failure_cause::UNSUPPORTED_OPCODE)]
    UnsupportedOpcode,

    #[error("{}", failure_cause::MEMORY_OVERFLOW)]
    MemoryOverflow,

    #[error("{}", failure_cause::TOP_MEMORY_RESIZE)]
    TopMemoryResize,

    #[error("{}", failure_cause::TOP_STACK)]
    TopStack,

    #[error("{}", failure_cause::STACK_VALIDATION)]
    StackValidation,

    #[error("{}", failure_cause::JUMP_TO_TOP)]
    JumpToTop,

    #[error("{}", failure_cause::TOP_OFFSET)]
    TopOffset,

    #[error("{}", failure_cause::STEP_EXEC)]
    StepExec,

    #[error("{}", failure_cause::REACHED_TARGET_INSTRUCTION)]
    ReachedTargetInstruction,

    #[error("{}", failure_cause::REACHED_ASSERTION_FAILED)]
    ReachedAssertionFailed,

    #[error("{}", failure_cause::INTERNAL)]
    Internal,
}

impl StepError {
    /// The exact string the failure-cause literal this variant carries.
    pub fn cause(&self) -> &'static str {
        match self {
            StepError::InvalidOpcode => failure_cause::INVALID_OPCODE,
            StepError::UnsupportedOpcode => failure_cause::UNSUPPORTED_OPCODE,
            StepError::MemoryOverflow => failure_cause::MEMORY_OVERFLOW,
            StepError::TopMemoryResize => failure_cause::TOP_MEMORY_RESIZE,
            StepError::TopStack => failure_cause::TOP_STACK,
            StepError::StackValidation => failure_cause::STACK_VALIDATION,
            StepError::JumpToTop => failure_cause::JUMP_TO_TOP,
            StepError::TopOffset => failure_cause::TOP_OFFSET,
            StepError::StepExec => failure_cause::STEP_EXEC,
            StepError::ReachedTargetInstruction => failure_cause::REACHED_TARGET_INSTRUCTION,
            StepError::ReachedAssertionFailed => failure_cause::REACHED_ASSERTION_FAILED,
            StepError::Internal => failure_cause::INTERNAL,
        }
    }

    /// Whether this cause, once recorded, should suppress future retries of
    /// the same prefix (the original marks target/assertion hits and
    /// interpreter-incompatibility as non-retryable; everything else is
    /// retryable since the fixpoint may still resolve on a fuller replay).
    pub fn avoid_retry(&self) -> bool {
        matches!(
            self,
            StepError::ReachedTargetInstruction | StepError::ReachedAssertionFailed
        )
    }
}

/// Errors that escape the library boundary: conditions the worklist cannot
/// turn into a conservative verdict because they indicate the analyzer was
/// driven incorrectly, not that the program under analysis is unreachable.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("analysis not yet started")]
    NotStarted,

    #[error("overly long prefix")]
    PrefixTooLong,

    #[error("expected compatible EVM interpreter")]
    IncompatibleInterpreter,

    #[error("{}({0})", failure_cause::PREFIX_COMPUTATION)]
    PrefixComputation(String),

    #[error("{}", failure_cause::INTERNAL)]
    Internal(#[from] StepError),
}

impl FacadeError {
    /// Formats the `prefix-computation-failure(<inner>)` wrapper the facade
    /// reports when replaying the prefix itself hits a `mayFail` step.
    pub fn prefix_computation(inner_cause: &str) -> Self {
        FacadeError::PrefixComputation(inner_cause.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_cause_matches_display() {
        assert_eq!(StepError::InvalidOpcode.cause(), "invalid-opcode");
        assert_eq!(StepError::InvalidOpcode.to_string(), "invalid-opcode");
    }

    #[test]
    fn target_hits_avoid_retry() {
        assert!(StepError::ReachedTargetInstruction.avoid_retry());
        assert!(StepError::ReachedAssertionFailed.avoid_retry());
        assert!(!StepError::TopStack.avoid_retry());
    }

    #[test]
    fn prefix_computation_wraps_inner_cause() {
        let err = FacadeError::prefix_computation(failure_cause::JUMP_TO_TOP);
        assert_eq!(err.to_string(), "prefix-computation-failure(jump-to-top)");
    }
}
