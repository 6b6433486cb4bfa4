//! Lookahead constant-propagation analyzer for EVM-style bytecode.
//!
//! Given an execution prefix (a concrete sequence of opcodes already taken)
//! and a set of target instructions, this crate answers whether *any*
//! continuation of the prefix can possibly reach a target. It never
//! simulates real storage, calldata or gas: the abstract domain tracks only
//! which stack/memory slots are known constants versus unknown ("top"), and
//! a backwards peephole pass refines conditional branches before the
//! forward worklist fixpoint runs.
//!
//! The crate is organized the way the analysis is described in its design
//! document: a small abstract-value domain (`value`), abstract stack/memory
//! (`stack`, `memory`), a jump table of per-opcode transformers
//! (`dispatch`), the backwards refinement pass (`refine`), the worklist
//! fixpoint itself (`analyzer`), and a thin session-scoped facade
//! (`facade`) that a fuzzing harness drives.

pub mod analyzer;
pub mod concrete;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod facade;
pub mod fingerprint;
pub mod memory;
pub mod opcodes;
pub mod prev_pc;
pub mod refine;
pub mod stack;
pub mod state;
pub mod value;

pub use config::LookaheadConfig;
pub use errors::{FacadeError, StepError};
pub use facade::LookaheadAnalyzer;
pub use opcodes::Opcode;
pub use value::AbsVal;
