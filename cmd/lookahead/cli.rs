use std::path::PathBuf;

use clap::Parser;

use crate::weights::{self, WeightError};

/// Thin CLI wrapper around `ethrex-lookahead` (spec.md §6): reads a
/// fuzzing harness's replayed prefixes and target instructions, runs
/// `CanIgnoreSuffix` for every branch of every contract, and writes back a
/// per-branch weight a fuzzer can use to prioritize exploration.
#[derive(Parser)]
#[command(
    name = "ethrex-lookahead",
    author = "LambdaClass",
    about = "Weights fuzzing branches by lookahead-analyzer reachability"
)]
pub struct CLI {
    /// Directory containing `prefix.json` and `targets.json`, and where
    /// `weight.json` is written.
    #[arg(long = "dir", default_value = "branch_msg")]
    pub dir: PathBuf,

    /// Base weight every branch starts from before rank and target-hit
    /// multipliers are applied.
    #[arg(long = "base-weight", default_value_t = 1.0)]
    pub base_weight: f64,
}

impl CLI {
    pub fn run(&self) -> Result<(), WeightError> {
        weights::run(&self.dir, self.base_weight)
    }
}
