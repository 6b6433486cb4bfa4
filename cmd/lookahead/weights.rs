//! Reads `branch_msg/{prefix,targets}.json`, drives `ethrex-lookahead`'s
//! facade over every replayed branch, and writes `branch_msg/weight.json`
//! (spec.md §6 CLI).

use std::collections::BTreeMap;
use std::path::Path;

use ethrex_lookahead::{FacadeError, LookaheadAnalyzer};
use serde::Deserialize;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::{debug, info};

/// Cause strings whose presence (even wrapped, e.g.
/// `prefix-computation-failure(reached-target-instruction)`) earns a branch
/// the ×16 target-hit multiplier.
const TARGET_HIT_CAUSE: &str = "reached-target-instruction";
const TARGET_HIT_MULTIPLIER: f64 = 16.0;

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("failed to serialize weight.json: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("contract {contract}: invalid hex in Code field: {source}")]
    InvalidCode { contract: String, source: hex::FromHexError },
    #[error("contract {contract}, branch {branch}: {source}")]
    Analysis {
        contract: String,
        branch: String,
        source: FacadeError,
    },
}

/// One contract's entry in `prefix.json`: its runtime bytecode and, per
/// branch label, the replayed PC sequence that reached this lookahead call.
#[derive(Debug, Deserialize)]
struct ContractPrefix {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Prefix")]
    prefix: BTreeMap<String, Vec<usize>>,
    #[serde(rename = "Coverage")]
    #[allow(dead_code)]
    coverage: i64,
}

type PrefixFile = BTreeMap<String, ContractPrefix>;
type TargetsFile = BTreeMap<String, Vec<usize>>;
type WeightFile = BTreeMap<String, BTreeMap<String, f64>>;

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, WeightError> {
    let path_str = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| WeightError::Read {
        path: path_str.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| WeightError::Parse { path: path_str, source })
}

/// The number of leading ASCII digits in a branch label, used to rank
/// branches by (approximate) path length. A label with no leading digits has
/// length 0, the shortest possible path.
fn leading_int_len(label: &str) -> usize {
    label.chars().take_while(|c| c.is_ascii_digit()).count()
}

/// Ranks `labels` by descending leading-integer length (longer replayed
/// paths are harder to re-reach and so rank lower, i.e. closer to 0). Labels
/// whose leading integer has the same digit-count share the same rank,
/// mirroring the original's grouping of branches by their shared `branchNum`
/// before assigning `mult`. Returns a `label -> rank` map.
fn rank_branches(labels: &[&String]) -> BTreeMap<String, usize> {
    let mut lengths: Vec<usize> = labels.iter().map(|l| leading_int_len(l)).collect();
    lengths.sort_unstable_by(|a, b| b.cmp(a));
    lengths.dedup();

    labels
        .iter()
        .map(|label| {
            let len = leading_int_len(label);
            let rank = lengths.iter().position(|&l| l == len).unwrap_or(0);
            ((*label).clone(), rank)
        })
        .collect()
}

pub fn run(dir: &Path, base_weight: f64) -> Result<(), WeightError> {
    let prefixes: PrefixFile = read_json(&dir.join("prefix.json"))?;
    let targets: TargetsFile = read_json(&dir.join("targets.json"))?;

    let mut weights: WeightFile = BTreeMap::new();

    for (contract, entry) in &prefixes {
        let code_hex = entry.code.trim_start_matches("0x");
        let code = hex::decode(code_hex).map_err(|source| WeightError::InvalidCode {
            contract: contract.clone(),
            source,
        })?;
        let code_hash: [u8; 32] = Keccak256::digest(&code).into();

        let mut analyzer = LookaheadAnalyzer::default();
        for &pc in targets.get(contract).into_iter().flatten() {
            analyzer.add_target_instruction(code_hash, pc);
        }

        let labels: Vec<&String> = entry.prefix.keys().collect();
        let ranks = rank_branches(&labels);
        let mut contract_weights = BTreeMap::new();

        for (call_number, label) in labels.iter().enumerate() {
            let pcs = &entry.prefix[*label];
            analyzer.start(call_number as u64 + 1, code.clone(), code_hash);
            for &pc in pcs {
                analyzer.append_prefix_instruction(call_number as u64 + 1, pc);
            }

            let outcome = analyzer
                .can_ignore_suffix(call_number as u64 + 1)
                .map_err(|source| WeightError::Analysis {
                    contract: contract.clone(),
                    branch: (*label).clone(),
                    source,
                })?;

            let rank = ranks.get(*label).copied().unwrap_or(0);
            let mut weight = (1 + rank) as f64 * base_weight;
            if outcome.cause.as_deref().is_some_and(|c| c.contains(TARGET_HIT_CAUSE)) {
                weight *= TARGET_HIT_MULTIPLIER;
            }

            debug!(contract, branch = %label, can_ignore = outcome.can_ignore, weight, "branch weighted");
            contract_weights.insert((*label).clone(), weight);
        }

        weights.insert(contract.clone(), contract_weights);
    }

    let out_path = dir.join("weight.json");
    let serialized = serde_json::to_string_pretty(&weights)?;
    std::fs::write(&out_path, serialized).map_err(|source| WeightError::Write {
        path: out_path.display().to_string(),
        source,
    })?;

    info!(contracts = prefixes.len(), path = %out_path.display(), "wrote weight.json");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_int_len_counts_digit_prefix() {
        assert_eq!(leading_int_len("12-then"), 2);
        assert_eq!(leading_int_len("then-branch"), 0);
        assert_eq!(leading_int_len("3"), 1);
    }

    #[test]
    fn rank_branches_ties_labels_with_equal_leading_int_length() {
        let a = "20-a".to_string();
        let b = "5-b".to_string();
        let c = "90-c".to_string();
        let labels = vec![&a, &b, &c];
        let ranks = rank_branches(&labels);
        // "20-a" and "90-c" both have a 2-digit leading integer, so they tie
        // for rank 0 despite 90 > 20; "5-b" is 1 digit and ranks below them.
        assert_eq!(ranks[&a], 0);
        assert_eq!(ranks[&c], 0);
        assert_eq!(ranks[&b], 1);
    }

    #[test]
    fn serializes_and_parses_prefix_file_shape() {
        let json = r#"{
            "MyContract": {
                "Code": "6000",
                "Prefix": {"5-branch": [0, 2]},
                "Coverage": 3
            }
        }"#;
        let parsed: PrefixFile = serde_json::from_str(json).unwrap();
        let entry = &parsed["MyContract"];
        assert_eq!(entry.code, "6000");
        assert_eq!(entry.prefix["5-branch"], vec![0, 2]);
        assert_eq!(entry.coverage, 3);
    }
}
