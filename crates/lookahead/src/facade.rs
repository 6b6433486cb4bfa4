//! The lookahead facade (spec.md §4.8): the session-scoped, stateful API a
//! fuzzing harness actually drives. Owns per-call-number prefixes and their
//! rolling hashes, the verdict cache keyed by prefix fingerprint, target and
//! covered-assertion sets keyed by code hash, and the counters/timer a
//! harness inspects after a run.

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::analyzer::{self, AnalyzeResult, TargetContext};
use crate::config::LookaheadConfig;
use crate::errors::{FacadeError, StepError};
use crate::fingerprint::RollingHash;

/// Per-call-number session state: the replayed prefix, its rolling hash, and
/// the hash absorbing subordinate calls' identities.
#[derive(Debug, Clone)]
struct Session {
    code: Vec<u8>,
    code_hash: [u8; 32],
    prefix: Vec<usize>,
    prefix_truncated: bool,
    prefix_hash: RollingHash,
    summary_hash: RollingHash,
}

impl Session {
    fn new(code: Vec<u8>, code_hash: [u8; 32]) -> Self {
        Session {
            code,
            code_hash,
            prefix: Vec::new(),
            prefix_truncated: false,
            prefix_hash: RollingHash::new(),
            summary_hash: RollingHash::new(),
        }
    }

    fn current_path_id(&self) -> String {
        format!("{:x}+{:x}", self.prefix_hash.value(), self.summary_hash.value())
    }
}

/// A verdict cached under a prefix fingerprint: `cause` is `None` for
/// `noFail`, `Some(cause)` otherwise.
#[derive(Debug, Clone)]
struct CachedVerdict {
    can_ignore: bool,
    avoid_retry: bool,
    cause: Option<String>,
}

/// The result of `CanIgnoreSuffix`, matching spec.md §6's library surface
/// table: `(can_ignore, avoid_retry, cause, path_id, error)`.
#[derive(Debug, Clone)]
pub struct CanIgnoreSuffixOutcome {
    pub can_ignore: bool,
    pub avoid_retry: bool,
    pub cause: Option<String>,
    pub path_id: String,
    pub error: Option<String>,
}

/// Running counters a harness inspects after a batch of `CanIgnoreSuffix`
/// calls, plus the per-cause breakdown used to weight branches in the CLI.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub num_success: u64,
    pub num_fail: u64,
    pub num_prefix_fail: u64,
    pub num_errors: u64,
    pub per_cause: FxHashMap<String, u64>,
}

impl Counters {
    fn bump_cause(&mut self, cause: &str) {
        *self.per_cause.entry(cause.to_string()).or_insert(0) += 1;
    }
}

/// The full lookahead analyzer facade: one instance per fuzzing harness,
/// long-lived across many `Start`/`CanIgnoreSuffix` cycles.
pub struct LookaheadAnalyzer {
    config: LookaheadConfig,
    sessions: FxHashMap<u64, Session>,
    targets: FxHashMap<[u8; 32], FxHashSet<usize>>,
    covered_assertions: FxHashMap<[u8; 32], FxHashSet<usize>>,
    assertion_mode: bool,
    cache: FxHashMap<u32, CachedVerdict>,
    covered_paths_seen: FxHashMap<String, FxHashSet<String>>,
    coverage_counts: FxHashMap<String, u64>,
    counters: Counters,
    total_time: Duration,
    analyzer_invocations: u64,
}

impl Default for LookaheadAnalyzer {
    fn default() -> Self {
        LookaheadAnalyzer::new(LookaheadConfig::default())
    }
}

impl LookaheadAnalyzer {
    pub fn new(config: LookaheadConfig) -> Self {
        LookaheadAnalyzer {
            config,
            sessions: FxHashMap::default(),
            targets: FxHashMap::default(),
            covered_assertions: FxHashMap::default(),
            assertion_mode: false,
            cache: FxHashMap::default(),
            covered_paths_seen: FxHashMap::default(),
            coverage_counts: FxHashMap::default(),
            counters: Counters::default(),
            total_time: Duration::ZERO,
            analyzer_invocations: 0,
        }
    }

    /// Initializes a new session for `call_number`. `call_number == 0`
    /// clears every session, starting a fresh top-level run.
    pub fn start(&mut self, call_number: u64, code: Vec<u8>, code_hash: [u8; 32]) {
        if call_number < 1 {
            debug!("clearing all lookahead sessions for a new top-level run");
            self.sessions.clear();
            return;
        }
        self.sessions.insert(call_number, Session::new(code, code_hash));
    }

    /// Appends `pc` to `call_number`'s prefix if under `max_prefix_len`,
    /// mixing it into the prefix hash unconditionally.
    pub fn append_prefix_instruction(&mut self, call_number: u64, pc: usize) {
        let Some(session) = self.sessions.get_mut(&call_number) else {
            warn!(call_number, "append_prefix_instruction on unknown session");
            return;
        };
        if session.prefix.len() < self.config.max_prefix_len {
            session.prefix.push(pc);
        } else {
            session.prefix_truncated = true;
        }
        session.prefix_hash.absorb_pc(pc);
    }

    /// Mixes the subordinate call's prefix and summary hashes into
    /// `call_number`'s summary hash.
    pub fn append_prefix_summary(&mut self, call_number: u64, sub_call_number: u64) {
        let Some(sub) = self.sessions.get(&sub_call_number) else {
            warn!(sub_call_number, "append_prefix_summary from unknown subordinate session");
            return;
        };
        let (sub_prefix_hash, sub_summary_hash) = (sub.prefix_hash, sub.summary_hash);
        let Some(session) = self.sessions.get_mut(&call_number) else {
            warn!(call_number, "append_prefix_summary on unknown session");
            return;
        };
        session.summary_hash.absorb_hash(sub_prefix_hash);
        session.summary_hash.absorb_hash(sub_summary_hash);
    }

    /// The fingerprinted cache key for the suffix analysis, consulting the
    /// cache on a fingerprint hit and otherwise running the worklist
    /// fixpoint (§4.7) lazily.
    pub fn can_ignore_suffix(&mut self, call_number: u64) -> Result<CanIgnoreSuffixOutcome, FacadeError> {
        let Some(session) = self.sessions.get(&call_number) else {
            return Err(FacadeError::NotStarted);
        };
        let path_id = session.current_path_id();

        if session.prefix_truncated {
            let msg = FacadeError::PrefixTooLong.to_string();
            if self.config.verbose {
                trace!(call_number, "prefix exceeded max_prefix_len");
            }
            return Ok(CanIgnoreSuffixOutcome {
                can_ignore: false,
                avoid_retry: true,
                cause: None,
                path_id,
                error: Some(msg),
            });
        }

        let fingerprint = session.prefix_hash.value();
        if let Some(cached) = self.cache.get(&fingerprint) {
            if self.config.verbose {
                trace!(call_number, fingerprint, "cache hit");
            }
            return Ok(CanIgnoreSuffixOutcome {
                can_ignore: cached.can_ignore,
                avoid_retry: cached.avoid_retry,
                cause: cached.cause.clone(),
                path_id,
                error: None,
            });
        }

        let code = session.code.clone();
        let prefix = session.prefix.clone();
        let code_hash = session.code_hash;

        let targets = self.targets.get(&code_hash);
        let empty_covered = FxHashSet::default();
        let covered_assertions = self.covered_assertions.get(&code_hash).unwrap_or(&empty_covered);
        let ctx = TargetContext {
            targets,
            assertion_mode: self.assertion_mode,
            covered_assertions,
        };

        self.analyzer_invocations += 1;
        let start = Instant::now();
        let result = analyzer::analyze(&code, &prefix, &self.config, &ctx);
        self.total_time += start.elapsed();
        debug!(call_number, fingerprint, ?result, "analyzer invocation complete");

        let outcome = match result {
            AnalyzeResult::NoFail => {
                self.counters.num_success += 1;
                self.cache.insert(
                    fingerprint,
                    CachedVerdict { can_ignore: true, avoid_retry: false, cause: None },
                );
                CanIgnoreSuffixOutcome {
                    can_ignore: true,
                    avoid_retry: false,
                    cause: None,
                    path_id,
                    error: None,
                }
            }
            AnalyzeResult::MayFail(e) if is_unexpected(&e) => {
                self.counters.num_errors += 1;
                CanIgnoreSuffixOutcome {
                    can_ignore: false,
                    avoid_retry: false,
                    cause: None,
                    path_id,
                    error: Some(e.to_string()),
                }
            }
            AnalyzeResult::MayFail(e) => {
                self.counters.num_fail += 1;
                self.counters.bump_cause(e.cause());
                self.cache.insert(
                    fingerprint,
                    CachedVerdict {
                        can_ignore: false,
                        avoid_retry: e.avoid_retry(),
                        cause: Some(e.cause().to_string()),
                    },
                );
                CanIgnoreSuffixOutcome {
                    can_ignore: false,
                    avoid_retry: e.avoid_retry(),
                    cause: Some(e.cause().to_string()),
                    path_id,
                    error: None,
                }
            }
            AnalyzeResult::PrefixFail(e) if is_unexpected(&e) => {
                self.counters.num_errors += 1;
                CanIgnoreSuffixOutcome {
                    can_ignore: false,
                    avoid_retry: false,
                    cause: None,
                    path_id,
                    error: Some(e.to_string()),
                }
            }
            AnalyzeResult::PrefixFail(e) => {
                let cause = FacadeError::prefix_computation(e.cause()).to_string();
                self.counters.num_prefix_fail += 1;
                self.counters.bump_cause(&cause);
                self.cache.insert(
                    fingerprint,
                    CachedVerdict { can_ignore: false, avoid_retry: true, cause: Some(cause.clone()) },
                );
                CanIgnoreSuffixOutcome {
                    can_ignore: false,
                    avoid_retry: true,
                    cause: Some(cause),
                    path_id,
                    error: None,
                }
            }
        };

        Ok(outcome)
    }

    /// `"<prefix_hash>+<summary_hash>"` for `call_number`, or an empty
    /// string if the session does not exist.
    pub fn current_path_id(&self, call_number: u64) -> String {
        self.sessions.get(&call_number).map(Session::current_path_id).unwrap_or_default()
    }

    pub fn add_target_instruction(&mut self, code_hash: [u8; 32], pc: usize) {
        self.targets.entry(code_hash).or_default().insert(pc);
    }

    /// `location` is `"<code_hash as 64 hex chars>:<pc>"`.
    pub fn add_target_location(&mut self, location: &str) {
        match parse_location(location) {
            Some((code_hash, pc)) => self.add_target_instruction(code_hash, pc),
            None => warn!(location, "malformed target location string"),
        }
    }

    pub fn has_target_instructions(&self) -> bool {
        self.targets.values().any(|s| !s.is_empty())
    }

    pub fn is_target_instruction(&self, code_hash: [u8; 32], pc: usize) -> bool {
        self.targets.get(&code_hash).is_some_and(|s| s.contains(&pc))
    }

    /// Switches the analyzer into assertion-failed hunting mode (Scenario
    /// G): subsequent `CanIgnoreSuffix` calls look for the
    /// `AssertionFailed(string)` event instead of `INVALID`-opcode targets.
    pub fn target_assertion_failed(&mut self) {
        self.assertion_mode = true;
    }

    pub fn is_targeting_assertion_failed(&self) -> bool {
        self.assertion_mode
    }

    pub fn record_covered_assertion(&mut self, code_hash: [u8; 32], pc: usize) {
        self.covered_assertions.entry(code_hash).or_default().insert(pc);
    }

    pub fn is_covered_assertion(&self, code_hash: [u8; 32], pc: usize) -> bool {
        self.covered_assertions.get(&code_hash).is_some_and(|s| s.contains(&pc))
    }

    /// The first time `path_id` is recorded for a given `lid`, bumps that
    /// `lid`'s coverage counter (`original_source`'s `RecordCoveredPath`).
    pub fn record_covered_path(&mut self, path_id: &str, lid: &str) {
        let seen = self.covered_paths_seen.entry(lid.to_string()).or_default();
        if seen.insert(path_id.to_string()) {
            *self.coverage_counts.entry(lid.to_string()).or_insert(0) += 1;
        }
    }

    pub fn covered_paths_per_lid(&self) -> FxHashMap<String, u64> {
        self.coverage_counts.clone()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn time(&self) -> Duration {
        self.total_time
    }

    /// Number of times the worklist fixpoint actually ran (as opposed to a
    /// cache hit) — used by tests to assert `CanIgnoreSuffix` caches.
    pub fn analyzer_invocations(&self) -> u64 {
        self.analyzer_invocations
    }
}

/// `StepError` variants that indicate the analyzer itself misbehaved rather
/// than a conservative, cacheable verdict about the program under analysis.
fn is_unexpected(e: &StepError) -> bool {
    matches!(e, StepError::Internal | StepError::StepExec)
}

fn parse_location(s: &str) -> Option<([u8; 32], usize)> {
    let (hash_hex, pc_str) = s.rsplit_once(':')?;
    if hash_hex.len() != 64 {
        return None;
    }
    let mut hash = [0u8; 32];
    for (i, byte) in hash.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hash_hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    let pc = pc_str.parse().ok()?;
    Some((hash, pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn scenario_a_target_instruction_reached() {
        let mut f = LookaheadAnalyzer::default();
        let code = vec![0x60, 0x0A, 0x60, 0x14, 0x01, 0xFE];
        let code_hash = hash(1);
        f.start(1, code, code_hash);
        f.add_target_instruction(code_hash, 5);
        for pc in [0usize, 2, 4] {
            f.append_prefix_instruction(1, pc);
        }
        let outcome = f.can_ignore_suffix(1).unwrap();
        assert!(!outcome.can_ignore);
        assert_eq!(outcome.cause.as_deref(), Some("reached-target-instruction"));
        assert!(outcome.avoid_retry);
    }

    #[test]
    fn scenario_b_covered_assertion_is_a_sink() {
        let mut f = LookaheadAnalyzer::default();
        let code = vec![0x60, 0x0A, 0x60, 0x14, 0x01, 0xFE];
        let code_hash = hash(2);
        f.start(1, code, code_hash);
        f.record_covered_assertion(code_hash, 5);
        for pc in [0usize, 2, 4] {
            f.append_prefix_instruction(1, pc);
        }
        let outcome = f.can_ignore_suffix(1).unwrap();
        assert!(outcome.can_ignore);
    }

    #[test]
    fn scenario_f_cache_hit_skips_second_analyzer_run() {
        let mut f = LookaheadAnalyzer::default();
        let code = vec![0x60, 0x0A, 0x60, 0x14, 0x01, 0xFE];
        let code_hash = hash(3);
        f.start(1, code.clone(), code_hash);
        f.add_target_instruction(code_hash, 5);
        for pc in [0usize, 2, 4] {
            f.append_prefix_instruction(1, pc);
        }
        let first = f.can_ignore_suffix(1).unwrap();
        assert_eq!(f.analyzer_invocations(), 1);

        f.start(2, code, code_hash);
        for pc in [0usize, 2, 4] {
            f.append_prefix_instruction(2, pc);
        }
        let second = f.can_ignore_suffix(2).unwrap();
        assert_eq!(f.analyzer_invocations(), 1);
        assert_eq!(first.cause, second.cause);
        assert_eq!(first.can_ignore, second.can_ignore);
    }

    #[test]
    fn current_path_id_combines_prefix_and_summary_hash() {
        let mut f = LookaheadAnalyzer::default();
        f.start(1, vec![0x00], hash(4));
        f.append_prefix_instruction(1, 0);
        let id = f.current_path_id(1);
        assert!(id.contains('+'));
    }

    #[test]
    fn record_covered_path_counts_first_occurrence_only() {
        let mut f = LookaheadAnalyzer::default();
        f.record_covered_path("p1", "branch-a");
        f.record_covered_path("p1", "branch-a");
        f.record_covered_path("p2", "branch-a");
        assert_eq!(f.covered_paths_per_lid().get("branch-a"), Some(&2));
    }

    #[test]
    fn add_target_location_parses_hash_and_pc() {
        let mut f = LookaheadAnalyzer::default();
        let loc = format!("{}:{}", "11".repeat(32), 7);
        f.add_target_location(&loc);
        assert!(f.is_target_instruction(hash(0x11), 7));
    }

    #[test]
    fn not_started_session_is_an_error() {
        let mut f = LookaheadAnalyzer::default();
        assert!(matches!(f.can_ignore_suffix(42), Err(FacadeError::NotStarted)));
    }
}
