//! Failure recovery policy: retry, skip or abort.
//!
//! Decision order for a failed attempt:
//! 1. advisor suggestion, if one is installed and the action is legal;
//! 2. the step's explicit `on_failure`, if legal;
//! 3. the legal candidates among Retry and Skip, ranked by historical success
//!    rate for the error fingerprint (ties favour Retry);
//! 4. Abort.
//!
//! Retry is legal while retries remain and the error is retryable; Skip only for
//! optional steps.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StepError;
use crate::plan::{FailureStrategy, PlanStep};

const FINGERPRINT_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Abort,
}

impl From<FailureStrategy> for RecoveryAction {
    fn from(strategy: FailureStrategy) -> Self {
        match strategy {
            FailureStrategy::Retry => Self::Retry,
            FailureStrategy::Skip => Self::Skip,
            FailureStrategy::Abort => Self::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry { delay: Duration },
    Skip,
    Abort,
}

impl RecoveryDecision {
    pub fn action(self) -> RecoveryAction {
        match self {
            Self::Retry { .. } => RecoveryAction::Retry,
            Self::Skip => RecoveryAction::Skip,
            Self::Abort => RecoveryAction::Abort,
        }
    }
}

/// One failed attempt of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub message: String,
    pub fingerprint: String,
}

pub struct FailureContext<'a> {
    pub step: &'a PlanStep,
    pub error: &'a StepError,
    /// Retries already used for this step.
    pub retries_used: u32,
    pub history: &'a [AttemptRecord],
}

/// Pluggable source of recovery suggestions.
pub trait ErrorAdvisor: Send + Sync {
    fn suggest(&self, failure: &FailureContext<'_>) -> Option<RecoveryAction>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub samples: u32,
    pub successes: u32,
}

impl OutcomeStats {
    /// Laplace-smoothed success rate.
    pub fn rate(&self) -> f64 {
        (f64::from(self.successes) + 1.0) / (f64::from(self.samples) + 2.0)
    }
}

/// Frequency table of (fingerprint, action) outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeTable {
    #[serde(default)]
    pub entries: BTreeMap<String, BTreeMap<RecoveryAction, OutcomeStats>>,
}

impl OutcomeTable {
    pub fn record(&mut self, fingerprint: &str, action: RecoveryAction, success: bool) {
        let stats = self
            .entries
            .entry(fingerprint.to_string())
            .or_default()
            .entry(action)
            .or_default();
        stats.samples += 1;
        if success {
            stats.successes += 1;
        }
    }

    pub fn stats(&self, fingerprint: &str, action: RecoveryAction) -> OutcomeStats {
        self.entries
            .get(fingerprint)
            .and_then(|actions| actions.get(&action))
            .copied()
            .unwrap_or_default()
    }
}

pub struct RecoveryPolicy {
    table: Mutex<OutcomeTable>,
    advisor: Option<Box<dyn ErrorAdvisor>>,
    learn: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(OutcomeTable::default())
    }
}

impl RecoveryPolicy {
    pub fn new(table: OutcomeTable) -> Self {
        Self {
            table: Mutex::new(table),
            advisor: None,
            learn: true,
        }
    }

    pub fn with_advisor(mut self, advisor: Box<dyn ErrorAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// When disabled, outcomes are neither recorded nor used for ranking.
    pub fn learning(mut self, learn: bool) -> Self {
        self.learn = learn;
        self
    }

    pub fn decide(&self, failure: &FailureContext<'_>) -> RecoveryDecision {
        if let Some(advisor) = &self.advisor
            && let Some(action) = advisor.suggest(failure)
        {
            if is_legal(action, failure) {
                debug!(step_id = %failure.step.id, ?action, "advisor decision");
                return to_decision(action, failure);
            }
            debug!(step_id = %failure.step.id, ?action, "ignoring illegal advisor suggestion");
        }

        if let Some(strategy) = failure.step.on_failure {
            let action = RecoveryAction::from(strategy);
            if is_legal(action, failure) {
                return to_decision(action, failure);
            }
        }

        let candidates: Vec<RecoveryAction> = [RecoveryAction::Retry, RecoveryAction::Skip]
            .into_iter()
            .filter(|action| is_legal(*action, failure))
            .collect();
        let action = match candidates.as_slice() {
            [] => RecoveryAction::Abort,
            [only] => *only,
            _ => self.rank(failure),
        };
        to_decision(action, failure)
    }

    fn rank(&self, failure: &FailureContext<'_>) -> RecoveryAction {
        if !self.learn {
            return RecoveryAction::Retry;
        }
        let fingerprint = fingerprint(&failure.error.to_string());
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let retry = table.stats(&fingerprint, RecoveryAction::Retry).rate();
        let skip = table.stats(&fingerprint, RecoveryAction::Skip).rate();
        debug!(step_id = %failure.step.id, %fingerprint, retry, skip, "ranking recovery candidates");
        if skip > retry {
            RecoveryAction::Skip
        } else {
            RecoveryAction::Retry
        }
    }

    /// Record the final outcome of an action taken for `fingerprint`.
    pub fn record(&self, fingerprint: &str, action: RecoveryAction, success: bool) {
        if !self.learn {
            return;
        }
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.record(fingerprint, action, success);
    }

    pub fn table(&self) -> OutcomeTable {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn is_legal(action: RecoveryAction, failure: &FailureContext<'_>) -> bool {
    match action {
        RecoveryAction::Retry => {
            failure.error.is_retryable() && failure.retries_used < failure.step.retry.max_retries
        }
        RecoveryAction::Skip => failure.step.optional,
        RecoveryAction::Abort => true,
    }
}

fn to_decision(action: RecoveryAction, failure: &FailureContext<'_>) -> RecoveryDecision {
    match action {
        RecoveryAction::Retry => RecoveryDecision::Retry {
            delay: failure.step.retry.delay_for(failure.retries_used + 1),
        },
        RecoveryAction::Skip => RecoveryDecision::Skip,
        RecoveryAction::Abort => RecoveryDecision::Abort,
    }
}

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[a-z]:)?(?:[\\/][\w.\-]+)+[\\/]?").unwrap());
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]{8,}\b").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Coarse error signature: volatile parts (quoted text, paths, hex ids, numbers)
/// collapsed so recurring failures share a key.
pub fn fingerprint(message: &str) -> String {
    let lowered = message.to_lowercase();
    let collapsed = QUOTED_RE.replace_all(&lowered, "<str>");
    let collapsed = PATH_RE.replace_all(&collapsed, "<path>");
    let collapsed = HEX_RE.replace_all(&collapsed, "<hex>");
    let collapsed = NUMBER_RE.replace_all(&collapsed, "<n>");
    let collapsed = SPACE_RE.replace_all(collapsed.trim(), " ");
    collapsed.chars().take(FINGERPRINT_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::command;

    fn failure<'a>(step: &'a PlanStep, error: &'a StepError, retries_used: u32) -> FailureContext<'a> {
        FailureContext {
            step,
            error,
            retries_used,
            history: &[],
        }
    }

    #[test]
    fn retries_until_budget_is_spent_then_aborts() {
        let mut step = command("flaky", "false");
        step.retry.max_retries = 2;
        let error = StepError::execution("exit status 1");
        let policy = RecoveryPolicy::default();

        assert_eq!(policy.decide(&failure(&step, &error, 0)).action(), RecoveryAction::Retry);
        assert_eq!(policy.decide(&failure(&step, &error, 1)).action(), RecoveryAction::Retry);
        assert_eq!(policy.decide(&failure(&step, &error, 2)), RecoveryDecision::Abort);
    }

    #[test]
    fn non_retryable_errors_skip_or_abort() {
        let mut step = command("lookup", "true");
        step.retry.max_retries = 3;
        let error = StepError::permanent("HTTP 404");
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.decide(&failure(&step, &error, 0)), RecoveryDecision::Abort);

        step.optional = true;
        assert_eq!(policy.decide(&failure(&step, &error, 0)), RecoveryDecision::Skip);
    }

    #[test]
    fn explicit_abort_wins_over_remaining_retries() {
        let mut step = command("strict", "false");
        step.retry.max_retries = 5;
        step.on_failure = Some(FailureStrategy::Abort);
        let error = StepError::execution("boom");
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.decide(&failure(&step, &error, 0)), RecoveryDecision::Abort);
    }

    #[test]
    fn history_breaks_ties_between_retry_and_skip() {
        let mut step = command("sync", "false");
        step.retry.max_retries = 1;
        step.optional = true;
        let error = StepError::execution("connection refused to 10.0.0.7:443");
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.decide(&failure(&step, &error, 0)).action(), RecoveryAction::Retry);

        let key = fingerprint(&error.to_string());
        for _ in 0..3 {
            policy.record(&key, RecoveryAction::Retry, false);
            policy.record(&key, RecoveryAction::Skip, true);
        }
        assert_eq!(policy.decide(&failure(&step, &error, 0)), RecoveryDecision::Skip);
    }

    struct AlwaysSkip;

    impl ErrorAdvisor for AlwaysSkip {
        fn suggest(&self, _failure: &FailureContext<'_>) -> Option<RecoveryAction> {
            Some(RecoveryAction::Skip)
        }
    }

    #[test]
    fn illegal_advisor_suggestion_is_ignored() {
        let step = command("required", "false");
        let error = StepError::execution("boom");
        let policy = RecoveryPolicy::default().with_advisor(Box::new(AlwaysSkip));
        assert_eq!(policy.decide(&failure(&step, &error, 0)), RecoveryDecision::Abort);
    }

    #[test]
    fn fingerprint_collapses_volatile_parts() {
        let a = fingerprint("Open '/tmp/run-1/a.txt' failed: code 17 at 0xdeadbeef");
        let b = fingerprint("open '/var/x.txt' failed: code 2 at 0x1f");
        assert_eq!(a, b);
        assert_eq!(fingerprint("  Exit   status 1 "), "exit status <n>");
        assert!(fingerprint(&"x".repeat(500)).chars().count() <= FINGERPRINT_MAX_CHARS);
    }
}
