//! Reconciliation outcome reporting
//!
//! A [`ReconciliationResult`] is the only thing a run hands back. Every
//! non-converged result names the keys and steps that did not complete.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ArtifactRef, ConfigKey};
use crate::state_machine::Phase;

/// Terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Remote matches desired state and the target answers
    Converged,
    /// Some configuration was pushed but convergence is not confirmed
    PartiallyApplied,
    /// Nothing was applied
    Failed,
}

impl Outcome {
    /// Process exit code for command-line callers
    #[inline]
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Converged => 0,
            Self::Failed => 1,
            Self::PartiallyApplied => 2,
        }
    }

    pub(crate) fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Converged => Self::Converged,
            Phase::PartiallyApplied => Self::PartiallyApplied,
            _ => Self::Failed,
        }
    }
}

/// Pipeline step that did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Desired state could not be built
    Build,
    /// Observed state could not be read
    Observe,
    /// At least one setting was not written
    Settings,
    /// Image reference was not written
    Artifact,
    /// Restart was not accepted
    Restart,
    /// Liveness was not confirmed
    Verify,
    /// Post-restart drift check failed or found drift
    DriftCheck,
    /// Run was cancelled before finishing
    Cancelled,
}

/// What happened to the restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStatus {
    /// Nothing changed, no restart issued
    NotRequired,
    /// Restart accepted and the target answered afterwards
    Confirmed,
    /// Restart not accepted, or accepted without the target answering
    Unconfirmed,
    /// Run ended before restarting
    Skipped,
}

/// Liveness verification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// Nothing was written
    NotRequired,
    /// Target answered
    Ready,
    /// No answer within the budget
    TimedOut,
    /// Liveness probe itself errored
    Failed,
    /// Not attempted
    Skipped,
}

/// Output of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Unique per run
    pub run_id: Uuid,
    /// Target name
    pub target: String,
    /// Terminal outcome
    pub outcome: Outcome,
    /// Phases visited, in order
    pub phases: Vec<Phase>,
    /// Keys the remote accepted
    pub applied_keys: Vec<ConfigKey>,
    /// Keys not written (or drifted), with a value-free reason
    pub failed_keys: BTreeMap<ConfigKey, String>,
    /// Steps that did not complete
    pub incomplete: Vec<Step>,
    /// Last observed or applied image reference
    pub artifact: Option<ArtifactRef>,
    /// Whether the restart was confirmed
    pub restart: RestartStatus,
    /// Liveness result
    pub verification: Verification,
    /// Fatal error message for failed runs
    pub error: Option<String>,
    /// UTC
    pub started_at: DateTime<Utc>,
    /// UTC
    pub finished_at: DateTime<Utc>,
}

impl ReconciliationResult {
    /// Outcome is `Converged`
    #[inline]
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.outcome == Outcome::Converged
    }

    /// Whether the given step is reported as incomplete
    #[inline]
    #[must_use]
    pub fn is_incomplete(&self, step: Step) -> bool {
        self.incomplete.contains(&step)
    }

    /// One-paragraph human summary
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {}: {:?} ({} applied",
            self.run_id,
            self.target,
            self.outcome,
            self.applied_keys.len()
        );
        if !self.failed_keys.is_empty() {
            let _ = write!(out, ", {} failed", self.failed_keys.len());
        }
        out.push(')');
        if let Some(artifact) = &self.artifact {
            let _ = write!(out, "; image {artifact}");
        }
        let _ = write!(
            out,
            "; restart {:?}; verification {:?}",
            self.restart, self.verification
        );
        if !self.incomplete.is_empty() {
            let _ = write!(out, "; incomplete: {:?}", self.incomplete);
        }
        for (key, reason) in &self.failed_keys {
            let _ = write!(out, "\n  {key}: {reason}");
        }
        if let Some(error) = &self.error {
            let _ = write!(out, "\n  error: {error}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: Outcome) -> ReconciliationResult {
        let now = Utc::now();
        ReconciliationResult {
            run_id: Uuid::nil(),
            target: "stockspace-api".into(),
            outcome,
            phases: vec![Phase::Building, Phase::Diffing, Phase::Converged],
            applied_keys: Vec::new(),
            failed_keys: BTreeMap::new(),
            incomplete: Vec::new(),
            artifact: None,
            restart: RestartStatus::NotRequired,
            verification: Verification::NotRequired,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Converged.exit_code(), 0);
        assert_eq!(Outcome::Failed.exit_code(), 1);
        assert_eq!(Outcome::PartiallyApplied.exit_code(), 2);
    }

    #[test]
    fn summary_lists_failed_keys() {
        let mut r = result(Outcome::PartiallyApplied);
        r.failed_keys.insert(
            ConfigKey::new("DATABASE_URL").unwrap(),
            "request rejected: 400".into(),
        );
        r.incomplete.push(Step::Settings);
        let summary = r.summary();
        assert!(summary.contains("PartiallyApplied"));
        assert!(summary.contains("DATABASE_URL: request rejected: 400"));
        assert!(summary.contains("Settings"));
    }

    #[test]
    fn serializes_with_snake_case_enums() {
        let json = serde_json::to_value(result(Outcome::Converged)).unwrap();
        assert_eq!(json["outcome"], "converged");
        assert_eq!(json["restart"], "not_required");
        assert_eq!(json["phases"][2], "converged");
    }
}
