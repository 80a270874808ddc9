use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Reconciliation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Resolving secrets and composing values
    Building,
    /// Reading the target and computing the diff
    Diffing,
    /// Writing settings and the image
    Applying,
    /// Asking the target to restart
    Restarting,
    /// Waiting for liveness
    Verifying,
    /// Target matches the desired state
    Converged,
    /// Some changes landed, some did not
    PartiallyApplied,
    /// Nothing was applied
    Failed,
}

impl Phase {
    /// No transitions leave a terminal phase
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::PartiallyApplied | Self::Failed)
    }
}

/// Validates a phase transition.
///
/// Illegal transitions panic with the `strict-debug` feature; otherwise an
/// error is returned so the run can surface it as a failure.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal phase transition attempted: {from:?} -> {to:?}");

        #[allow(unreachable_code)]
        Err(TransitionError { from, to })
    }
}

/// Legal successors of `from`
#[must_use]
pub fn allowed_transitions(from: Phase) -> &'static [Phase] {
    use Phase::*;
    match from {
        Building => &[Diffing, Failed],
        Diffing => &[Applying, Converged, Failed],
        // Failed only when no write succeeded
        Applying => &[Restarting, PartiallyApplied, Failed],
        Restarting => &[Verifying, PartiallyApplied],
        Verifying => &[Converged, PartiallyApplied],
        Converged | PartiallyApplied | Failed => &[],
    }
}

/// Current phase plus the path taken to reach it
#[derive(Debug, Clone)]
pub(crate) struct PhaseTracker {
    history: Vec<Phase>,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            history: vec![Phase::Building],
        }
    }

    pub(crate) fn current(&self) -> Phase {
        // history always holds at least the initial phase
        self.history.last().copied().unwrap_or(Phase::Building)
    }

    pub(crate) fn advance(&mut self, to: Phase) -> Result<(), TransitionError> {
        validate_transition(self.current(), to)?;
        tracing::debug!(from = ?self.current(), to = ?to, "phase transition");
        self.history.push(to);
        Ok(())
    }

    pub(crate) fn history(&self) -> &[Phase] {
        &self.history
    }
}
