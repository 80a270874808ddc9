//! Reconciliation pipeline
//!
//! `Building -> Diffing -> Applying -> Restarting -> Verifying -> terminal`.
//! Every remote call is bounded by a timeout and retried under a
//! [`RetryPolicy`]; cancellation is honoured between phases and while
//! backing off, never mid-call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::diff::{Diff, Plan};
use crate::error::{PlanError, RemoteError};
use crate::model::{ArtifactRef, ConfigKey, DesiredState, ObservedState};
use crate::remote::{Readiness, RemoteConfigClient};
use crate::result::{Outcome, ReconciliationResult, RestartStatus, Step, Verification};
use crate::retry::RetryPolicy;
use crate::state_machine::{Phase, PhaseTracker};
use crate::target::{TargetParameters, TargetStateBuilder};

/// Create a linked cancellation pair
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx: Arc::new(tx) },
        CancelSignal { rx: Some(rx) },
    )
}

/// Requests cancellation of every linked [`CancelSignal`]
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Fire every linked signal; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a running pipeline
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        // No handle left to fire
        std::future::pending::<()>().await;
    }
}

/// Reconciler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Observe, settings and artifact writes
    pub apply_retry: RetryPolicy,
    /// Restart requests refused while the target is mid-deployment
    pub restart_retry: RetryPolicy,
    /// Upper bound for any single remote call
    pub call_timeout_secs: u64,
    /// Liveness budget after restart
    pub verify_timeout_secs: u64,
    /// Re-read the target after it answers and report drift
    pub confirm_drift: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            apply_retry: RetryPolicy::apply_default(),
            restart_retry: RetryPolicy::restart_default(),
            call_timeout_secs: 30,
            verify_timeout_secs: 300,
            confirm_drift: true,
        }
    }
}

impl ReconcilerConfig {
    /// Per-call bound as a `Duration`
    #[inline]
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Liveness budget as a `Duration`
    #[inline]
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Bound for a `set_many` batch: one call timeout per key
    #[must_use]
    pub fn batch_timeout(&self, keys: usize) -> Duration {
        let keys = u32::try_from(keys.max(1)).unwrap_or(u32::MAX);
        self.call_timeout().saturating_mul(keys)
    }
}

/// Why a retried call gave up
#[derive(Debug)]
enum CallError {
    Remote(RemoteError),
    Cancelled,
}

/// Drives one target towards its desired state
pub struct Reconciler {
    target: String,
    builder: TargetStateBuilder,
    client: Arc<dyn RemoteConfigClient>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("target", &self.target)
            .field("builder", &self.builder)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler for `target` with default tuning
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        builder: TargetStateBuilder,
        client: Arc<dyn RemoteConfigClient>,
    ) -> Self {
        Self {
            target: target.into(),
            builder,
            client,
            config: ReconcilerConfig::default(),
        }
    }

    /// Replace the tuning
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Target name
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Active tuning
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Build and diff without touching the target
    ///
    /// # Errors
    /// Fails if the desired state cannot be built or the target cannot be read
    pub async fn plan(
        &self,
        params: &TargetParameters,
        mut cancel: CancelSignal,
    ) -> Result<Plan, PlanError> {
        let desired = self.builder.build(params).await?;
        match self.observe(&mut cancel).await {
            Ok(observed) => Ok(Plan::compute(&desired, &observed)),
            Err(CallError::Remote(e)) => Err(PlanError::Observe(e)),
            Err(CallError::Cancelled) => Err(PlanError::Cancelled),
        }
    }

    /// Run the full pipeline
    ///
    /// Never returns an error: every failure is folded into the result.
    pub async fn run(
        &self,
        params: &TargetParameters,
        mut cancel: CancelSignal,
    ) -> ReconciliationResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = tracing::info_span!("reconcile", %run_id, target = %self.target);

        let run = self.drive(params, &mut cancel).instrument(span).await;
        let result = run.finish(run_id, self.target.clone(), started_at);
        match result.outcome {
            Outcome::Converged => info!(%run_id, "target converged"),
            Outcome::PartiallyApplied => {
                warn!(%run_id, incomplete = ?result.incomplete, failed = result.failed_keys.len(), "target partially applied");
            }
            Outcome::Failed => error!(%run_id, error = ?result.error, "reconciliation failed"),
        }
        result
    }

    async fn drive(&self, params: &TargetParameters, cancel: &mut CancelSignal) -> RunState {
        let mut run = RunState::new();

        info!("building desired state");
        let desired = match self.builder.build(params).await {
            Ok(desired) => desired,
            Err(e) => {
                error!(error = %e, "desired state incomplete");
                run.fail(Step::Build, e.to_string());
                return run;
            }
        };
        if cancel.is_cancelled() {
            run.cancel(&[Step::Observe, Step::Settings, Step::Artifact, Step::Restart, Step::Verify]);
            return run;
        }

        run.advance(Phase::Diffing);
        let observed = match self.observe(cancel).await {
            Ok(observed) => observed,
            Err(CallError::Remote(e)) => {
                error!(error = %e, "could not read observed state");
                run.fail(Step::Observe, e.to_string());
                return run;
            }
            Err(CallError::Cancelled) => {
                run.cancel(&[Step::Observe, Step::Settings, Step::Artifact, Step::Restart, Step::Verify]);
                return run;
            }
        };
        run.artifact = observed.artifact().cloned();

        let plan = Plan::compute(&desired, &observed);
        if plan.is_converged() {
            info!(keys = desired.len(), "already converged");
            run.restart = RestartStatus::NotRequired;
            run.verification = Verification::NotRequired;
            run.advance(Phase::Converged);
            return run;
        }
        for (key, change) in plan.diff.iter() {
            debug!(key = %key, kind = ?change.kind, fingerprint = %change.value.fingerprint(), "pending write");
        }
        info!(
            changes = plan.diff.len(),
            artifact = plan.artifact.is_some(),
            target_exists = plan.target_exists,
            "drift detected"
        );
        if cancel.is_cancelled() {
            run.cancel(&[Step::Settings, Step::Artifact, Step::Restart, Step::Verify]);
            return run;
        }

        run.advance(Phase::Applying);
        if self.apply_settings(&plan.diff, &mut run, cancel).await.is_err() {
            run.cancel(&[Step::Artifact, Step::Restart, Step::Verify]);
            return run;
        }
        if cancel.is_cancelled() {
            run.cancel(&[Step::Artifact, Step::Restart, Step::Verify]);
            return run;
        }
        if let Some(change) = &plan.artifact {
            if self.apply_artifact(&change.to, &mut run, cancel).await.is_err() {
                run.cancel(&[Step::Artifact, Step::Restart, Step::Verify]);
                return run;
            }
        }
        if !run.wrote_anything() {
            error!("no change was applied");
            run.incomplete_step(Step::Restart);
            run.incomplete_step(Step::Verify);
            run.error = Some("no configuration change was applied".into());
            run.advance(Phase::Failed);
            return run;
        }
        if cancel.is_cancelled() {
            run.cancel(&[Step::Restart, Step::Verify]);
            return run;
        }

        run.advance(Phase::Restarting);
        match self.restart(cancel).await {
            Ok(()) => {}
            Err(CallError::Remote(e)) => {
                warn!(error = %e, "restart not accepted, skipping verification");
                run.restart = RestartStatus::Unconfirmed;
                run.verification = Verification::Skipped;
                run.incomplete_step(Step::Restart);
                run.incomplete_step(Step::Verify);
                run.advance(Phase::PartiallyApplied);
                return run;
            }
            Err(CallError::Cancelled) => {
                run.cancel(&[Step::Restart, Step::Verify]);
                return run;
            }
        }
        if cancel.is_cancelled() {
            run.restart = RestartStatus::Unconfirmed;
            run.cancel(&[Step::Verify]);
            return run;
        }

        run.advance(Phase::Verifying);
        if !self.verify(&mut run).await {
            run.advance(Phase::PartiallyApplied);
            return run;
        }
        if self.config.confirm_drift && !cancel.is_cancelled() {
            self.confirm(&desired, &mut run, cancel).await;
        }

        if run.failed.is_empty() && run.incomplete.is_empty() {
            run.advance(Phase::Converged);
        } else {
            run.advance(Phase::PartiallyApplied);
        }
        run
    }

    async fn observe(&self, cancel: &mut CancelSignal) -> Result<ObservedState, CallError> {
        let client = self.client.as_ref();
        let limit = self.config.call_timeout();
        let observed = retrying(&self.config.apply_retry, "get_all", cancel, move || {
            bounded(limit, client.get_all())
        })
        .await;
        match observed {
            Err(CallError::Remote(RemoteError::TargetNotFound(reason))) => {
                info!(%reason, "target does not exist yet, treating as empty");
                Ok(ObservedState::missing())
            }
            other => other,
        }
    }

    /// Push the diff, re-sending only failed keys
    async fn apply_settings(
        &self,
        diff: &Diff,
        run: &mut RunState,
        cancel: &mut CancelSignal,
    ) -> Result<(), CallError> {
        let policy = &self.config.apply_retry;
        let mut pending = diff.clone();
        let mut attempt = 0;

        while !pending.is_empty() {
            attempt += 1;
            let limit = self.config.batch_timeout(pending.len());
            let (mut failures, retryable) =
                match bounded(limit, self.client.set_many(&pending)).await {
                    Ok(failures) => (failures, true),
                    Err(e) => {
                        let reason = e.to_string();
                        let all = pending.keys().map(|k| (k.clone(), reason.clone())).collect();
                        (all, e.is_retryable())
                    }
                };
            failures.retain(|key, _| pending.contains(key.as_str()));

            for key in pending.keys().filter(|k| !failures.contains_key(*k)) {
                debug!(key = %key, attempt, "setting applied");
                run.applied.push(key.clone());
            }
            if failures.is_empty() {
                break;
            }
            pending = pending.subset(failures.keys());

            if !retryable || !policy.should_retry(attempt) {
                for (key, reason) in &failures {
                    warn!(key = %key, reason = %reason, "setting not applied");
                }
                run.failed.extend(failures);
                run.incomplete_step(Step::Settings);
                break;
            }

            let delay = policy.delay(attempt - 1);
            warn!(failed = failures.len(), attempt, delay_ms = delay_ms(delay), "retrying failed settings");
            if !sleep_or_cancel(delay, cancel).await {
                run.failed.extend(failures);
                run.incomplete_step(Step::Settings);
                return Err(CallError::Cancelled);
            }
        }
        Ok(())
    }

    async fn apply_artifact(
        &self,
        artifact: &ArtifactRef,
        run: &mut RunState,
        cancel: &mut CancelSignal,
    ) -> Result<(), CallError> {
        let client = self.client.as_ref();
        let limit = self.config.call_timeout();
        let written = retrying(&self.config.apply_retry, "set_artifact", cancel, move || {
            bounded(limit, client.set_artifact(artifact))
        })
        .await;
        match written {
            Ok(()) => {
                info!(%artifact, "image reference applied");
                run.artifact = Some(artifact.clone());
                run.artifact_written = true;
                Ok(())
            }
            Err(CallError::Remote(e)) => {
                warn!(%artifact, error = %e, "image reference not applied");
                run.incomplete_step(Step::Artifact);
                run.error = Some(format!("image reference not applied: {e}"));
                Ok(())
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
        }
    }

    async fn restart(&self, cancel: &mut CancelSignal) -> Result<(), CallError> {
        let client = self.client.as_ref();
        let limit = self.config.call_timeout();
        info!("restarting target");
        retrying(&self.config.restart_retry, "restart", cancel, move || {
            bounded(limit, client.restart())
        })
        .await
    }

    /// Returns whether the target answered
    async fn verify(&self, run: &mut RunState) -> bool {
        let wait = self.config.verify_timeout();
        let limit = wait + self.config.call_timeout();
        info!(timeout_secs = wait.as_secs(), "waiting for target to respond");

        let (restart, verification) =
            match bounded(limit, self.client.wait_until_responsive(wait)).await {
                Ok(Readiness::Ready) => (RestartStatus::Confirmed, Verification::Ready),
                Ok(Readiness::TimedOut) | Err(RemoteError::Timeout(_)) => {
                    warn!("target did not respond in time");
                    (RestartStatus::Unconfirmed, Verification::TimedOut)
                }
                Err(e) => {
                    warn!(error = %e, "liveness check failed");
                    (RestartStatus::Unconfirmed, Verification::Failed)
                }
            };
        run.restart = restart;
        run.verification = verification;
        if verification == Verification::Ready {
            true
        } else {
            run.incomplete_step(Step::Verify);
            false
        }
    }

    /// Re-read the target and report keys that still differ
    async fn confirm(&self, desired: &DesiredState, run: &mut RunState, cancel: &mut CancelSignal) {
        match self.observe(cancel).await {
            Ok(observed) => {
                let plan = Plan::compute(desired, &observed);
                for key in plan.diff.keys() {
                    warn!(key = %key, "setting drifted after restart");
                    run.failed
                        .entry(key.clone())
                        .or_insert_with(|| "value differs after restart".to_string());
                }
                if let Some(change) = &plan.artifact {
                    warn!(expected = %change.to, "image reference drifted after restart");
                    run.incomplete_step(Step::DriftCheck);
                } else if !plan.diff.is_empty() {
                    run.incomplete_step(Step::DriftCheck);
                }
            }
            Err(CallError::Remote(e)) => {
                warn!(error = %e, "drift check could not read the target");
                run.incomplete_step(Step::DriftCheck);
            }
            Err(CallError::Cancelled) => {
                run.incomplete_step(Step::DriftCheck);
                run.incomplete_step(Step::Cancelled);
            }
        }
    }
}

/// Mutable bookkeeping for one run
struct RunState {
    tracker: PhaseTracker,
    applied: Vec<ConfigKey>,
    failed: BTreeMap<ConfigKey, String>,
    incomplete: Vec<Step>,
    artifact: Option<ArtifactRef>,
    artifact_written: bool,
    restart: RestartStatus,
    verification: Verification,
    error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            tracker: PhaseTracker::new(),
            applied: Vec::new(),
            failed: BTreeMap::new(),
            incomplete: Vec::new(),
            artifact: None,
            artifact_written: false,
            restart: RestartStatus::Skipped,
            verification: Verification::Skipped,
            error: None,
        }
    }

    fn advance(&mut self, to: Phase) {
        if let Err(e) = self.tracker.advance(to) {
            error!(error = %e, "phase transition rejected");
            self.error.get_or_insert_with(|| e.to_string());
        }
    }

    fn wrote_anything(&self) -> bool {
        !self.applied.is_empty() || self.artifact_written
    }

    fn incomplete_step(&mut self, step: Step) {
        if !self.incomplete.contains(&step) {
            self.incomplete.push(step);
        }
    }

    fn fail(&mut self, step: Step, error: String) {
        self.incomplete_step(step);
        self.error = Some(error);
        self.advance(Phase::Failed);
    }

    fn cancel(&mut self, remaining: &[Step]) {
        warn!(phase = ?self.tracker.current(), "run cancelled");
        self.incomplete_step(Step::Cancelled);
        for step in remaining {
            self.incomplete_step(*step);
        }
        if self.wrote_anything() {
            self.advance(Phase::PartiallyApplied);
        } else {
            self.error = Some("cancelled before any change was applied".into());
            self.advance(Phase::Failed);
        }
    }

    fn finish(mut self, run_id: Uuid, target: String, started_at: chrono::DateTime<Utc>) -> ReconciliationResult {
        self.applied.sort();
        self.applied.dedup();
        ReconciliationResult {
            run_id,
            target,
            outcome: Outcome::from_phase(self.tracker.current()),
            phases: self.tracker.history().to_vec(),
            applied_keys: self.applied,
            failed_keys: self.failed,
            incomplete: self.incomplete,
            artifact: self.artifact,
            restart: self.restart,
            verification: self.verification,
            error: self.error,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or the budget runs out
async fn retrying<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    cancel: &mut CancelSignal,
    mut call: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay(attempt - 1);
                warn!(op, attempt, delay_ms = delay_ms(delay), error = %e, "remote call failed, retrying");
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(CallError::Cancelled);
                }
            }
            Err(e) => return Err(CallError::Remote(e)),
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout(limit)))
}

/// Returns false if cancelled before the delay elapsed
async fn sleep_or_cancel(delay: Duration, cancel: &mut CancelSignal) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}

fn delay_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::model::{keys, ConfigValue};
    use crate::remote::{KeyFailures, MockRemoteConfigClient};
    use crate::retry::BackoffStrategy;
    use crate::secret::StaticSecretSource;
    use crate::target::{DatabaseParameters, RegistryParameters};
    use pretty_assertions::assert_eq;

    fn params() -> TargetParameters {
        TargetParameters {
            registry: RegistryParameters {
                host: "reg.example.com".into(),
                repository: "backend".into(),
                ..RegistryParameters::default()
            },
            database: DatabaseParameters {
                host: Some("db.example.com".into()),
                admin_user: "postgres".into(),
                name: "app".into(),
                ..DatabaseParameters::default()
            },
            ..TargetParameters::default()
        }
    }

    fn builder() -> TargetStateBuilder {
        let secrets = StaticSecretSource::new()
            .with("registry/reg.example.com/password", "p@ss")
            .with("database/db.example.com/password", "dbpw")
            .with("generated/session-key", "0123abcd");
        TargetStateBuilder::new(Arc::new(secrets)).with_secret_retry(RetryPolicy::none())
    }

    fn fast() -> ReconcilerConfig {
        ReconcilerConfig {
            apply_retry: RetryPolicy::new(3, BackoffStrategy::Exponential, 2_000),
            restart_retry: RetryPolicy::new(5, BackoffStrategy::Exponential, 2_000),
            call_timeout_secs: 30,
            verify_timeout_secs: 300,
            confirm_drift: false,
        }
    }

    async fn converged_observed() -> ObservedState {
        let desired = builder().build(&params()).await.unwrap();
        let settings = desired
            .settings()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        ObservedState::new(settings, Some(desired.artifact().clone()))
    }

    fn reconciler(mock: MockRemoteConfigClient) -> Reconciler {
        Reconciler::new("stockspace-api", builder(), Arc::new(mock)).with_config(fast())
    }

    #[tokio::test]
    async fn converged_target_is_not_mutated() {
        let observed = converged_observed().await;
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all()
            .times(1)
            .returning(move || Ok(observed.clone()));
        mock.expect_set_many().times(0);
        mock.expect_set_artifact().times(0);
        mock.expect_restart().times(0);
        mock.expect_wait_until_responsive().times(0);

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Converged);
        assert_eq!(result.phases, vec![Phase::Building, Phase::Diffing, Phase::Converged]);
        assert_eq!(result.restart, RestartStatus::NotRequired);
        assert!(result.applied_keys.is_empty());
    }

    #[tokio::test]
    async fn build_failure_never_touches_the_target() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().times(0);
        let mut p = params();
        p.database.name = String::new();

        let result = reconciler(mock).run(&p, CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.is_incomplete(Step::Build));
        assert!(result.error.unwrap().contains("database.name"));
    }

    #[tokio::test]
    async fn unauthorized_read_fails_without_retry() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all()
            .times(1)
            .returning(|| Err(RemoteError::Unauthorized("401".into())));
        mock.expect_set_many().times(0);

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.is_incomplete(Step::Observe));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_read_failures_are_retried() {
        let observed = converged_observed().await;
        let mut calls = 0;
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(RemoteError::Unavailable("503".into()))
            } else {
                Ok(observed.clone())
            }
        });

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_unavailable_downgrades_to_partial() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all()
            .returning(|| Err(RemoteError::TargetNotFound("stockspace-api".into())));
        mock.expect_set_many()
            .times(1)
            .returning(|_| Ok(KeyFailures::new()));
        mock.expect_set_artifact().times(1).returning(|_| Ok(()));
        mock.expect_restart()
            .times(5)
            .returning(|| Err(RemoteError::Unavailable("deployment in progress".into())));
        mock.expect_wait_until_responsive().times(0);

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::PartiallyApplied);
        assert_eq!(result.restart, RestartStatus::Unconfirmed);
        assert_eq!(result.verification, Verification::Skipped);
        assert!(result.is_incomplete(Step::Restart));
        assert!(result.failed_keys.is_empty());
        assert_eq!(
            result.artifact.map(|a| a.to_string()),
            Some("reg.example.com/backend:latest".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_failed_keys_are_resent() {
        let mut batch = 0;
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::new(BTreeMap::new(), None)));
        mock.expect_set_many().times(2).returning(move |diff: &Diff| {
            batch += 1;
            let mut failures = KeyFailures::new();
            if batch == 1 {
                assert!(diff.len() > 1);
                failures.insert(ConfigKey::new(keys::DATABASE_URL).unwrap(), "409".into());
            } else {
                assert_eq!(diff.len(), 1);
                assert!(diff.contains(keys::DATABASE_URL));
            }
            Ok(failures)
        });
        mock.expect_set_artifact().returning(|_| Ok(()));
        mock.expect_restart().returning(|| Ok(()));
        mock.expect_wait_until_responsive()
            .returning(|_| Ok(Readiness::Ready));

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Converged);
        assert!(result.applied_keys.iter().any(|k| k.as_str() == keys::DATABASE_URL));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_caps_at_partial() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::missing()));
        mock.expect_set_many().times(3).returning(|diff: &Diff| {
            Ok(diff
                .keys()
                .filter(|k| k.as_str() == keys::ALLOWED_ORIGINS)
                .map(|k| (k.clone(), "request rejected: 400".to_string()))
                .collect())
        });
        mock.expect_set_artifact().returning(|_| Ok(()));
        mock.expect_restart().returning(|| Ok(()));
        mock.expect_wait_until_responsive()
            .returning(|_| Ok(Readiness::Ready));

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::PartiallyApplied);
        assert_eq!(result.failed_keys.len(), 1);
        assert!(result.failed_keys.contains_key(keys::ALLOWED_ORIGINS));
        assert!(result.applied_keys.iter().any(|k| k.as_str() == keys::DATABASE_URL));
        assert!(result.is_incomplete(Step::Settings));
        assert_eq!(result.restart, RestartStatus::Confirmed);
    }

    #[tokio::test]
    async fn nothing_written_is_failure() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::missing()));
        mock.expect_set_many()
            .times(1)
            .returning(|_| Err(RemoteError::Unauthorized("403".into())));
        mock.expect_set_artifact()
            .times(1)
            .returning(|_| Err(RemoteError::Unauthorized("403".into())));
        mock.expect_restart().times(0);

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.is_incomplete(Step::Settings));
        assert!(result.is_incomplete(Step::Artifact));
        assert_eq!(*result.phases.last().unwrap(), Phase::Failed);
    }

    #[tokio::test]
    async fn verify_timeout_is_partial_with_unconfirmed_restart() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::missing()));
        mock.expect_set_many().returning(|_| Ok(KeyFailures::new()));
        mock.expect_set_artifact().returning(|_| Ok(()));
        mock.expect_restart().times(1).returning(|| Ok(()));
        mock.expect_wait_until_responsive()
            .times(1)
            .returning(|_| Ok(Readiness::TimedOut));

        let result = reconciler(mock).run(&params(), CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::PartiallyApplied);
        assert_eq!(result.restart, RestartStatus::Unconfirmed);
        assert_eq!(result.verification, Verification::TimedOut);
        assert!(result.failed_keys.is_empty());
    }

    #[tokio::test]
    async fn drift_after_restart_is_reported() {
        let mut reads = 0;
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().times(2).returning(move || {
            reads += 1;
            if reads == 1 {
                Ok(ObservedState::missing())
            } else {
                let mut settings = BTreeMap::new();
                settings.insert(
                    ConfigKey::new(keys::ALLOWED_ORIGINS).unwrap(),
                    ConfigValue::plain("https://other.example.com"),
                );
                Ok(ObservedState::new(settings, None))
            }
        });
        mock.expect_set_many().returning(|_| Ok(KeyFailures::new()));
        mock.expect_set_artifact().returning(|_| Ok(()));
        mock.expect_restart().returning(|| Ok(()));
        mock.expect_wait_until_responsive()
            .returning(|_| Ok(Readiness::Ready));

        let config = ReconcilerConfig {
            confirm_drift: true,
            ..fast()
        };
        let result = Reconciler::new("stockspace-api", builder(), Arc::new(mock))
            .with_config(config)
            .run(&params(), CancelSignal::never())
            .await;
        assert_eq!(result.outcome, Outcome::PartiallyApplied);
        assert!(result.is_incomplete(Step::DriftCheck));
        assert!(result.failed_keys.contains_key(keys::ALLOWED_ORIGINS));
        assert_eq!(result.verification, Verification::Ready);
    }

    #[tokio::test]
    async fn cancelled_before_writes_is_failure() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().times(0);
        let (handle, signal) = cancellation();
        handle.cancel();

        let result = reconciler(mock).run(&params(), signal).await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.is_incomplete(Step::Cancelled));
        assert!(result.is_incomplete(Step::Settings));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_restart_backoff_is_partial() {
        let (handle, signal) = cancellation();
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::missing()));
        mock.expect_set_many().returning(|_| Ok(KeyFailures::new()));
        mock.expect_set_artifact().returning(|_| Ok(()));
        mock.expect_restart().times(1).returning(move || {
            handle.cancel();
            Err(RemoteError::Unavailable("busy".into()))
        });

        let result = reconciler(mock).run(&params(), signal).await;
        assert_eq!(result.outcome, Outcome::PartiallyApplied);
        assert!(result.is_incomplete(Step::Cancelled));
        assert!(result.is_incomplete(Step::Restart));
        assert_eq!(result.verification, Verification::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_is_bounded() {
        struct Hung;

        #[async_trait::async_trait]
        impl RemoteConfigClient for Hung {
            async fn get_all(&self) -> Result<ObservedState, RemoteError> {
                std::future::pending().await
            }
            async fn set_many(&self, _: &Diff) -> Result<KeyFailures, RemoteError> {
                std::future::pending().await
            }
            async fn set_artifact(&self, _: &ArtifactRef) -> Result<(), RemoteError> {
                std::future::pending().await
            }
            async fn restart(&self) -> Result<(), RemoteError> {
                std::future::pending().await
            }
            async fn wait_until_responsive(&self, _: Duration) -> Result<Readiness, RemoteError> {
                std::future::pending().await
            }
        }

        let result = Reconciler::new("stockspace-api", builder(), Arc::new(Hung))
            .with_config(fast())
            .run(&params(), CancelSignal::never())
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_per_key_writes_are_not_cut_off() {
        struct Slow {
            written: parking_lot::Mutex<Vec<ConfigKey>>,
        }

        #[async_trait::async_trait]
        impl RemoteConfigClient for Slow {
            async fn get_all(&self) -> Result<ObservedState, RemoteError> {
                Ok(ObservedState::missing())
            }
            async fn set_many(&self, diff: &Diff) -> Result<KeyFailures, RemoteError> {
                for key in diff.keys() {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    self.written.lock().push(key.clone());
                }
                Ok(KeyFailures::new())
            }
            async fn set_artifact(&self, _: &ArtifactRef) -> Result<(), RemoteError> {
                Ok(())
            }
            async fn restart(&self) -> Result<(), RemoteError> {
                Ok(())
            }
            async fn wait_until_responsive(&self, _: Duration) -> Result<Readiness, RemoteError> {
                Ok(Readiness::Ready)
            }
        }

        let client = Arc::new(Slow {
            written: parking_lot::Mutex::new(Vec::new()),
        });
        let result = Reconciler::new("stockspace-api", builder(), client.clone())
            .with_config(fast())
            .run(&params(), CancelSignal::never())
            .await;

        assert_eq!(result.outcome, Outcome::Converged, "{}", result.summary());
        assert!(result.failed_keys.is_empty());
        let mut written = client.written.lock().clone();
        written.sort();
        assert!(written.len() > 1);
        assert_eq!(result.applied_keys, written);
    }

    #[test]
    fn batch_timeout_scales_with_keys() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.batch_timeout(0), Duration::from_secs(30));
        assert_eq!(config.batch_timeout(9), Duration::from_secs(270));
    }

    #[tokio::test]
    async fn plan_does_not_mutate() {
        let mut mock = MockRemoteConfigClient::new();
        mock.expect_get_all().returning(|| Ok(ObservedState::missing()));
        mock.expect_set_many().times(0);
        mock.expect_set_artifact().times(0);

        let plan = reconciler(mock)
            .plan(&params(), CancelSignal::never())
            .await
            .unwrap();
        assert!(!plan.target_exists);
        assert!(plan.diff.contains(keys::DATABASE_URL));
        assert!(plan.artifact.is_some());
    }

    #[test]
    fn config_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.apply_retry.max_attempts, 3);
        assert_eq!(config.restart_retry.max_attempts, 5);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.verify_timeout(), Duration::from_secs(300));
        assert!(config.confirm_drift);
    }

    #[test]
    fn never_signal_is_not_cancelled() {
        assert!(!CancelSignal::never().is_cancelled());
        let (handle, signal) = cancellation();
        let clone = signal.clone();
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(clone.is_cancelled());
    }
}
