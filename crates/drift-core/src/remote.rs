//! Remote control-plane contract
//!
//! The only seam through which the engine touches a live target. Every call
//! is individually retryable and affects only the keys it names.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::diff::Diff;
use crate::error::RemoteError;
use crate::model::{ArtifactRef, ConfigKey, ObservedState};

/// Keys a batch write did not apply, with a value-free reason
pub type KeyFailures = BTreeMap<ConfigKey, String>;

/// Liveness wait outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Liveness signal answered
    Ready,
    /// Budget elapsed without an answer
    TimedOut,
}

/// Client for one named deployment target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteConfigClient: Send + Sync {
    /// Read the live settings and image reference
    ///
    /// # Errors
    /// `RemoteError::TargetNotFound` if the target does not exist yet
    async fn get_all(&self) -> Result<ObservedState, RemoteError>;

    /// Upsert every key in the diff
    ///
    /// Individual key failures, authorization included, do not abort the
    /// batch; they are returned. An `Err` means the batch as a whole could
    /// not be attempted. The caller bounds the batch by one call timeout per
    /// key.
    async fn set_many(&self, diff: &Diff) -> Result<KeyFailures, RemoteError>;

    /// Point the target at a new image
    async fn set_artifact(&self, artifact: &ArtifactRef) -> Result<(), RemoteError>;

    /// Restart the target
    ///
    /// # Errors
    /// `RemoteError::Unavailable` while the target is mid-deployment
    async fn restart(&self) -> Result<(), RemoteError>;

    /// Poll the target's liveness signal until it answers or `timeout` elapses
    async fn wait_until_responsive(&self, timeout: Duration) -> Result<Readiness, RemoteError>;
}
