//! Drift Core - configuration reconciliation engine
//!
//! Drives the live configuration of a remote web-app target towards a
//! declarative desired state:
//! - Resolves secrets from pluggable backends
//! - Composes derived values (connection URLs) with sensitivity tracking
//! - Builds the desired key/value set and image reference
//! - Diffs against the observed remote state and applies only the difference
//! - Restarts the target and verifies liveness with bounded retries
//!
//! # Example
//!
//! ```rust,ignore
//! use drift_core::prelude::*;
//!
//! # async fn example(client: std::sync::Arc<dyn RemoteConfigClient>) {
//! let secrets = SecretChain::new()
//!     .with(EnvSecretSource::new())
//!     .with(RandomKeySource::default());
//! let builder = TargetStateBuilder::new(std::sync::Arc::new(secrets));
//! let reconciler = Reconciler::new("stockspace-api", builder, client);
//!
//! let result = reconciler.run(&parameters, CancelSignal::never()).await;
//! println!("{}", result.summary());
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod compose;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod remote;
pub mod result;
pub mod retry;
pub mod secret;
pub mod state_machine;
pub mod target;

// Re-exports for convenience
pub use compose::{compose, Parts, Segment, Template, UrlTemplate};
pub use config::{ControlPlaneConfig, DriftConfig, TargetSection};
pub use diff::{ArtifactChange, Change, ChangeKind, Diff, Plan};
pub use error::{
    BuildError, ComposeError, ConfigError, ModelError, PlanError, RemoteError, SecretError,
    TransitionError,
};
pub use model::{
    keys, ArtifactRef, ConfigKey, ConfigValue, DesiredEntry, DesiredState, ObservedState,
    Sensitivity, WritePolicy,
};
pub use reconciler::{cancellation, CancelHandle, CancelSignal, Reconciler, ReconcilerConfig};
pub use remote::{KeyFailures, Readiness, RemoteConfigClient};
pub use result::{Outcome, ReconciliationResult, RestartStatus, Step, Verification};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use secret::{
    EnvSecretSource, RandomKeySource, SecretChain, SecretName, SecretSource, StaticSecretSource,
};
pub use state_machine::{allowed_transitions, validate_transition, Phase};
pub use target::{
    AppParameters, BotParameters, DatabaseParameters, RegistryParameters, TargetParameters,
    TargetStateBuilder,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring a reconciliation run
    pub use crate::{
        CancelSignal, ConfigKey, ConfigValue, DesiredState, EnvSecretSource, ObservedState,
        Outcome, RandomKeySource, Reconciler, ReconcilerConfig, ReconciliationResult,
        RemoteConfigClient, SecretChain, SecretSource, TargetParameters, TargetStateBuilder,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
