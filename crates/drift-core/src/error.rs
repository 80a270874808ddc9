//! Error types for Drift Core
//!
//! One enum per concern:
//! - Model construction (keys, artifact references)
//! - Secret resolution
//! - Value composition
//! - Desired-state building
//! - Remote control-plane calls
//! - Dry runs
//! - Configuration loading
//! - Phase transitions
//!
//! Messages carry key and secret *names* only, never values.

use std::path::PathBuf;
use std::time::Duration;

use crate::secret::SecretName;
use crate::state_machine::Phase;

/// Errors constructing model values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Key is empty or whitespace
    #[error("config key must not be empty")]
    EmptyKey,

    /// Key contains characters the remote cannot store
    #[error("invalid config key '{0}'")]
    InvalidKey(String),

    /// Image reference could not be parsed
    #[error("invalid artifact reference '{0}': expected host/repository[:tag]")]
    InvalidArtifact(String),

    /// Secret name is empty
    #[error("secret name must not be empty")]
    EmptySecretName,
}

/// Secret resolution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    /// No backend knows this secret
    #[error("secret not found: {0}")]
    NotFound(SecretName),

    /// Backend refused the caller
    #[error("not authorized to read secret {name}: {reason}")]
    Unauthorized { name: SecretName, reason: String },

    /// Transient backend failure
    #[error("secret backend unavailable for {name}: {reason}")]
    Unavailable { name: SecretName, reason: String },
}

impl SecretError {
    /// Check if the caller may retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Name of the secret involved
    #[must_use]
    pub fn secret(&self) -> &SecretName {
        match self {
            Self::NotFound(name)
            | Self::Unauthorized { name, .. }
            | Self::Unavailable { name, .. } => name,
        }
    }
}

/// Value composition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    /// Template references a part that was not supplied
    #[error("missing part '{0}'")]
    MissingPart(String),
}

/// Desired-state build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Required parameter absent or empty
    #[error("incomplete parameters: {parameter} is required")]
    IncompleteParameters { parameter: String },

    /// Secret backing a parameter could not be resolved
    #[error("incomplete parameters: secret {secret} for {parameter} could not be resolved: {source}")]
    SecretUnresolved {
        parameter: String,
        secret: SecretName,
        #[source]
        source: SecretError,
    },

    /// Parameter present but malformed
    #[error("invalid parameter {parameter}: {reason}")]
    InvalidParameter { parameter: String, reason: String },

    /// Extra setting collides with a managed key
    #[error("extra setting '{0}' collides with a managed key")]
    ReservedKey(String),

    /// Composition failed
    #[error("composition failed: {0}")]
    Compose(#[from] ComposeError),
}

impl BuildError {
    /// Create incomplete-parameter error
    #[inline]
    pub fn incomplete(parameter: impl Into<String>) -> Self {
        Self::IncompleteParameters {
            parameter: parameter.into(),
        }
    }

    /// Create invalid-parameter error
    #[inline]
    pub fn invalid(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Check if a later run could succeed without operator changes
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SecretUnresolved { source, .. } if source.is_retryable())
    }
}

/// Remote control-plane errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Target does not exist yet
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// Credential rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Target busy or backend overloaded
    #[error("target unavailable: {0}")]
    Unavailable(String),

    /// Request understood but refused
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Call exceeded its deadline
    #[error("call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Network or protocol failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Check if the call may be retried after backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }
}

/// Dry-run errors
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Desired state could not be built
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Observed state could not be read
    #[error("could not read observed state: {0}")]
    Observe(#[from] RemoteError),

    /// Cancelled while backing off
    #[error("plan cancelled")]
    Cancelled,
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exceeds the size limit
    #[error("config file {path} exceeds {limit} bytes")]
    TooLarge { path: PathBuf, limit: usize },

    /// TOML syntax or shape error
    #[error("config parse error: {0}")]
    Parse(String),

    /// Field failed validation
    #[error("invalid config field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    /// Create validation error
    #[inline]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Illegal phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// Phase the run was in
    pub from: Phase,
    /// Rejected successor
    pub to: Phase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_is_retryable() {
        assert!(RemoteError::Unavailable("busy".into()).is_retryable());
        assert!(RemoteError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(RemoteError::Transport("reset".into()).is_retryable());
        assert!(!RemoteError::TargetNotFound("app".into()).is_retryable());
        assert!(!RemoteError::Rejected("bad".into()).is_retryable());
        assert!(!RemoteError::Unauthorized("token".into()).is_retryable());
    }

    #[test]
    fn timeout_display_uses_seconds() {
        let err = RemoteError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "call timed out after 30s");
    }

    #[test]
    fn build_error_retryable_only_for_transient_secrets() {
        let name = SecretName::new("registry/reg.example.com/password").unwrap();
        let transient = BuildError::SecretUnresolved {
            parameter: "registry.password".into(),
            secret: name.clone(),
            source: SecretError::Unavailable {
                name: name.clone(),
                reason: "503".into(),
            },
        };
        assert!(transient.is_retryable());

        let missing = BuildError::SecretUnresolved {
            parameter: "registry.password".into(),
            secret: name.clone(),
            source: SecretError::NotFound(name),
        };
        assert!(!missing.is_retryable());
        assert!(!BuildError::incomplete("registry.host").is_retryable());
    }

    #[test]
    fn build_error_display_names_parameter() {
        let err = BuildError::incomplete("database.name");
        assert_eq!(
            err.to_string(),
            "incomplete parameters: database.name is required"
        );
    }
}
