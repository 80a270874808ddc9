//! Secret resolution
//!
//! A [`SecretSource`] produces a named secret. Several backends can be
//! registered in a [`SecretChain`]; callers never learn which backend served
//! a name. Names are namespaced by their first path segment:
//!
//! | Name                             | Typical backend              |
//! |----------------------------------|------------------------------|
//! | `registry/<host>/password`       | registry credential endpoint |
//! | `registry/<host>/username`       | registry credential endpoint |
//! | `database/<server>/host`         | managed-database endpoint    |
//! | `database/<server>/password`     | operator environment         |
//! | `generated/<label>`              | local random generator       |

mod env;
mod fixed;
mod random;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, SecretError};
use crate::model::ConfigValue;

pub use env::EnvSecretSource;
pub use fixed::StaticSecretSource;
pub use random::RandomKeySource;

/// Namespaced secret identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretName(String);

impl SecretName {
    /// Namespace for registry credentials
    pub const REGISTRY: &'static str = "registry";
    /// Namespace for database material
    pub const DATABASE: &'static str = "database";
    /// Namespace for locally generated keys
    pub const GENERATED: &'static str = "generated";

    /// Create a validated name
    ///
    /// # Errors
    /// Returns error if the name is empty
    pub fn new(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ModelError::EmptySecretName);
        }
        Ok(Self(name))
    }

    /// `registry/<host>/password`
    #[must_use]
    pub fn registry_password(host: &str) -> Self {
        Self(format!("{}/{host}/password", Self::REGISTRY))
    }

    /// `registry/<host>/username`
    #[must_use]
    pub fn registry_username(host: &str) -> Self {
        Self(format!("{}/{host}/username", Self::REGISTRY))
    }

    /// `database/<server>/host`
    #[must_use]
    pub fn database_host(server: &str) -> Self {
        Self(format!("{}/{server}/host", Self::DATABASE))
    }

    /// `database/<server>/password`
    #[must_use]
    pub fn database_password(server: &str) -> Self {
        Self(format!("{}/{server}/password", Self::DATABASE))
    }

    /// `generated/<label>`
    #[must_use]
    pub fn generated(label: &str) -> Self {
        Self(format!("{}/{label}", Self::GENERATED))
    }

    /// Borrow as `&str`
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First path segment
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// Middle segment of a three-part name (`registry/<host>/password` -> host)
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        let mut parts = self.0.splitn(3, '/');
        parts.next()?;
        let subject = parts.next()?;
        parts.next()?;
        Some(subject)
    }

    /// Last path segment
    #[must_use]
    pub fn field(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SecretName {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SecretName> for String {
    fn from(name: SecretName) -> Self {
        name.0
    }
}

/// Capability to produce a named secret
///
/// Implementations must never log the values they return.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Short backend label used in logs
    fn backend(&self) -> &str;

    /// Resolve a secret by name
    ///
    /// # Errors
    /// - `SecretError::NotFound` if this backend does not hold the name
    /// - `SecretError::Unauthorized` if the caller lacks permission
    /// - `SecretError::Unavailable` for transient backend failures
    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError>;
}

/// Ordered set of backends tried until one knows the name
///
/// A backend answering `NotFound` passes the name on; any other error stops
/// the chain.
#[derive(Clone, Default)]
pub struct SecretChain {
    sources: Vec<Arc<dyn SecretSource>>,
}

impl SecretChain {
    /// Empty chain
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend
    #[must_use]
    pub fn with(mut self, source: impl SecretSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Append a shared backend
    pub fn push(&mut self, source: Arc<dyn SecretSource>) {
        self.sources.push(source);
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether there are no entries
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for SecretChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.backend()))
            .finish()
    }
}

#[async_trait]
impl SecretSource for SecretChain {
    fn backend(&self) -> &str {
        "chain"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        for source in &self.sources {
            match source.resolve(name).await {
                Ok(value) => {
                    tracing::debug!(secret = %name, backend = source.backend(), "secret resolved");
                    return Ok(value);
                }
                Err(SecretError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(secret = %name, backend = source.backend(), error = %e, "secret backend failed");
                    return Err(e);
                }
            }
        }
        Err(SecretError::NotFound(name.clone()))
    }
}
