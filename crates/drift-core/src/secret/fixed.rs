//! In-memory secret backend

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{SecretName, SecretSource};
use crate::error::SecretError;
use crate::model::ConfigValue;

/// Fixed map of secrets, all marked sensitive
///
/// Useful for pinning material in tests and for embedding callers that
/// already hold credentials.
#[derive(Clone, Default)]
pub struct StaticSecretSource {
    values: BTreeMap<SecretName, ConfigValue>,
}

impl StaticSecretSource {
    /// Create an empty instance
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(SecretName(name.into()), value);
        self
    }

    /// Add a secret under a typed name
    pub fn insert(&mut self, name: SecretName, value: impl Into<String>) {
        self.values.insert(name, ConfigValue::sensitive(value));
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no entries
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for StaticSecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretSource")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    fn backend(&self) -> &str {
        "static"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_names_only() {
        let source = StaticSecretSource::new().with("registry/reg.example.com/password", "p@ss");
        let name = SecretName::registry_password("reg.example.com");

        let value = source.resolve(&name).await.unwrap();
        assert_eq!(value.expose(), "p@ss");

        let other = SecretName::registry_password("other.example.com");
        assert!(matches!(
            source.resolve(&other).await,
            Err(SecretError::NotFound(_))
        ));
    }

    #[test]
    fn debug_lists_names_not_values() {
        let source = StaticSecretSource::new().with("a", "hunter2");
        let rendered = format!("{source:?}");
        assert!(rendered.contains('a'));
        assert!(!rendered.contains("hunter2"));
    }
}
