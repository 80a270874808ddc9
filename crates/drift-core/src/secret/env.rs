//! Operator environment as a secret backend

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SecretName, SecretSource};
use crate::error::SecretError;
use crate::model::ConfigValue;

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads secrets from environment variables
///
/// A name maps to an explicitly configured variable, or by default to
/// `DRIFT_SECRET_` followed by the name upper-cased with every
/// non-alphanumeric character replaced by `_`
/// (`database/db.example.com/password` -> `DRIFT_SECRET_DATABASE_DB_EXAMPLE_COM_PASSWORD`).
#[derive(Clone)]
pub struct EnvSecretSource {
    mappings: BTreeMap<SecretName, String>,
    lookup: Lookup,
}

impl EnvSecretSource {
    /// Prefix of derived variable names
    pub const PREFIX: &'static str = "DRIFT_SECRET_";

    /// Source backed by the process environment
    #[must_use]
    pub fn new() -> Self {
        Self::with_lookup(|var| std::env::var(var).ok())
    }

    /// Source backed by a custom lookup
    #[must_use]
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            mappings: BTreeMap::new(),
            lookup: Arc::new(lookup),
        }
    }

    /// Map a secret name to an explicit variable
    #[must_use]
    pub fn with_mapping(mut self, name: SecretName, var: impl Into<String>) -> Self {
        self.mappings.insert(name, var.into());
        self
    }

    /// Map several secret names at once
    #[must_use]
    pub fn with_mappings(mut self, mappings: impl IntoIterator<Item = (SecretName, String)>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    /// Variable consulted for a name
    #[must_use]
    pub fn variable_for(&self, name: &SecretName) -> String {
        if let Some(var) = self.mappings.get(name) {
            return var.clone();
        }
        let suffix: String = name
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{suffix}", Self::PREFIX)
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvSecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvSecretSource")
            .field("mappings", &self.mappings)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    fn backend(&self) -> &str {
        "env"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        let var = self.variable_for(name);
        match (self.lookup)(&var) {
            Some(value) if !value.is_empty() => Ok(ConfigValue::sensitive(value)),
            _ => Err(SecretError::NotFound(name.clone())),
        }
    }
}
