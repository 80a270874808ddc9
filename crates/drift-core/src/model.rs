//! Configuration model
//!
//! Keys, values with sensitivity tracking, image references, and the
//! desired/observed snapshots the reconciler compares.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ModelError;

/// Keys managed by the target builder
pub mod keys {
    /// Composed connection string
    pub const DATABASE_URL: &str = "DATABASE_URL";
    /// CORS origins
    pub const ALLOWED_ORIGINS: &str = "ALLOWED_ORIGINS";
    /// Session signing key, seeded once
    pub const SECRET_KEY: &str = "SECRET_KEY";
    /// Token signing algorithm
    pub const ALGORITHM: &str = "ALGORITHM";
    /// Token lifetime
    pub const ACCESS_TOKEN_EXPIRE_MINUTES: &str = "ACCESS_TOKEN_EXPIRE_MINUTES";
    /// Schema bootstrap flag
    pub const AUTO_CREATE_TABLES: &str = "AUTO_CREATE_TABLES";
    /// Registry URL for image pulls
    pub const DOCKER_REGISTRY_SERVER_URL: &str = "DOCKER_REGISTRY_SERVER_URL";
    /// Registry pull user
    pub const DOCKER_REGISTRY_SERVER_USERNAME: &str = "DOCKER_REGISTRY_SERVER_USERNAME";
    /// Registry pull password
    pub const DOCKER_REGISTRY_SERVER_PASSWORD: &str = "DOCKER_REGISTRY_SERVER_PASSWORD";
    /// Container listen port
    pub const WEBSITES_PORT: &str = "WEBSITES_PORT";
    /// `X-Bot-Key` credential, seeded once
    pub const BOT_API_KEY: &str = "BOT_API_KEY";
    /// Account the bot posts as
    pub const BOT_USER_ID: &str = "BOT_USER_ID";

    /// Every key the builder may emit
    pub const MANAGED: &[&str] = &[
        DATABASE_URL,
        ALLOWED_ORIGINS,
        SECRET_KEY,
        ALGORITHM,
        ACCESS_TOKEN_EXPIRE_MINUTES,
        AUTO_CREATE_TABLES,
        DOCKER_REGISTRY_SERVER_URL,
        DOCKER_REGISTRY_SERVER_USERNAME,
        DOCKER_REGISTRY_SERVER_PASSWORD,
        WEBSITES_PORT,
        BOT_API_KEY,
        BOT_USER_ID,
    ];
}

/// Name of one configuration entry on a target
///
/// Case-sensitive. Ordering is only used for deterministic iteration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigKey(String);

impl ConfigKey {
    /// Create a validated key
    ///
    /// # Errors
    /// Returns error if the key is empty or contains whitespace or `=`
    pub fn new(key: impl Into<String>) -> Result<Self, ModelError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ModelError::EmptyKey);
        }
        if key.chars().any(|c| c.is_whitespace() || c == '=') {
            return Err(ModelError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    /// Key for one of the [`keys`] constants
    #[inline]
    #[must_use]
    pub(crate) fn managed(key: &'static str) -> Self {
        Self(key.to_owned())
    }

    /// Get key as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConfigKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ConfigKey {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConfigKey> for String {
    fn from(key: ConfigKey) -> Self {
        key.0
    }
}

impl Borrow<str> for ConfigKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Whether a value may appear in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// Safe to log
    #[default]
    Plain,
    /// Never logged verbatim
    Sensitive,
}

/// Opaque configuration value
///
/// The backing buffer is zeroed on drop. `Debug` and `Display` redact
/// sensitive values; use [`ConfigValue::expose`] only at the wire boundary.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigValue {
    inner: Zeroizing<String>,
    sensitivity: Sensitivity,
}

impl ConfigValue {
    /// Value that may be logged
    #[inline]
    pub fn plain(value: impl Into<String>) -> Self {
        Self::with_sensitivity(value, Sensitivity::Plain)
    }

    /// Value that must never be logged
    #[inline]
    pub fn sensitive(value: impl Into<String>) -> Self {
        Self::with_sensitivity(value, Sensitivity::Sensitive)
    }

    /// Value with explicit sensitivity
    #[inline]
    pub fn with_sensitivity(value: impl Into<String>, sensitivity: Sensitivity) -> Self {
        Self {
            inner: Zeroizing::new(value.into()),
            sensitivity,
        }
    }

    /// Raw value for the wire
    #[inline]
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.inner
    }

    /// Plain or sensitive
    #[inline]
    #[must_use]
    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    /// Whether the value must be redacted
    #[inline]
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        self.sensitivity == Sensitivity::Sensitive
    }

    /// Same content regardless of sensitivity
    #[inline]
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }

    /// First 8 hex chars of the SHA-256 of the value
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.inner.as_bytes());
        hex::encode(&digest[..4])
    }

    /// Log-safe rendering
    #[must_use]
    pub fn redacted(&self) -> String {
        match self.sensitivity {
            Sensitivity::Plain => self.inner.to_string(),
            Sensitivity::Sensitive => format!("<redacted sha256:{}>", self.fingerprint()),
        }
    }
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sensitivity {
            Sensitivity::Plain => f.debug_tuple("ConfigValue").field(&*self.inner).finish(),
            Sensitivity::Sensitive => f.write_str("ConfigValue(<redacted>)"),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Deployment image: registry host, repository and tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef {
    registry: String,
    repository: String,
    tag: String,
}

impl ArtifactRef {
    /// Default tag when a reference omits one
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Create a validated reference
    ///
    /// # Errors
    /// Returns error if any part is empty or contains separators it must not
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let registry = registry.into();
        let repository = repository.into();
        let tag = tag.into();
        let display = format!("{registry}/{repository}:{tag}");

        let bad = |s: &str| s.is_empty() || s.chars().any(char::is_whitespace);
        if bad(&registry) || registry.contains('/') {
            return Err(ModelError::InvalidArtifact(display));
        }
        if bad(&repository) || repository.contains(':') || repository.starts_with('/') {
            return Err(ModelError::InvalidArtifact(display));
        }
        if bad(&tag) || tag.contains(':') || tag.contains('/') {
            return Err(ModelError::InvalidArtifact(display));
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Registry host
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path
    #[inline]
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Image tag
    #[inline]
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl FromStr for ArtifactRef {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (registry, rest) = s
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidArtifact(s.to_string()))?;

        // A ':' after the last '/' separates the tag
        let last_segment = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[last_segment..].rfind(':') {
            Some(i) => {
                let split = last_segment + i;
                (&rest[..split], &rest[split + 1..])
            }
            None => (rest, Self::DEFAULT_TAG),
        };

        Self::new(registry, repository, tag)
            .map_err(|_| ModelError::InvalidArtifact(s.to_string()))
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactRef> for String {
    fn from(artifact: ArtifactRef) -> Self {
        artifact.to_string()
    }
}

/// How a desired key is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Written whenever the observed value differs
    #[default]
    Overwrite,
    /// Written only when the key is missing (seed-once material)
    IfAbsent,
}

/// One desired setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredEntry {
    /// Value to write
    pub value: ConfigValue,
    /// When to write it
    pub policy: WritePolicy,
}

impl DesiredEntry {
    /// Always written when it differs
    #[inline]
    #[must_use]
    pub fn overwrite(value: ConfigValue) -> Self {
        Self {
            value,
            policy: WritePolicy::Overwrite,
        }
    }

    /// Written only when the key is missing
    #[inline]
    #[must_use]
    pub fn if_absent(value: ConfigValue) -> Self {
        Self {
            value,
            policy: WritePolicy::IfAbsent,
        }
    }
}

/// Full desired configuration for one run
///
/// Built once per invocation and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    settings: BTreeMap<ConfigKey, DesiredEntry>,
    artifact: ArtifactRef,
}

impl DesiredState {
    /// Create from a complete set of entries
    #[must_use]
    pub fn new(artifact: ArtifactRef, settings: BTreeMap<ConfigKey, DesiredEntry>) -> Self {
        Self { settings, artifact }
    }

    /// Desired image
    #[inline]
    #[must_use]
    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    /// Settings by key
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &BTreeMap<ConfigKey, DesiredEntry> {
        &self.settings
    }

    /// Desired entry for a key
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&DesiredEntry> {
        self.settings.get(key)
    }

    /// Number of desired keys
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    /// Whether there are no entries
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

/// Live configuration read from the target just before diffing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedState {
    exists: bool,
    settings: BTreeMap<ConfigKey, ConfigValue>,
    artifact: Option<ArtifactRef>,
}

impl ObservedState {
    /// State of an existing target
    #[must_use]
    pub fn new(settings: BTreeMap<ConfigKey, ConfigValue>, artifact: Option<ArtifactRef>) -> Self {
        Self {
            exists: true,
            settings,
            artifact,
        }
    }

    /// State of a target that does not exist yet
    #[inline]
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }

    /// False when the target has not been created yet
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Settings by key
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &BTreeMap<ConfigKey, ConfigValue> {
        &self.settings
    }

    /// Current image, if any
    #[inline]
    #[must_use]
    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    /// Value for `key`
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.settings.get(key)
    }
}
