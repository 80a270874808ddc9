//! Operator configuration file
//!
//! One TOML document describes a target: where its control plane lives, the
//! parameters the desired state is built from, secret variable mappings, and
//! reconciler tuning. Unknown fields are rejected and validation fails closed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{keys, ConfigKey};
use crate::reconciler::ReconcilerConfig;
use crate::retry::RetryPolicy;
use crate::secret::SecretName;
use crate::target::{AppParameters, BotParameters, DatabaseParameters, RegistryParameters, TargetParameters};

/// Maximum accepted config file size
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;

/// Deployment target identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetSection {
    /// Target name on the control plane
    pub name: String,
}

/// Control-plane endpoint and liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Base URL, may instead come from `DRIFT_CONTROL_PLANE_URL`
    pub url: Option<String>,
    /// Environment variable holding the bearer token; the token itself is
    /// never read from the file
    pub token_env: String,
    /// Public URL of the deployed service
    pub site_url: Option<String>,
    /// Liveness path on `site_url`
    pub health_path: String,
    /// Poll interval secs
    pub poll_interval_secs: u64,
    /// Request timeout secs
    pub request_timeout_secs: u64,
}

impl ControlPlaneConfig {
    /// Overrides `url`
    pub const URL_ENV: &'static str = "DRIFT_CONTROL_PLANE_URL";
    /// Default `token_env`
    pub const TOKEN_ENV: &'static str = "DRIFT_CONTROL_PLANE_TOKEN";
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: None,
            token_env: Self::TOKEN_ENV.to_string(),
            site_url: None,
            health_path: "/".to_string(),
            poll_interval_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftConfig {
    /// `[target]`
    pub target: TargetSection,
    /// `[control_plane]`
    pub control_plane: ControlPlaneConfig,
    /// `[registry]`
    pub registry: RegistryParameters,
    /// `[database]`
    pub database: DatabaseParameters,
    /// `[app]`
    pub app: AppParameters,
    /// `[bot]`
    pub bot: BotParameters,
    /// Extra plain settings; may not shadow managed keys
    pub extra: BTreeMap<String, String>,
    /// Secret name -> environment variable
    pub secrets: BTreeMap<String, String>,
    /// `[reconcile]`
    pub reconcile: ReconcilerConfig,
}

impl DriftConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file is unreadable, too large, malformed
    /// or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                limit: MAX_CONFIG_FILE_SIZE,
            });
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Parse("config file must be utf-8".to_string()))?;
        let config = Self::from_toml_str(content)?;
        tracing::debug!(path = %path.display(), target = %config.target.name, "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError`] on syntax or validation failure
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.name.trim().is_empty() {
            return Err(ConfigError::invalid("target.name", "must not be empty"));
        }
        self.validate_control_plane()?;
        self.validate_reconcile()?;

        for key in self.extra.keys() {
            if keys::MANAGED.contains(&key.as_str()) {
                return Err(ConfigError::invalid(
                    format!("extra.{key}"),
                    "collides with a managed key",
                ));
            }
            ConfigKey::new(key.as_str())
                .map_err(|e| ConfigError::invalid(format!("extra.{key}"), e.to_string()))?;
        }
        self.secret_mappings()?;
        Ok(())
    }

    fn validate_control_plane(&self) -> Result<(), ConfigError> {
        let cp = &self.control_plane;
        for (field, url) in [
            ("control_plane.url", &cp.url),
            ("control_plane.site_url", &cp.site_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(ConfigError::invalid(field, "must be an http(s) URL"));
                }
            }
        }
        if !cp.health_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "control_plane.health_path",
                "must start with '/'",
            ));
        }
        if cp.token_env.trim().is_empty() {
            return Err(ConfigError::invalid(
                "control_plane.token_env",
                "must not be empty",
            ));
        }
        if cp.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "control_plane.poll_interval_secs",
                "must be greater than zero",
            ));
        }
        if cp.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "control_plane.request_timeout_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    fn validate_reconcile(&self) -> Result<(), ConfigError> {
        let r = &self.reconcile;
        let policies: [(&str, &RetryPolicy); 2] = [
            ("reconcile.apply_retry", &r.apply_retry),
            ("reconcile.restart_retry", &r.restart_retry),
        ];
        for (field, policy) in policies {
            if policy.max_attempts == 0 {
                return Err(ConfigError::invalid(
                    format!("{field}.max_attempts"),
                    "must be at least 1",
                ));
            }
        }
        if r.call_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "reconcile.call_timeout_secs",
                "must be greater than zero",
            ));
        }
        if r.verify_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "reconcile.verify_timeout_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Builder parameters
    #[must_use]
    pub fn parameters(&self) -> TargetParameters {
        TargetParameters {
            registry: self.registry.clone(),
            database: self.database.clone(),
            app: self.app.clone(),
            bot: self.bot.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Parsed `[secrets]` table
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for malformed secret names or empty
    /// variable names
    pub fn secret_mappings(&self) -> Result<Vec<(SecretName, String)>, ConfigError> {
        self.secrets
            .iter()
            .map(|(name, var)| {
                let secret = SecretName::new(name.as_str())
                    .map_err(|e| ConfigError::invalid(format!("secrets.{name}"), e.to_string()))?;
                if var.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        format!("secrets.{name}"),
                        "variable name must not be empty",
                    ));
                }
                Ok((secret, var.clone()))
            })
            .collect()
    }
}
