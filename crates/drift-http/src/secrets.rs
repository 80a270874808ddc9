//! Secret sources backed by control-plane endpoints

use async_trait::async_trait;
use drift_core::{ConfigValue, RemoteError, SecretError, SecretName, SecretSource};
use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::plane::ControlPlane;
use crate::wire::{DatabaseEndpoint, RegistryCredentials};

/// Serves `registry/<host>/password` and `registry/<host>/username`
///
/// The registry resource is named after the first label of its host.
#[derive(Debug, Clone)]
pub struct HttpRegistryCredentials {
    plane: ControlPlane,
}

impl HttpRegistryCredentials {
    /// Create a new instance
    #[must_use]
    pub fn new(plane: ControlPlane) -> Self {
        Self { plane }
    }
}

#[async_trait]
impl SecretSource for HttpRegistryCredentials {
    fn backend(&self) -> &str {
        "registry-credentials"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        if name.namespace() != SecretName::REGISTRY {
            return Err(SecretError::NotFound(name.clone()));
        }
        let (Some(host), field @ ("password" | "username")) = (name.subject(), name.field()) else {
            return Err(SecretError::NotFound(name.clone()));
        };
        let registry = host.split('.').next().unwrap_or(host);
        let creds: RegistryCredentials =
            fetch(&self.plane, name, &["registries", registry, "credentials"]).await?;
        Ok(if field == "password" {
            ConfigValue::sensitive(creds.password)
        } else {
            ConfigValue::plain(creds.username)
        })
    }
}

/// Serves `database/<instance>/host`
#[derive(Debug, Clone)]
pub struct HttpDatabaseEndpoints {
    plane: ControlPlane,
}

impl HttpDatabaseEndpoints {
    #[must_use]
    pub fn new(plane: ControlPlane) -> Self {
        Self { plane }
    }
}

#[async_trait]
impl SecretSource for HttpDatabaseEndpoints {
    fn backend(&self) -> &str {
        "database-endpoints"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        let (SecretName::DATABASE, Some(instance), "host") =
            (name.namespace(), name.subject(), name.field())
        else {
            return Err(SecretError::NotFound(name.clone()));
        };
        let endpoint: DatabaseEndpoint = fetch(&self.plane, name, &["databases", instance]).await?;
        Ok(ConfigValue::plain(endpoint.fqdn))
    }
}

async fn fetch<T: DeserializeOwned>(
    plane: &ControlPlane,
    name: &SecretName,
    segments: &[&str],
) -> Result<T, SecretError> {
    let response = plane
        .request(Method::GET, segments)
        .send()
        .await
        .map_err(|e| secret_error(name, plane.transport_error(&e)))?;
    if !response.status().is_success() {
        let err = ControlPlane::status_error(response.status(), segments.join("/").as_str());
        return Err(secret_error(name, err));
    }
    response
        .json()
        .await
        .map_err(|e| secret_error(name, plane.transport_error(&e)))
}

fn secret_error(name: &SecretName, err: RemoteError) -> SecretError {
    match err {
        RemoteError::TargetNotFound(_) => SecretError::NotFound(name.clone()),
        RemoteError::Unauthorized(reason) | RemoteError::Rejected(reason) => SecretError::Unauthorized {
            name: name.clone(),
            reason,
        },
        other => SecretError::Unavailable {
            name: name.clone(),
            reason: other.to_string(),
        },
    }
}
