//! Control-plane implementation of [`RemoteConfigClient`]

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use drift_core::{
    ArtifactRef, ConfigKey, ConfigValue, Diff, KeyFailures, ObservedState, Readiness,
    RemoteConfigClient, RemoteError,
};
use reqwest::{Method, Response, Url};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::HttpError;
use crate::plane::ControlPlane;
use crate::wire::{ArtifactBody, SettingBody, SettingsResponse};

/// Public health endpoint of the deployed service
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    url: Url,
    interval: Duration,
}

impl LivenessProbe {
    /// Probe `{site_url}{health_path}` every `interval`
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUrl` if the joined URL does not parse
    pub fn new(site_url: &str, health_path: &str, interval: Duration) -> Result<Self, HttpError> {
        let joined = format!("{}{}", site_url.trim_end_matches('/'), health_path);
        let url = Url::parse(&joined).map_err(|e| HttpError::invalid_url(joined.clone(), e.to_string()))?;
        Ok(Self { url, interval })
    }

    /// Probed URL
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Talks to `{base}/targets/{name}/...`
#[derive(Debug, Clone)]
pub struct HttpRemoteConfigClient {
    plane: ControlPlane,
    target: String,
    probe: LivenessProbe,
}

impl HttpRemoteConfigClient {
    /// Client for the target `target`
    #[must_use]
    pub fn new(plane: ControlPlane, target: impl Into<String>, probe: LivenessProbe) -> Self {
        Self {
            plane,
            target: target.into(),
            probe,
        }
    }

    /// Target name
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<Response, RemoteError> {
        let mut path = vec!["targets", self.target.as_str()];
        path.extend_from_slice(segments);
        let mut request = self.plane.request(method, &path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.plane.transport_error(&e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let context = format!("{} {}", self.target, segments.join("/"));
            Err(ControlPlane::status_error(response.status(), &context))
        }
    }

    async fn put_setting(&self, key: &ConfigKey, value: &ConfigValue) -> Result<(), RemoteError> {
        let body = serde_json::to_value(SettingBody {
            value: value.expose(),
        })
        .map_err(|e| RemoteError::Rejected(format!("{key}: {e}")))?;
        self.send(Method::PUT, &["settings", key.as_str()], Some(body))
            .await
            .map(drop)
    }
}

#[async_trait]
impl RemoteConfigClient for HttpRemoteConfigClient {
    async fn get_all(&self) -> Result<ObservedState, RemoteError> {
        let response = match self.send(Method::GET, &["settings"], None).await {
            Err(RemoteError::TargetNotFound(_)) => {
                return Err(RemoteError::TargetNotFound(self.target.clone()));
            }
            other => other?,
        };
        let body: SettingsResponse = response
            .json()
            .await
            .map_err(|e| self.plane.transport_error(&e))?;

        let mut settings = BTreeMap::new();
        for (key, value) in body.settings {
            match ConfigKey::new(key.as_str()) {
                Ok(key) => {
                    settings.insert(key, ConfigValue::sensitive(value));
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring unusable remote key"),
            }
        }
        let artifact = body.artifact.and_then(|image| match image.parse::<ArtifactRef>() {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(%image, error = %e, "ignoring unparseable remote image reference");
                None
            }
        });
        debug!(keys = settings.len(), "observed remote settings");
        Ok(ObservedState::new(settings, artifact))
    }

    async fn set_many(&self, diff: &Diff) -> Result<KeyFailures, RemoteError> {
        let mut failures = KeyFailures::new();
        for (key, change) in diff.iter() {
            match self.put_setting(key, &change.value).await {
                Ok(()) => debug!(key = %key, fingerprint = %change.value.fingerprint(), "setting written"),
                // 401/403 may be scoped to a single key
                Err(e) => {
                    debug!(key = %key, error = %e, "setting write failed");
                    failures.insert(key.clone(), e.to_string());
                }
            }
        }
        Ok(failures)
    }

    async fn set_artifact(&self, artifact: &ArtifactRef) -> Result<(), RemoteError> {
        let body = serde_json::to_value(ArtifactBody {
            image: artifact.to_string(),
        })
        .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        self.send(Method::PUT, &["artifact"], Some(body)).await.map(drop)
    }

    async fn restart(&self) -> Result<(), RemoteError> {
        self.send(Method::POST, &["restart"], None).await.map(drop)
    }

    async fn wait_until_responsive(&self, timeout: Duration) -> Result<Readiness, RemoteError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.plane.probe(self.probe.url.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(Readiness::Ready),
                Ok(response) => debug!(status = %response.status(), "target not ready"),
                Err(e) => debug!(error = %self.plane.transport_error(&e), "target not reachable"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Readiness::TimedOut);
            }
            tokio::time::sleep(self.probe.interval.min(deadline - now)).await;
        }
    }
}
