//! Authenticated control-plane connection

use std::time::Duration;

use drift_core::{ConfigValue, RemoteError};
use reqwest::{Method, RequestBuilder, StatusCode, Url};

use crate::error::HttpError;

/// Base URL, bearer token and a shared `reqwest` client
#[derive(Clone)]
pub struct ControlPlane {
    base: Url,
    token: ConfigValue,
    http: reqwest::Client,
    timeout: Duration,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("base", &self.base.as_str())
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Connect to `base_url` with a bearer token
    ///
    /// # Errors
    /// Returns `HttpError` if the URL is not an http(s) base URL or the
    /// client cannot be built
    pub fn new(base_url: &str, token: ConfigValue, timeout: Duration) -> Result<Self, HttpError> {
        let base = Url::parse(base_url).map_err(|e| HttpError::invalid_url(base_url, e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(HttpError::invalid_url(base_url, "expected an http(s) base url"));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HttpError::Client(e.to_string()))?;
        Ok(Self {
            base,
            token: ConfigValue::sensitive(token.expose()),
            http,
            timeout,
        })
    }

    /// Base URL
    #[inline]
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Per-request timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Base URL with `segments` appended, each percent-encoded
    #[must_use]
    pub fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Authenticated request
    pub(crate) fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.url(segments))
            .bearer_auth(self.token.expose())
    }

    /// Unauthenticated request, for public liveness probes
    pub(crate) fn probe(&self, url: Url) -> RequestBuilder {
        self.http.get(url)
    }

    /// Map a non-success status
    pub(crate) fn status_error(status: StatusCode, context: &str) -> RemoteError {
        let reason = format!("{context}: {status}");
        match status.as_u16() {
            401 | 403 => RemoteError::Unauthorized(reason),
            404 => RemoteError::TargetNotFound(reason),
            409 | 429 | 500..=599 => RemoteError::Unavailable(reason),
            _ => RemoteError::Rejected(reason),
        }
    }

    /// Map a transport failure
    pub(crate) fn transport_error(&self, err: &reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transport(describe(err))
        }
    }
}

/// Value-free description; the URL path is kept, the query is not
fn describe(err: &reqwest::Error) -> String {
    let kind = if err.is_connect() {
        "connection failed"
    } else if err.is_decode() {
        "invalid response body"
    } else if err.is_body() {
        "request body error"
    } else {
        "request failed"
    };
    match err.url() {
        Some(url) => format!("{kind} ({}{})", url.host_str().unwrap_or_default(), url.path()),
        None => kind.to_string(),
    }
}
