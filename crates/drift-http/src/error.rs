//! Adapter construction errors

/// Errors building an HTTP adapter
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// URL could not be parsed or cannot carry a path
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// HTTP client could not be constructed
    #[error("http client error: {0}")]
    Client(String),
}

impl HttpError {
    /// `InvalidUrl` with a reason
    #[inline]
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
