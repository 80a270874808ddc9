//! Value composition
//!
//! Pure functions that turn resolved parts into final configuration values.
//! The composed value is as sensitive as its most sensitive input.

use std::collections::BTreeMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use zeroize::Zeroizing;

use crate::error::ComposeError;
use crate::model::{ConfigValue, Sensitivity};

/// Named inputs available to a template
pub type Parts = BTreeMap<String, ConfigValue>;

/// One template slot: a named part or a literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Looked up in [`Parts`]
    Part(String),
    /// Used as-is, never sensitive
    Literal(String),
}

impl Segment {
    /// Named part
    #[inline]
    pub fn part(name: impl Into<String>) -> Self {
        Self::Part(name.into())
    }

    /// Literal text
    #[inline]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    fn resolve<'a>(&'a self, parts: &'a Parts) -> Result<(&'a str, Sensitivity), ComposeError> {
        match self {
            Self::Literal(value) => Ok((value.as_str(), Sensitivity::Plain)),
            Self::Part(name) => parts
                .get(name)
                .map(|v| (v.expose(), v.sensitivity()))
                .ok_or_else(|| ComposeError::MissingPart(name.clone())),
        }
    }
}

/// `scheme://[user[:password]@]host[:port][/path][?k=v&...]`
///
/// `password` is only emitted together with `user`. User, password, path and
/// query values are percent-encoded; host is inserted verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    /// e.g. `postgresql`
    pub scheme: String,
    /// Userinfo user, percent-encoded
    pub user: Option<Segment>,
    /// Ignored without a user
    pub password: Option<Segment>,
    /// Inserted verbatim
    pub host: Segment,
    /// Omitted when `None`
    pub port: Option<u16>,
    /// Single path segment
    pub path: Option<Segment>,
    /// Ordered query pairs
    pub query: Vec<(String, Segment)>,
}

impl UrlTemplate {
    /// Template with scheme and host only
    #[must_use]
    pub fn new(scheme: impl Into<String>, host: Segment) -> Self {
        Self {
            scheme: scheme.into(),
            user: None,
            password: None,
            host,
            port: None,
            path: None,
            query: Vec::new(),
        }
    }

    /// Set userinfo
    #[must_use]
    pub fn with_credentials(mut self, user: Segment, password: Option<Segment>) -> Self {
        self.user = Some(user);
        self.password = password;
        self
    }

    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the path
    #[must_use]
    pub fn with_path(mut self, path: Segment) -> Self {
        self.path = Some(path);
        self
    }

    /// Append a query pair
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: Segment) -> Self {
        self.query.push((key.into(), value));
        self
    }
}

/// Composition recipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// Connection URL
    Url(UrlTemplate),
    /// Single segment passed through unchanged
    Verbatim(Segment),
}

/// Compose a value from a template
///
/// # Errors
/// Returns `ComposeError::MissingPart` if a referenced part is absent
pub fn compose(template: &Template, parts: &Parts) -> Result<ConfigValue, ComposeError> {
    match template {
        Template::Verbatim(segment) => {
            let (value, sensitivity) = segment.resolve(parts)?;
            Ok(ConfigValue::with_sensitivity(value, sensitivity))
        }
        Template::Url(url) => compose_url(url, parts),
    }
}

fn compose_url(url: &UrlTemplate, parts: &Parts) -> Result<ConfigValue, ComposeError> {
    let mut sensitivity = Sensitivity::Plain;
    let mut out = Zeroizing::new(String::new());

    out.push_str(&url.scheme);
    out.push_str("://");

    if let Some(user) = &url.user {
        let (user, s) = user.resolve(parts)?;
        sensitivity = sensitivity.max(s);
        percent_encode(user, &mut out);
        if let Some(password) = &url.password {
            let (password, s) = password.resolve(parts)?;
            sensitivity = sensitivity.max(s);
            out.push(':');
            percent_encode(password, &mut out);
        }
        out.push('@');
    }

    let (host, s) = url.host.resolve(parts)?;
    sensitivity = sensitivity.max(s);
    out.push_str(host);

    if let Some(port) = url.port {
        out.push(':');
        out.push_str(&port.to_string());
    }

    if let Some(path) = &url.path {
        let (path, s) = path.resolve(parts)?;
        sensitivity = sensitivity.max(s);
        out.push('/');
        percent_encode(path, &mut out);
    }

    for (i, (key, value)) in url.query.iter().enumerate() {
        let (value, s) = value.resolve(parts)?;
        sensitivity = sensitivity.max(s);
        out.push(if i == 0 { '?' } else { '&' });
        percent_encode(key, &mut out);
        out.push('=');
        percent_encode(value, &mut out);
    }

    Ok(ConfigValue::with_sensitivity(out.as_str(), sensitivity))
}

/// RFC 3986 unreserved characters pass through
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn percent_encode(input: &str, out: &mut String) {
    out.extend(utf8_percent_encode(input, COMPONENT));
}
