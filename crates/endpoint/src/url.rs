//! Endpoint URL syntax: `ssh://[user@]host[:port]/path` or a bare local path.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A location string could not be understood.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid endpoint url `{url}`: {reason}")]
pub struct UrlError {
    /// The text as given.
    pub url: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

impl UrlError {
    fn new(url: &str, reason: &'static str) -> Self {
        Self {
            url: url.to_string(),
            reason,
        }
    }
}

/// Where an endpoint lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSpec {
    /// The local host.
    Local,
    /// A host reached over SSH.
    Remote {
        /// Login user; `None` lets the SSH client pick its default.
        user: Option<String>,
        /// Host name or address.
        host: String,
        /// TCP port; `None` for the SSH default.
        port: Option<u16>,
    },
}

/// A parsed location: an execution site plus a path on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointUrl {
    spec: EndpointSpec,
    path: PathBuf,
}

impl EndpointUrl {
    /// A local location.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            spec: EndpointSpec::Local,
            path: path.into(),
        }
    }

    /// Where commands against this location execute.
    #[must_use]
    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    /// The path portion of the location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Same location but with a different path on the same endpoint.
    #[must_use]
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            spec: self.spec.clone(),
            path: path.into(),
        }
    }

    /// Parses `ssh://[user@]host[:port]/path`; anything else is local.
    pub fn parse(text: &str) -> Result<Self, UrlError> {
        let Some(rest) = text.strip_prefix("ssh://") else {
            if text.is_empty() {
                return Err(UrlError::new(text, "empty location"));
            }
            return Ok(Self::local(text));
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| UrlError::new(text, "missing path after host"))?;
        let (authority, path) = rest.split_at(slash);
        if authority.is_empty() {
            return Err(UrlError::new(text, "missing host"));
        }

        let (user, host_port) = match authority.split_once('@') {
            Some((user, host_port)) => {
                if user.is_empty() {
                    return Err(UrlError::new(text, "empty user"));
                }
                (Some(user.to_string()), host_port)
            }
            None => (None, authority),
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| UrlError::new(text, "invalid host or port"))?;
        if host.is_empty() {
            return Err(UrlError::new(text, "missing host"));
        }

        Ok(Self {
            spec: EndpointSpec::Remote {
                user,
                host: host.to_string(),
                port,
            },
            path: PathBuf::from(path),
        })
    }
}

/// Splits `host[:port]`, honouring `[v6addr]:port` bracket syntax.
fn split_host_port(text: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = text.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        return match &rest[close + 1..] {
            "" => Some((host, None)),
            tail => {
                let port = tail.strip_prefix(':')?.parse().ok()?;
                Some((host, Some(port)))
            }
        };
    }
    match text.split_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((text, None)),
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.spec {
            EndpointSpec::Local => write!(f, "{}", self.path.display()),
            EndpointSpec::Remote { user, host, port } => {
                f.write_str("ssh://")?;
                if let Some(user) = user {
                    write!(f, "{user}@")?;
                }
                if host.contains(':') {
                    write!(f, "[{host}]")?;
                } else {
                    f.write_str(host)?;
                }
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                write!(f, "{}", self.path.display())
            }
        }
    }
}
