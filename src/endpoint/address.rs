//! Endpoint address grammar
//!
//! ```text
//! name                       local database under the data directory
//! file:///abs/path           local database at an explicit path
//! scheme://host[:port][/db]  database on a peer server
//! host:port[/db]             same, with the default scheme
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::ResolutionError;

/// Scheme assumed when a remote address is written without one
pub const DEFAULT_SCHEME: &str = "lindex";

/// Defaults applied to partially specified remote addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDefaults {
    pub remote_port: u16,
    pub database: String,
}

impl Default for AddressDefaults {
    fn default() -> Self {
        Self {
            remote_port: 33333,
            database: "default".to_string(),
        }
    }
}

/// Database hosted by a peer server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub scheme: String,
    /// Host name or IP, without IPv6 brackets
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl RemoteAddress {
    /// `host:port` form suitable for connecting
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", bracketed(&self.host), self.port)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.scheme,
            bracketed(&self.host),
            self.port,
            self.database
        )
    }
}

/// Parsed endpoint token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddress {
    /// Normalized relative name under the data directory
    Local(String),
    /// Explicit filesystem path
    File(PathBuf),
    Remote(RemoteAddress),
}

impl EndpointAddress {
    /// Parse one endpoint token
    pub fn parse(token: &str, defaults: &AddressDefaults) -> Result<Self, ResolutionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid(token, "empty endpoint"));
        }

        if let Some(path) = token.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid(token, "missing path"));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }

        if token.contains("://") {
            return parse_remote(token, token, defaults);
        }

        // host:port[/db] without a scheme
        if token.contains(':') {
            let with_scheme = format!("{}://{}", DEFAULT_SCHEME, token);
            return parse_remote(&with_scheme, token, defaults);
        }

        normalize_name(token).map(Self::Local)
    }

    /// Filesystem location of a local database, `None` for remote ones
    pub fn local_path(&self, data_dir: &Path) -> Option<PathBuf> {
        match self {
            Self::Local(name) => Some(data_dir.join(name)),
            Self::File(path) => Some(path.clone()),
            Self::Remote(_) => None,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => f.write_str(name),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Remote(remote) => remote.fmt(f),
        }
    }
}

fn parse_remote(
    input: &str,
    original: &str,
    defaults: &AddressDefaults,
) -> Result<EndpointAddress, ResolutionError> {
    let url = Url::parse(input).map_err(|e| invalid(original, e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid(original, "missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(defaults.remote_port);

    let path = url.path().trim_matches('/');
    let database = if path.is_empty() {
        defaults.database.clone()
    } else {
        normalize_name(path).map_err(|_| invalid(original, "invalid database name"))?
    };

    Ok(EndpointAddress::Remote(RemoteAddress {
        scheme: url.scheme().to_string(),
        host,
        port,
        database,
    }))
}

/// Collapse `.` and empty segments; refuse absolute paths and `..`
fn normalize_name(name: &str) -> Result<String, ResolutionError> {
    if name.starts_with('/') {
        return Err(invalid(name, "absolute paths must use file://"));
    }
    let mut segments = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid(name, "'..' is not allowed")),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(invalid(name, "empty database name"));
    }
    Ok(segments.join("/"))
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn invalid(endpoint: &str, reason: impl Into<String>) -> ResolutionError {
    ResolutionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}
