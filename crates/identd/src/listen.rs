//! Listener specifications of the form `scheme://address`.
//!
//! - `tcp://host:port` - an empty host (`tcp://:113`) binds every interface,
//!   IPv6 and IPv4 alike where the host supports dual-stack sockets
//! - `unix:///path/to/socket` - control listener only

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Where a listener should bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`; `:port` means every interface
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parses a `scheme://address` string.
    ///
    /// # Errors
    ///
    /// - `ListenAddrError::MissingScheme` without `://`
    /// - `ListenAddrError::UnsupportedScheme` for schemes other than tcp/unix
    /// - `ListenAddrError::InvalidTcpAddress` for TCP addresses without a valid port
    /// - `ListenAddrError::EmptyPath` for `unix://` with no path
    pub fn parse(spec: &str) -> Result<Self, ListenAddrError> {
        let (scheme, address) = spec
            .split_once("://")
            .ok_or_else(|| ListenAddrError::MissingScheme(spec.to_string()))?;

        match scheme {
            "tcp" => parse_tcp(address).map(Self::Tcp),
            "unix" => {
                if address.is_empty() {
                    return Err(ListenAddrError::EmptyPath);
                }
                Ok(Self::Unix(PathBuf::from(address)))
            }
            other => Err(ListenAddrError::UnsupportedScheme(other.to_string())),
        }
    }
}

fn parse_tcp(address: &str) -> Result<String, ListenAddrError> {
    let invalid = || ListenAddrError::InvalidTcpAddress(address.to_string());

    let (_host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(address.to_string())
}

impl FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp://{address}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Errors from parsing a listener specification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenAddrError {
    #[error("Invalid listener {0:?}: expected scheme://address")]
    MissingScheme(String),

    #[error("Unsupported listener scheme {0:?} (expected tcp or unix)")]
    UnsupportedScheme(String),

    #[error("Invalid TCP listen address {0:?}: expected host:port")]
    InvalidTcpAddress(String),

    #[error("Unix listener requires a socket path")]
    EmptyPath,
}
