//! RFC 1413 query parsing and reply formatting.
//!
//! A peer sends one line naming the two ports of a TCP connection it has
//! with this host, its own port first:
//!
//! ```text
//! <remote-port>, <local-port>
//! ```
//!
//! The reply names the ports local-first and carries no line terminator:
//!
//! ```text
//! <local-port>, <remote-port> : USERID : <system-id> : <username>
//! <local-port>, <remote-port> : ERROR : NO-USER
//! ```

use std::fmt;

use identd_core::{IdentityRecord, PortPair};

use crate::error::ProtocolError;

/// Operating-system field reported in `USERID` replies unless configured.
pub const DEFAULT_SYSTEM_ID: &str = "KiwiIRC";

/// A parsed ident query.
///
/// Ports are kept as the integers the peer sent. Values outside the port
/// range still get a reply; they simply never match a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentQuery {
    /// Port on the querying peer's side (first on the wire).
    pub remote_port: i64,
    /// Port on this host's side (second on the wire).
    pub local_port: i64,
}

impl IdentQuery {
    /// Parses a query line. Surrounding whitespace on each field is ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedQuery` unless there are exactly two
    ///   comma-separated fields
    /// - `ProtocolError::InvalidPort` if a field is not an integer
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut fields = line.split(',');
        let (Some(first), Some(second), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(ProtocolError::MalformedQuery {
                line: line.to_string(),
            });
        };

        Ok(Self {
            remote_port: parse_port(first)?,
            local_port: parse_port(second)?,
        })
    }

    /// The queried pair in registry order (local, remote), or `None` when
    /// either value is outside 1..=65535.
    pub fn ports(&self) -> Option<PortPair> {
        Some(PortPair::new(
            port_in_range(self.local_port)?,
            port_in_range(self.remote_port)?,
        ))
    }

    /// Builds the reply for this query from a lookup result.
    pub fn reply(&self, record: Option<&IdentityRecord>, system_id: &str) -> IdentReply {
        match record {
            Some(record) => IdentReply::UserId {
                local_port: self.local_port,
                remote_port: self.remote_port,
                system_id: system_id.to_string(),
                username: record.username.clone(),
            },
            None => IdentReply::NoUser {
                local_port: self.local_port,
                remote_port: self.remote_port,
            },
        }
    }
}

fn parse_port(field: &str) -> Result<i64, ProtocolError> {
    let field = field.trim();
    field.parse().map_err(|_| ProtocolError::InvalidPort {
        value: field.to_string(),
    })
}

fn port_in_range(value: i64) -> Option<u16> {
    u16::try_from(value).ok().filter(|port| *port != 0)
}

/// Reply to an ident query. `Display` renders the exact wire text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentReply {
    /// No record for the queried pair.
    NoUser { local_port: i64, remote_port: i64 },

    /// A record was found.
    UserId {
        local_port: i64,
        remote_port: i64,
        system_id: String,
        username: String,
    },
}

impl fmt::Display for IdentReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUser {
                local_port,
                remote_port,
            } => write!(f, "{local_port}, {remote_port} : ERROR : NO-USER"),
            Self::UserId {
                local_port,
                remote_port,
                system_id,
                username,
            } => write!(
                f,
                "{local_port}, {remote_port} : USERID : {system_id} : {username}"
            ),
        }
    }
}
