//! Control protocol spoken by local controllers.
//!
//! One command per line, tokens separated by whitespace:
//!
//! ```text
//! id <app-id>
//! add <username> <lport> <rport> [interface]
//! del <lport> <rport> [interface]
//! clear
//! lookup <lport> <rport> [interface]
//! ```
//!
//! There is no error channel. A line that fails validation parses to `None`
//! and the caller moves on to the next line. Only `lookup` produces output.

use std::fmt;

use identd_core::{AppId, IdentityRecord, PortPair, WILDCARD_INTERFACE};

/// A validated control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `id <app-id>`: tag later commands on this connection.
    SetAppId(AppId),

    /// `add <username> <lport> <rport> [interface]`
    Add {
        username: String,
        ports: PortPair,
        interface: String,
    },

    /// `del <lport> <rport> [interface]`
    Delete { ports: PortPair, interface: String },

    /// `clear`: drop every record tagged with the connection's app ID.
    Clear,

    /// `lookup <lport> <rport> [interface]`
    Lookup { ports: PortPair, interface: String },
}

impl AdminCommand {
    /// Parses one control line.
    ///
    /// Returns `None` for unknown verbs and for lines that fail the verb's
    /// validation. A trailing `\r` is tolerated.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_ascii_whitespace();
        let verb = tokens.next()?;
        let args: Vec<&str> = tokens.collect();

        match verb {
            "id" => parse_id(&args),
            "add" => parse_add(&args),
            "del" => parse_del(&args),
            "clear" => Some(Self::Clear),
            "lookup" => parse_lookup(&args),
            _ => None,
        }
    }

    /// Verb as it appears on the wire, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::SetAppId(_) => "id",
            Self::Add { .. } => "add",
            Self::Delete { .. } => "del",
            Self::Clear => "clear",
            Self::Lookup { .. } => "lookup",
        }
    }
}

/// `id <app-id>`; a missing argument makes the command a no-op.
pub fn parse_id(args: &[&str]) -> Option<AdminCommand> {
    let app_id = args.first()?;
    Some(AdminCommand::SetAppId(AppId::from(*app_id)))
}

/// `add <username> <lport> <rport> [interface]`; both ports must be
/// non-zero and the username non-empty.
pub fn parse_add(args: &[&str]) -> Option<AdminCommand> {
    let (username, ports) = match args {
        [username, local, remote, ..] => (*username, parse_ports(local, remote)?),
        _ => return None,
    };

    if ports.local == 0 || ports.remote == 0 || username.is_empty() {
        return None;
    }

    Some(AdminCommand::Add {
        username: username.to_string(),
        ports,
        interface: interface_arg(args.get(3)),
    })
}

/// `del <lport> <rport> [interface]`
pub fn parse_del(args: &[&str]) -> Option<AdminCommand> {
    let (ports, interface) = parse_port_query(args)?;
    Some(AdminCommand::Delete { ports, interface })
}

/// `lookup <lport> <rport> [interface]`
pub fn parse_lookup(args: &[&str]) -> Option<AdminCommand> {
    let (ports, interface) = parse_port_query(args)?;
    Some(AdminCommand::Lookup { ports, interface })
}

fn parse_port_query(args: &[&str]) -> Option<(PortPair, String)> {
    match args {
        [local, remote, ..] => Some((parse_ports(local, remote)?, interface_arg(args.get(2)))),
        _ => None,
    }
}

fn parse_ports(local: &str, remote: &str) -> Option<PortPair> {
    Some(PortPair::new(local.parse().ok()?, remote.parse().ok()?))
}

fn interface_arg(arg: Option<&&str>) -> String {
    arg.map_or_else(|| WILDCARD_INTERFACE.to_string(), |s| (*s).to_string())
}

/// Reply to `lookup`. `Display` renders the exact wire text including `\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupReply {
    Found { ports: PortPair, username: String },
    Missing { ports: PortPair },
}

impl LookupReply {
    /// Builds the reply for a lookup of `ports`.
    pub fn new(ports: PortPair, record: Option<&IdentityRecord>) -> Self {
        match record {
            Some(record) => Self::Found {
                ports: record.ports,
                username: record.username.clone(),
            },
            None => Self::Missing { ports },
        }
    }
}

impl fmt::Display for LookupReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found { ports, username } => {
                write!(f, "{} {} {}\r\n", ports.local, ports.remote, username)
            }
            Self::Missing { ports } => write!(f, "{} {} .\r\n", ports.local, ports.remote),
        }
    }
}
