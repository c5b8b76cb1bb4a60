//! Identd Protocol - Line protocols spoken by the daemon
//!
//! This crate parses and formats the two text protocols:
//! - `ident` - RFC 1413 queries from remote peers, one per connection
//! - `admin` - the control protocol used by local controllers to
//!   populate and clear the registry
//!
//! Neither module performs I/O; the daemon feeds them one line at a time.

pub mod admin;
pub mod error;
pub mod ident;

pub use admin::{AdminCommand, LookupReply};
pub use error::ProtocolError;
pub use ident::{IdentQuery, IdentReply, DEFAULT_SYSTEM_ID};
