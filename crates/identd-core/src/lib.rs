//! Identd Core - Domain types and the ident registry
//!
//! This crate provides the types shared between the wire protocol
//! (`identd-protocol`) and the daemon (`identd`):
//! - `PortPair` - a (local, remote) port pair and its scalar key encoding
//! - `AppId` - tag grouping records by the controller that created them
//! - `IdentityRecord` - one registered ownership claim
//! - `Registry` - the concurrent store consulted by both protocols
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod record;
pub mod registry;

pub use record::{AppId, IdentityRecord, PortPair, KEY_BASE, WILDCARD_INTERFACE};
pub use registry::Registry;
