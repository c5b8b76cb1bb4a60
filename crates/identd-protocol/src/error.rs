//! Protocol error types.

use thiserror::Error;

/// Errors produced while parsing protocol lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Ident query without exactly two comma-separated fields
    #[error("Malformed ident query: expected '<port>, <port>', got {line:?}")]
    MalformedQuery { line: String },

    /// Port field that is not an integer
    #[error("Port field is not an integer: {value:?}")]
    InvalidPort { value: String },
}
