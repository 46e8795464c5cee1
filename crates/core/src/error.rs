//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures such as malformed server
/// data. Transport and persistence concerns belong to the desktop crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (empty, non-numeric SID, ...).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A record received from the server could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
