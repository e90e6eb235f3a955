//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is missing the `{prefix}_{ulid}` separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The value is a well-formed ID of a different kind.
    #[error("expected a '{expected}' ID, found a '{actual}' ID")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },

    /// The ID carries a prefix no node-assigned kind uses.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A cloud-assigned ID contains characters outside the allowed set
    /// or exceeds the length limit.
    #[error("invalid {kind} identifier: {message}")]
    InvalidCloudId {
        kind: &'static str,
        message: String,
    },
}

impl IdError {
    /// Returns true if this error indicates a prefix or kind mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(
            self,
            IdError::InvalidPrefix { .. } | IdError::WrongKind { .. }
        )
    }
}
