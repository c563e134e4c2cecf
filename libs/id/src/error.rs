//! Error types for slot names and typed IDs.

use thiserror::Error;

/// Errors that can occur when building a namer or parsing an ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The input string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The slot prefix is not usable as a resource name fragment.
    #[error("invalid slot prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: &'static str },

    /// The ID has the wrong type prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    WrongIdPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl NameError {
    /// Returns true if this error came from the slot prefix validation.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, NameError::InvalidPrefix { .. })
    }
}
