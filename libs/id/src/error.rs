//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The identifier exceeds the maximum length.
    #[error("identifier too long: {len} characters (max {max})")]
    TooLong { max: usize, len: usize },

    /// The identifier contains a character outside the allowed set.
    #[error("invalid character {ch:?} in identifier '{value}'")]
    InvalidCharacter { ch: char, value: String },

    /// The identifier has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The identifier is missing its separator.
    #[error("identifier missing '{0}' separator")]
    MissingSeparator(char),

    /// The ULID portion of a generated id is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
