//! Event model errors

use thiserror::Error;

use crate::value::ValueKind;

/// Errors from parsing, serializing and accessing events
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Invalid parameter: {0}")]
    Param(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Invalid format at byte {pos}: {reason}")]
    InvalidFormat { pos: usize, reason: &'static str },

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid type: expected {expected}, found {found}")]
    InvalidType { expected: ValueKind, found: ValueKind },

    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    Full { needed: usize, available: usize },
}

impl EventError {
    /// True for lookup misses, which callers usually treat as control flow
    pub fn is_not_found(&self) -> bool {
        matches!(self, EventError::NotFound(_))
    }
}

/// Convenience result type
pub type Result<T> = std::result::Result<T, EventError>;
