//! Filter compile and evaluation errors

use eddievent::EventError;
use thiserror::Error;

/// Errors from compiling or running a filter
#[derive(Debug, Error)]
pub enum FilterError {
    /// Malformed rule; skipped outside strict mode
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: nesting deeper than {limit}")]
    StackOverflow { line: usize, limit: usize },

    #[error("line {line}: bad regex: {source}")]
    Regex {
        line: usize,
        #[source]
        source: regex::Error,
    },

    #[error("line {line}: unknown label '{label}'")]
    UnknownLabel { line: usize, label: String },

    #[error("line {line}: duplicate label '{label}'")]
    DuplicateLabel { line: usize, label: String },

    #[error("gave up after {0} rule steps")]
    StepLimit(usize),

    #[error("rewrite failed: {0}")]
    Event(#[from] EventError),

    #[error("failed to read filter: {0}")]
    Io(#[from] std::io::Error),
}

impl FilterError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        FilterError::Syntax {
            line,
            message: message.into(),
        }
    }

    /// A per-rule failure that non-strict compilation skips
    pub fn is_soft(&self) -> bool {
        matches!(self, FilterError::Syntax { .. } | FilterError::Regex { .. })
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
