//! Runtime error types

use std::time::Duration;

use eddievent::EventError;
use thiserror::Error;

use crate::filter::FilterError;

/// Errors raised by the pool, mailboxes and dispatcher
#[derive(Debug, Error)]
pub enum EddiError {
    #[error("Invalid parameter: {0}")]
    Param(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Full: {0}")]
    Full(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("System error: {0}")]
    System(#[from] std::io::Error),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

impl EddiError {
    /// Bounded queue or pool exhausted; worth retrying later
    pub fn is_full(&self) -> bool {
        matches!(self, EddiError::Full(_))
    }

    /// Lookup miss, a control-flow signal rather than a failure
    pub fn is_not_found(&self) -> bool {
        match self {
            EddiError::NotFound(_) => true,
            EddiError::Event(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EddiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_full() {
        assert!(EddiError::Full("box accept".to_string()).is_full());
        assert!(!EddiError::Param("x".to_string()).is_full());
    }

    #[test]
    fn test_not_found_includes_event_lookups() {
        let err = EddiError::from(EventError::NotFound("attr x".to_string()));
        assert!(err.is_not_found());
        assert!(EddiError::NotFound("box".to_string()).is_not_found());
        assert!(!EddiError::TimedOut(Duration::from_secs(1)).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = EddiError::Full("box 'accept'".to_string());
        assert_eq!(err.to_string(), "Full: box 'accept'");
    }
}
