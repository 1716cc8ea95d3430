//! Error types for sonos-state

use thiserror::Error;

/// Result type for sonos-state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state management
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// Error parsing data
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<quick_xml::DeError> for StateError {
    fn from(err: quick_xml::DeError) -> Self {
        StateError::Parse(err.to_string())
    }
}
