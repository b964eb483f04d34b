//! Rule Engine Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule not found
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Invalid rule format
    #[error("Invalid rule format: {0}")]
    InvalidFormat(String),

    /// Expression compile/evaluation error
    #[error("Expression error: {0}")]
    ExpressionError(String),

    /// Action execution error
    #[error("Action execution error: {0}")]
    ActionError(String),

    /// Storage error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Engine lifecycle error
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Error reported by a device writer, publisher or rule persister
    #[error("External error: {0}")]
    External(String),
}

impl RuleError {
    pub fn action(msg: impl Into<String>) -> Self {
        Self::ActionError(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }
}

impl From<edge_calc::CalcError> for RuleError {
    fn from(err: edge_calc::CalcError) -> Self {
        RuleError::ExpressionError(err.to_string())
    }
}

impl From<edge_store::StoreError> for RuleError {
    fn from(err: edge_store::StoreError) -> Self {
        RuleError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::SerializationError(err.to_string())
    }
}

impl From<anyhow::Error> for RuleError {
    fn from(err: anyhow::Error) -> Self {
        RuleError::External(err.to_string())
    }
}
