// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the execution collaborator
//!
//! Driver-specific errors are mapped to these variants so the pipeline can
//! classify a failure without ever forwarding the driver's text to a caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for query execution
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported parameter at position {index}: {message}")]
    InvalidParameter { index: usize, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn invalid_parameter(index: usize, msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            index,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Short stable tag for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::SyntaxError { .. } => "syntax_error",
            Self::ExecutionError { .. } => "execution_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_across_messages() {
        assert_eq!(EngineError::execution_error("a").kind(), "execution_error");
        assert_eq!(EngineError::execution_error("b").kind(), "execution_error");
        assert_eq!(EngineError::Timeout { timeout_ms: 5 }.kind(), "timeout");
    }
}
