// SPDX-License-Identifier: Apache-2.0

//! Pipeline error taxonomy
//!
//! `GuardError`'s `Display` output is what a caller sees, so every message is
//! fixed vocabulary. Driver text never reaches it.

use thiserror::Error;

use super::types::QueryCategory;

/// Why the pipeline refused or failed a query
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Multiple statements detected in query")]
    StructuralViolation,

    #[error("{category} operations are not allowed")]
    PermissionDenied { category: QueryCategory },

    #[error("Query blocked by filter: {reason}")]
    FilterDenied { reason: String },

    #[error("Query filter unavailable")]
    FilterUnavailable,

    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Too many concurrent queries")]
    ConcurrencyLimited,

    #[error("Admission control unavailable")]
    LimiterUnavailable,

    #[error("Query timed out")]
    Timeout,

    #[error("Query execution failed")]
    ExecutionFailure,
}

impl GuardError {
    /// Stable snake_case tag, one per taxonomy class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StructuralViolation => "structural_violation",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::FilterDenied { .. } | Self::FilterUnavailable => "filter_denied",
            Self::RateLimited { .. } | Self::ConcurrencyLimited | Self::LimiterUnavailable => {
                "admission_denied"
            }
            Self::Timeout | Self::ExecutionFailure => "execution_failure",
        }
    }

    /// Seconds until a retry may succeed, when known
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// True when the query never reached the database
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Timeout | Self::ExecutionFailure)
    }
}

/// Failure of the rule filter itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Invalid filter pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Failure of the admission limiter itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),

    #[error("Limiter state unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_fixed_vocabulary() {
        assert_eq!(
            GuardError::StructuralViolation.to_string(),
            "Multiple statements detected in query"
        );
        assert_eq!(
            GuardError::PermissionDenied { category: QueryCategory::Ddl }.to_string(),
            "DDL operations are not allowed"
        );
        assert_eq!(
            GuardError::PermissionDenied { category: QueryCategory::Insert }.to_string(),
            "INSERT operations are not allowed"
        );
        assert_eq!(
            GuardError::RateLimited { retry_after_secs: 12 }.to_string(),
            "Rate limit exceeded, retry after 12 seconds"
        );
    }

    #[test]
    fn kinds_collapse_to_five_classes() {
        let kinds: std::collections::BTreeSet<_> = [
            GuardError::StructuralViolation,
            GuardError::PermissionDenied { category: QueryCategory::Delete },
            GuardError::FilterDenied { reason: "x".into() },
            GuardError::FilterUnavailable,
            GuardError::RateLimited { retry_after_secs: 1 },
            GuardError::ConcurrencyLimited,
            GuardError::LimiterUnavailable,
            GuardError::Timeout,
            GuardError::ExecutionFailure,
        ]
        .iter()
        .map(GuardError::kind)
        .collect();

        assert_eq!(kinds.len(), 5);
    }

    #[test]
    fn only_rate_limits_carry_retry_after() {
        assert_eq!(GuardError::RateLimited { retry_after_secs: 3 }.retry_after(), Some(3));
        assert_eq!(GuardError::ConcurrencyLimited.retry_after(), None);
        assert!(GuardError::ConcurrencyLimited.is_rejection());
        assert!(!GuardError::Timeout.is_rejection());
    }
}
