//! Result shaping
//!
//! Maps an execution outcome plus its category to the caller envelope, and
//! any pipeline failure to a redacted one.

use tracing::warn;

use crate::engine::types::ExecutionOutcome;

use super::error::GuardError;
use super::types::{QueryCategory, ResultEnvelope};

/// Shapes a successful execution.
///
/// Reads and OTHER carry rows; writes carry the affected count. A driver
/// that answers with the wrong shape is treated as a failed execution.
pub fn shape_outcome(category: QueryCategory, outcome: ExecutionOutcome) -> ResultEnvelope {
    match (category.is_write(), outcome) {
        (false, ExecutionOutcome::Rows(rows)) => ResultEnvelope::rows(rows),
        (true, ExecutionOutcome::AffectedCount(count)) => ResultEnvelope::affected(count),
        (_, outcome) => {
            warn!(
                category = category.as_str(),
                shape = ?outcome.shape(),
                "Execution returned an outcome that does not fit the query category"
            );
            shape_error(&GuardError::ExecutionFailure)
        }
    }
}

/// Shapes a failure from any stage. Only the fixed message is exposed.
pub fn shape_error(error: &GuardError) -> ResultEnvelope {
    ResultEnvelope::failure(error.to_string())
}
