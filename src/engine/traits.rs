//! QueryEngine trait definition
//!
//! This is the execution collaborator the admission pipeline calls once a
//! query has passed every check. Implementations own connection acquisition
//! and the wire protocol; the pipeline only sees rows or an affected count.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{ExecutionOutcome, OutcomeShape, QueryParam};

/// Core trait every database backend must implement
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Returns the unique identifier for this driver (e.g., "mysql")
    fn driver_id(&self) -> &'static str;

    /// Executes a single statement with positionally bound parameters.
    ///
    /// Parameters must be bound through the driver's prepared-statement
    /// support, never spliced into the query text. `shape` tells the driver
    /// whether the caller expects a row set or an affected-row count.
    async fn execute(
        &self,
        query: &str,
        params: &[QueryParam],
        shape: OutcomeShape,
    ) -> EngineResult<ExecutionOutcome>;
}
