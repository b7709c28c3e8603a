//! Metrics commands.

use serde::Serialize;

use crate::metrics::QueryMetricsSnapshot;
use crate::AppState;

/// Response wrapper for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub success: bool,
    pub metrics: Option<QueryMetricsSnapshot>,
    pub error: Option<String>,
}

/// Returns the executor's counters.
pub fn get_metrics(state: &AppState) -> MetricsResponse {
    MetricsResponse {
        success: true,
        metrics: Some(state.executor.metrics().snapshot()),
        error: None,
    }
}
