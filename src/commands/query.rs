//! Query Commands
//!
//! The `mysql_query` tool operation: decode the request, run it through the
//! executor and format the reply.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::engine::types::QueryParam;
use crate::interceptor::types::{Identity, ResultEnvelope};
use crate::AppState;

const SUCCESS_MESSAGE: &str = "Query executed successfully";
const FAILURE_MESSAGE: &str = "Query execution failed";

/// Incoming tool call
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub params: Option<Vec<QueryParam>>,
    /// Rate limiting key; anonymous when absent
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Summary attached to successful replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub query_type: &'static str,
}

/// Tool reply: the envelope plus a human message and metadata
#[derive(Debug, Clone, Serialize)]
pub struct QueryToolResponse {
    #[serde(flatten)]
    pub envelope: ResultEnvelope,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl From<ResultEnvelope> for QueryToolResponse {
    fn from(envelope: ResultEnvelope) -> Self {
        if !envelope.success() {
            return Self {
                envelope,
                message: FAILURE_MESSAGE,
                metadata: None,
            };
        }

        let metadata = match (envelope.data(), envelope.rows_affected()) {
            (Some(rows), _) => Some(ResponseMetadata {
                row_count: Some(rows.len()),
                rows_affected: None,
                query_type: "SELECT",
            }),
            (None, Some(count)) => Some(ResponseMetadata {
                row_count: None,
                rows_affected: Some(count),
                query_type: "WRITE",
            }),
            (None, None) => None,
        };

        Self {
            envelope,
            message: SUCCESS_MESSAGE,
            metadata,
        }
    }
}

/// Executes a query on behalf of a tool caller
#[instrument(
    skip(state, request),
    fields(
        client_id = request.client_id.as_deref().unwrap_or(Identity::ANONYMOUS),
        query_len = request.query.len()
    )
)]
pub async fn mysql_query(state: &AppState, request: QueryRequest) -> QueryToolResponse {
    let identity = Identity::from_optional(request.client_id.as_deref());
    let params = request.params.unwrap_or_default();

    state
        .executor
        .execute(&request.query, &params, &identity)
        .await
        .into()
}
