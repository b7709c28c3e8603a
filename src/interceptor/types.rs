//! Interceptor Types
//!
//! Type definitions shared by the admission pipeline stages.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::types::{OutcomeShape, Row};

/// Statement category derived from query text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryCategory {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl QueryCategory {
    pub const ALL: [QueryCategory; 6] = [
        Self::Select,
        Self::Insert,
        Self::Update,
        Self::Delete,
        Self::Ddl,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Other => "OTHER",
        }
    }

    /// Returns true for INSERT, UPDATE and DELETE
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Outcome the driver must produce for this category
    pub fn outcome_shape(&self) -> OutcomeShape {
        if self.is_write() {
            OutcomeShape::AffectedCount
        } else {
            OutcomeShape::Rows
        }
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == upper)
            .ok_or_else(|| format!("Unknown query category: {}", s))
    }
}

/// Deployment-wide write permissions, read-only after startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub allow_insert: bool,
    #[serde(default)]
    pub allow_update: bool,
    #[serde(default)]
    pub allow_delete: bool,
}

impl PermissionSet {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn all_writes() -> Self {
        Self {
            allow_insert: true,
            allow_update: true,
            allow_delete: true,
        }
    }
}

/// Allow/deny rules evaluated by the rule filter.
///
/// Table names are compared lowercase and operation names uppercase; use
/// [`FilterRuleSet::normalized`] before comparing against raw input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRuleSet {
    pub whitelist_patterns: Vec<String>,
    pub blacklist_patterns: Vec<String>,
    pub whitelist_tables: BTreeSet<String>,
    pub blacklist_tables: BTreeSet<String>,
    pub whitelist_operations: BTreeSet<String>,
    pub blacklist_operations: BTreeSet<String>,
}

impl FilterRuleSet {
    pub fn is_empty(&self) -> bool {
        self.whitelist_patterns.is_empty()
            && self.blacklist_patterns.is_empty()
            && self.whitelist_tables.is_empty()
            && self.blacklist_tables.is_empty()
            && self.whitelist_operations.is_empty()
            && self.blacklist_operations.is_empty()
    }

    pub fn normalized(mut self) -> Self {
        self.whitelist_tables = lowercase_set(self.whitelist_tables);
        self.blacklist_tables = lowercase_set(self.blacklist_tables);
        self.whitelist_operations = uppercase_set(self.whitelist_operations);
        self.blacklist_operations = uppercase_set(self.blacklist_operations);
        self
    }

    /// All configured patterns, blacklist first
    pub fn patterns(&self) -> impl Iterator<Item = &String> {
        self.blacklist_patterns
            .iter()
            .chain(self.whitelist_patterns.iter())
    }
}

fn lowercase_set(set: BTreeSet<String>) -> BTreeSet<String> {
    set.into_iter().map(|s| s.trim().to_lowercase()).collect()
}

fn uppercase_set(set: BTreeSet<String>) -> BTreeSet<String> {
    set.into_iter().map(|s| s.trim().to_uppercase()).collect()
}

/// Caller key partitioning limiter state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.trim().is_empty() {
            Self::anonymous()
        } else {
            Self(id)
        }
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn from_optional(id: Option<&str>) -> Self {
        id.map(Self::new).unwrap_or_else(Self::anonymous)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == Self::ANONYMOUS
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Behaviour when a guarding subsystem itself fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Treat the failure as a denial
    #[default]
    Closed,
    /// Let the query through and log the failure
    Open,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            other => Err(format!("Unknown fail mode: {}", other)),
        }
    }
}

/// Caller-facing result of one pipeline run.
///
/// Constructed only through [`ResultEnvelope::rows`],
/// [`ResultEnvelope::affected`] and [`ResultEnvelope::failure`], so a
/// successful envelope never carries an error and a failed one never
/// carries data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    success: bool,
    data: Option<Vec<Row>>,
    rows_affected: Option<u64>,
    error: Option<String>,
}

impl ResultEnvelope {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            success: true,
            data: Some(rows),
            rows_affected: None,
            error: None,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            success: true,
            data: None,
            rows_affected: Some(count),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            rows_affected: None,
            error: Some(message.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&[Row]> {
        self.data.as_deref()
    }

    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_data(self) -> Option<Vec<Row>> {
        self.data
    }
}

/// Kind of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    QueryAllowed,
    QueryBlocked,
    QueryFailed,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryAllowed => "query_allowed",
            Self::QueryBlocked => "query_blocked",
            Self::QueryFailed => "query_failed",
        }
    }
}

/// Maximum characters of query text kept in the preview
const PREVIEW_CHARS: usize = 100;

/// An entry reported to the audit collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub query: String,
    /// Truncated query for display (first 100 chars)
    pub query_preview: String,
    /// Derived statement category
    #[serde(default)]
    pub category: Option<QueryCategory>,
    pub identity: String,
    /// Caller-facing reason for blocks and failures
    #[serde(default)]
    pub reason: Option<String>,
    /// Stable error tag (see `GuardError::kind`)
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<f64>,
    /// Rows returned or affected
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, query: &str, identity: &Identity) -> Self {
        let mut preview: String = query.chars().take(PREVIEW_CHARS).collect();
        if query.chars().nth(PREVIEW_CHARS).is_some() {
            preview.push_str("...");
        }

        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            query: query.to_string(),
            query_preview: preview,
            category: None,
            identity: identity.to_string(),
            reason: None,
            error_kind: None,
            execution_time_ms: None,
            row_count: None,
        }
    }

    pub fn with_category(mut self, category: QueryCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_reason(mut self, error_kind: &str, reason: impl Into<String>) -> Self {
        self.error_kind = Some(error_kind.to_string());
        self.reason = Some(reason.into());
        self
    }

    pub fn with_execution(mut self, execution_time_ms: f64, row_count: Option<u64>) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self.row_count = row_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_round_trip() {
        for category in QueryCategory::ALL {
            assert_eq!(category.as_str().parse::<QueryCategory>(), Ok(category));
        }
        assert_eq!("ddl".parse::<QueryCategory>(), Ok(QueryCategory::Ddl));
        assert!("merge".parse::<QueryCategory>().is_err());
    }

    #[test]
    fn only_writes_expect_affected_count() {
        assert_eq!(QueryCategory::Select.outcome_shape(), OutcomeShape::Rows);
        assert_eq!(QueryCategory::Other.outcome_shape(), OutcomeShape::Rows);
        assert_eq!(QueryCategory::Delete.outcome_shape(), OutcomeShape::AffectedCount);
    }

    #[test]
    fn blank_identity_is_anonymous() {
        assert!(Identity::new("  ").is_anonymous());
        assert!(Identity::from_optional(None).is_anonymous());
        assert_eq!(Identity::from_optional(Some("clientA")).as_str(), "clientA");
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let ok = serde_json::to_value(ResultEnvelope::affected(3)).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"success": true, "data": null, "rowsAffected": 3, "error": null})
        );

        let failed = serde_json::to_value(ResultEnvelope::failure("Query execution failed")).unwrap();
        assert_eq!(failed["success"], false);
        assert!(failed["data"].is_null());
        assert!(failed["rowsAffected"].is_null());
        assert_eq!(failed["error"], "Query execution failed");
    }

    #[test]
    fn rule_set_normalizes_names() {
        let rules = FilterRuleSet {
            whitelist_tables: ["Users ".to_string()].into_iter().collect(),
            blacklist_operations: ["delete".to_string()].into_iter().collect(),
            ..Default::default()
        }
        .normalized();

        assert!(rules.whitelist_tables.contains("users"));
        assert!(rules.blacklist_operations.contains("DELETE"));
    }

    #[test]
    fn rule_set_deserializes_with_defaults() {
        let rules: FilterRuleSet =
            serde_json::from_str(r#"{"blacklist_patterns": [".*DROP.*"]}"#).unwrap();
        assert_eq!(rules.blacklist_patterns, vec![".*DROP.*".to_string()]);
        assert!(rules.whitelist_tables.is_empty());
        assert!(!rules.is_empty());
    }

    #[test]
    fn audit_preview_truncates_long_queries() {
        let query = format!("SELECT {}", "x".repeat(200));
        let event = AuditEvent::new(AuditEventKind::QueryAllowed, &query, &Identity::anonymous());
        assert_eq!(event.query_preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(event.query_preview.ends_with("..."));

        let short = AuditEvent::new(AuditEventKind::QueryAllowed, "SELECT 1", &Identity::anonymous());
        assert_eq!(short.query_preview, "SELECT 1");
    }
}
