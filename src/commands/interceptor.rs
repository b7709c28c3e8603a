// SPDX-License-Identifier: Apache-2.0

//! Interceptor Commands
//!
//! Operator-facing operations: audit browsing, filter rule management and
//! limiter introspection.

use serde::Serialize;
use tracing::info;

use crate::interceptor::{
    AuditEvent, AuditQuery, AuditStats, FilterRuleSet, Identity, LimiterStatus, RuleList,
};
use crate::AppState;

// ==================== Response Types ====================

#[derive(Debug, Serialize)]
pub struct AuditEntriesResponse {
    pub success: bool,
    pub entries: Vec<AuditEvent>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuditStatsResponse {
    pub success: bool,
    pub stats: Option<AuditStats>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilterRulesResponse {
    pub success: bool,
    pub rules: Option<FilterRuleSet>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LimiterStatusResponse {
    pub success: bool,
    pub status: Option<LimiterStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenericResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl GenericResponse {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub success: bool,
    pub data: Option<String>,
    pub error: Option<String>,
}

// ==================== Audit Commands ====================

/// Lists recent audit events, most recent first
pub fn get_audit_entries(state: &AppState, query: AuditQuery) -> AuditEntriesResponse {
    AuditEntriesResponse {
        success: true,
        entries: state.audit.get_entries(&query),
        error: None,
    }
}

pub fn get_audit_stats(state: &AppState) -> AuditStatsResponse {
    AuditStatsResponse {
        success: true,
        stats: Some(state.audit.get_stats()),
        error: None,
    }
}

pub fn export_audit_log(state: &AppState) -> ExportResponse {
    ExportResponse {
        success: true,
        data: Some(state.audit.export()),
        error: None,
    }
}

pub fn clear_audit_log(state: &AppState) -> GenericResponse {
    state.audit.clear();
    GenericResponse::ok()
}

// ==================== Filter Rule Commands ====================

pub fn get_filter_rules(state: &AppState) -> FilterRulesResponse {
    FilterRulesResponse {
        success: true,
        rules: Some(state.filter.snapshot()),
        error: None,
    }
}

/// Adds one rule; invalid patterns are rejected and leave the rules as they were
pub fn add_filter_rule(state: &AppState, list: RuleList, value: &str) -> GenericResponse {
    if value.trim().is_empty() {
        return GenericResponse::err("Rule value must not be empty");
    }
    match state.filter.add_rule(list, value) {
        Ok(true) => {
            info!(list = ?list, "Filter rule added");
            GenericResponse::ok()
        }
        Ok(false) => GenericResponse::err("Rule already present"),
        Err(e) => GenericResponse::err(e.to_string()),
    }
}

pub fn remove_filter_rule(state: &AppState, list: RuleList, value: &str) -> GenericResponse {
    if state.filter.remove_rule(list, value) {
        info!(list = ?list, "Filter rule removed");
        GenericResponse::ok()
    } else {
        GenericResponse::err("Rule not found")
    }
}

pub fn replace_filter_rules(state: &AppState, rules: FilterRuleSet) -> GenericResponse {
    match state.filter.replace(rules.normalized()) {
        Ok(()) => GenericResponse::ok(),
        Err(e) => GenericResponse::err(e.to_string()),
    }
}

// ==================== Limiter Commands ====================

/// Rate and concurrency state of one client
pub fn get_limiter_status(state: &AppState, client_id: Option<&str>) -> LimiterStatusResponse {
    let Some(limiter) = &state.limiter else {
        return LimiterStatusResponse {
            success: false,
            status: None,
            error: Some("Rate limiting is disabled".to_string()),
        };
    };

    LimiterStatusResponse {
        success: true,
        status: Some(limiter.status(&Identity::from_optional(client_id))),
        error: None,
    }
}
