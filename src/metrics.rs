//! Lightweight in-memory query metrics.
//!
//! Each executor owns one [`QueryMetrics`]; counters are relaxed atomics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::interceptor::error::GuardError;

#[derive(Debug, Default)]
pub struct QueryMetrics {
    executed: AtomicU64,
    structural_violation: AtomicU64,
    permission_denied: AtomicU64,
    filter_denied: AtomicU64,
    admission_denied: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a query that reached the database, successful or not.
    pub fn record_execution(&self, duration_ms: f64, success: bool) {
        let duration_ms = duration_ms.max(0.0) as u64;
        self.executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.duration_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a refusal that happened before execution.
    pub fn record_rejection(&self, error: &GuardError) {
        let counter = match error {
            GuardError::StructuralViolation => &self.structural_violation,
            GuardError::PermissionDenied { .. } => &self.permission_denied,
            GuardError::FilterDenied { .. } | GuardError::FilterUnavailable => &self.filter_denied,
            GuardError::RateLimited { .. }
            | GuardError::ConcurrencyLimited
            | GuardError::LimiterUnavailable => &self.admission_denied,
            GuardError::Timeout | GuardError::ExecutionFailure => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        let executed = self.executed.load(Ordering::Relaxed);
        let duration_total = self.duration_total_ms.load(Ordering::Relaxed);
        let max_ms = self.duration_max_ms.load(Ordering::Relaxed);

        let blocked: BTreeMap<&'static str, u64> = [
            ("structural_violation", &self.structural_violation),
            ("permission_denied", &self.permission_denied),
            ("filter_denied", &self.filter_denied),
            ("admission_denied", &self.admission_denied),
        ]
        .into_iter()
        .map(|(kind, counter)| (kind, counter.load(Ordering::Relaxed)))
        .collect();

        let avg_ms = if executed > 0 {
            Some(duration_total as f64 / executed as f64)
        } else {
            None
        };

        QueryMetricsSnapshot {
            executed,
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            blocked_total: blocked.values().sum(),
            blocked,
            avg_ms,
            max_ms: if max_ms > 0 { Some(max_ms) } else { None },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetricsSnapshot {
    pub executed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub blocked_total: u64,
    pub blocked: BTreeMap<&'static str, u64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}
