// SPDX-License-Identifier: Apache-2.0

//! Query Executor
//!
//! Runs one query through every admission stage in a fixed order and hands
//! it to the execution collaborator only when all of them agree:
//!
//! 1. structure (single statement)
//! 2. permission gate on the derived category
//! 3. rule filter
//! 4. rate windows, then a concurrency slot
//! 5. execution under the configured timeout
//!
//! The first refusal wins. Whatever happens, the caller gets a
//! [`ResultEnvelope`] and the audit sink gets one event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn, Span};

use crate::engine::traits::QueryEngine;
use crate::engine::types::{ExecutionOutcome, QueryParam};
use crate::metrics::QueryMetrics;

use super::audit::{AuditSink, TracingAuditSink};
use super::classifier;
use super::error::GuardError;
use super::filter::{FilterDecision, QueryFilter};
use super::limiter::{AdmissionControl, AdmissionDecision, SlotGuard};
use super::permissions;
use super::shaper::{shape_error, shape_outcome};
use super::types::{
    AuditEvent, AuditEventKind, FailMode, Identity, PermissionSet, QueryCategory, ResultEnvelope,
};

/// Static executor settings, fixed at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub permissions: PermissionSet,
    /// `None` lets a query run until the driver returns
    pub query_timeout: Option<Duration>,
    pub filter_fail_mode: FailMode,
    pub limiter_fail_mode: FailMode,
}

/// A refusal raised before execution
struct Rejection {
    category: QueryCategory,
    error: GuardError,
}

impl Rejection {
    fn new(category: QueryCategory, error: GuardError) -> Self {
        Self { category, error }
    }
}

/// Admission pipeline in front of a [`QueryEngine`]
pub struct Executor {
    engine: Arc<dyn QueryEngine>,
    config: ExecutorConfig,
    filter: Option<Arc<dyn QueryFilter>>,
    limiter: Option<Arc<dyn AdmissionControl>>,
    audit: Arc<dyn AuditSink>,
    metrics: QueryMetrics,
}

impl Executor {
    /// Builds an executor with no filter, no limiter and tracing-only audit.
    pub fn new(engine: Arc<dyn QueryEngine>, config: ExecutorConfig) -> Self {
        Self {
            engine,
            config,
            filter: None,
            limiter: None,
            audit: Arc::new(TracingAuditSink),
            metrics: QueryMetrics::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn QueryFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn AdmissionControl>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// Runs `query` for `identity` and shapes the outcome.
    ///
    /// Never fails: refusals and execution errors come back as a failed
    /// envelope carrying only a fixed message. Dropping the returned future
    /// releases any concurrency slot it holds.
    #[instrument(
        skip(self, query, params),
        fields(
            identity = %identity,
            query_len = query.len(),
            param_count = params.len(),
            category = tracing::field::Empty,
        )
    )]
    pub async fn execute(
        &self,
        query: &str,
        params: &[QueryParam],
        identity: &Identity,
    ) -> ResultEnvelope {
        let (category, slot) = match self.admit(query, identity) {
            Ok(admitted) => admitted,
            Err(rejection) => return self.reject(query, identity, rejection),
        };
        Span::current().record("category", category.as_str());

        let started = Instant::now();
        let result = self.run(query, params, category).await;
        drop(slot);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(outcome) => {
                let row_count = outcome.row_count();
                let envelope = shape_outcome(category, outcome);
                if envelope.success() {
                    self.metrics.record_execution(elapsed_ms, true);
                    debug!(rows = row_count, elapsed_ms, "Query executed");
                    self.emit(
                        AuditEvent::new(AuditEventKind::QueryAllowed, query, identity)
                            .with_category(category)
                            .with_execution(elapsed_ms, Some(row_count)),
                    );
                } else {
                    self.fail(query, identity, category, elapsed_ms, &GuardError::ExecutionFailure);
                }
                envelope
            }
            Err(error) => {
                self.fail(query, identity, category, elapsed_ms, &error);
                shape_error(&error)
            }
        }
    }

    /// Every pre-execution stage. On success the caller owns the slot.
    fn admit(
        &self,
        query: &str,
        identity: &Identity,
    ) -> Result<(QueryCategory, Option<SlotGuard>), Rejection> {
        let category = classifier::classify(query);

        if classifier::has_multiple_statements(query) {
            return Err(Rejection::new(category, GuardError::StructuralViolation));
        }

        permissions::validate(category, &self.config.permissions)
            .map_err(|e| Rejection::new(category, e))?;

        self.check_filter(query).map_err(|e| Rejection::new(category, e))?;

        let slot = self
            .check_admission(identity)
            .map_err(|e| Rejection::new(category, e))?;

        Ok((category, slot))
    }

    fn check_filter(&self, query: &str) -> Result<(), GuardError> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };

        match filter.evaluate(query) {
            Ok(FilterDecision::Allow) => Ok(()),
            Ok(FilterDecision::Deny { reason }) => Err(GuardError::FilterDenied { reason }),
            Err(e) => match self.config.filter_fail_mode {
                FailMode::Closed => {
                    error!(error = %e, "Rule filter failed, denying query");
                    Err(GuardError::FilterUnavailable)
                }
                FailMode::Open => {
                    warn!(error = %e, "Rule filter failed, admitting query (fail-open)");
                    Ok(())
                }
            },
        }
    }

    /// Rate check first, then a slot. Denied rate checks take no slot.
    fn check_admission(&self, identity: &Identity) -> Result<Option<SlotGuard>, GuardError> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };

        match limiter.check_and_record(identity) {
            Ok(AdmissionDecision::Allowed) => {}
            Ok(AdmissionDecision::Denied { retry_after_secs }) => {
                return Err(GuardError::RateLimited { retry_after_secs });
            }
            Err(e) => return self.limiter_failure(&e).map(|()| None),
        }

        match SlotGuard::acquire(Arc::clone(limiter), identity) {
            Ok(Some(slot)) => Ok(Some(slot)),
            Ok(None) => Err(GuardError::ConcurrencyLimited),
            Err(e) => self.limiter_failure(&e).map(|()| None),
        }
    }

    fn limiter_failure(&self, e: &dyn std::error::Error) -> Result<(), GuardError> {
        match self.config.limiter_fail_mode {
            FailMode::Closed => {
                error!(error = %e, "Admission limiter failed, denying query");
                Err(GuardError::LimiterUnavailable)
            }
            FailMode::Open => {
                warn!(error = %e, "Admission limiter failed, admitting query (fail-open)");
                Ok(())
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        params: &[QueryParam],
        category: QueryCategory,
    ) -> Result<ExecutionOutcome, GuardError> {
        let call = self.engine.execute(query, params, category.outcome_shape());

        let result = match self.config.query_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Query timed out");
                    self.metrics.record_timeout();
                    return Err(GuardError::Timeout);
                }
            },
            None => call.await,
        };

        result.map_err(|e| {
            warn!(
                driver = self.engine.driver_id(),
                error_kind = e.kind(),
                error = %e,
                "Query execution failed"
            );
            GuardError::ExecutionFailure
        })
    }

    fn reject(&self, query: &str, identity: &Identity, rejection: Rejection) -> ResultEnvelope {
        let Rejection { category, error } = rejection;
        debug!(kind = error.kind(), reason = %error, "Query rejected");
        self.metrics.record_rejection(&error);
        self.emit(
            AuditEvent::new(AuditEventKind::QueryBlocked, query, identity)
                .with_category(category)
                .with_reason(error.kind(), error.to_string()),
        );
        shape_error(&error)
    }

    fn fail(
        &self,
        query: &str,
        identity: &Identity,
        category: QueryCategory,
        elapsed_ms: f64,
        error: &GuardError,
    ) {
        self.metrics.record_execution(elapsed_ms, false);
        self.emit(
            AuditEvent::new(AuditEventKind::QueryFailed, query, identity)
                .with_category(category)
                .with_reason(error.kind(), error.to_string())
                .with_execution(elapsed_ms, None),
        );
    }

    /// Hands the event to the sink; a panicking sink is logged and ignored.
    fn emit(&self, event: AuditEvent) {
        let sink = &self.audit;
        if catch_unwind(AssertUnwindSafe(|| sink.record_event(&event))).is_err() {
            error!(event_id = %event.id, "Audit sink panicked, event dropped");
        }
    }
}
