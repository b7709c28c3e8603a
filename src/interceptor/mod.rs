//! Query Admission Interceptor
//!
//! Every query passes through the same stages before it may reach the
//! database:
//! - **Structure**: single statement only
//! - **Classification**: SELECT / INSERT / UPDATE / DELETE / DDL / OTHER
//! - **Permissions**: write categories gated by deployment flags
//! - **Rules**: pattern, table and operation allow/deny lists
//! - **Admission**: per-identity rate windows and concurrency slots
//!
//! The [`Executor`] runs the stages in that order and shapes every outcome
//! into a [`ResultEnvelope`].

pub mod audit;
pub mod classifier;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod permissions;
pub mod pipeline;
pub mod shaper;
pub mod tables;
pub mod types;

pub use audit::{AuditFanout, AuditQuery, AuditSink, AuditStats, AuditStore, TracingAuditSink};
pub use error::{FilterError, GuardError, LimiterError};
pub use filter::{FilterDecision, QueryFilter, RuleFilter, RuleList};
pub use limiter::{AdmissionControl, AdmissionLimiter, LimiterConfig, LimiterStatus};
pub use pipeline::{Executor, ExecutorConfig};
pub use types::*;
