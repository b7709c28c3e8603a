// sqlwarden - query admission guard for MySQL tool servers
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod interceptor;
pub mod metrics;
pub mod observability;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use config::{ConfigError, Settings};
use engine::drivers::mysql::MySqlEngine;
use engine::{EngineError, QueryEngine};
use interceptor::{
    AuditFanout, AuditStore, AdmissionLimiter, Executor, ExecutorConfig, RuleFilter,
    TracingAuditSink,
};

/// In-memory audit events kept for listing and statistics
const AUDIT_MEMORY_ENTRIES: usize = 1000;
/// Lines kept in the audit file before it is rotated
const AUDIT_FILE_ENTRIES: usize = 10_000;
const AUDIT_FILE_NAME: &str = "audit.jsonl";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Every collaborator of the running service, wired once at startup
pub struct AppState {
    pub settings: Settings,
    pub executor: Arc<Executor>,
    pub filter: Arc<RuleFilter>,
    /// Absent when rate limiting is disabled
    pub limiter: Option<Arc<AdmissionLimiter>>,
    pub audit: Arc<AuditStore>,
}

impl AppState {
    /// Opens the MySQL pool and wires the pipeline around it.
    pub async fn connect(settings: Settings) -> Result<Self, StartupError> {
        let engine = MySqlEngine::connect(&settings).await?;
        Ok(Self::with_engine(settings, Arc::new(engine))?)
    }

    /// Wires the pipeline around an already built engine.
    pub fn with_engine(
        settings: Settings,
        engine: Arc<dyn QueryEngine>,
    ) -> Result<Self, ConfigError> {
        let security = &settings.security;

        let filter = Arc::new(RuleFilter::try_new(security.load_filter_rules()?)?);

        let limiter = if security.enable_rate_limiting {
            Some(Arc::new(AdmissionLimiter::new(security.limiter_config())?))
        } else {
            None
        };

        let audit = Arc::new(match &settings.log_dir {
            Some(dir) => AuditStore::with_file(dir.join(AUDIT_FILE_NAME), AUDIT_FILE_ENTRIES),
            None => AuditStore::in_memory(AUDIT_MEMORY_ENTRIES),
        });

        let config = ExecutorConfig {
            permissions: settings.permissions,
            query_timeout: settings.query_timeout(),
            filter_fail_mode: security.filter_fail_mode,
            limiter_fail_mode: security.limiter_fail_mode,
        };

        let mut executor = Executor::new(engine, config)
            .with_filter(filter.clone())
            .with_audit(Arc::new(
                AuditFanout::new()
                    .with_sink(Arc::new(TracingAuditSink))
                    .with_sink(audit.clone()),
            ));
        if let Some(limiter) = &limiter {
            executor = executor.with_limiter(limiter.clone());
        }

        info!(
            database = %settings.connection_string_safe(),
            permissions = ?settings.permissions,
            rate_limiting = security.enable_rate_limiting,
            "Query pipeline ready"
        );

        Ok(Self {
            settings,
            executor: Arc::new(executor),
            filter,
            limiter,
            audit,
        })
    }
}
