//! End-to-end admission pipeline tests against an in-memory engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::sync::Semaphore;

use sqlwarden::engine::{
    EngineError, EngineResult, ExecutionOutcome, OutcomeShape, QueryEngine, QueryParam, Row,
    Value,
};
use sqlwarden::interceptor::limiter::ManualClock;
use sqlwarden::interceptor::{
    AdmissionLimiter, AuditEventKind, AuditQuery, AuditStore, Executor, ExecutorConfig,
    FilterRuleSet, Identity, LimiterConfig, PermissionSet, QueryCategory, RuleFilter, RuleList,
};

/// What the fake engine does when called
#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Sleeps this long before answering
    Slow(Duration),
    /// Never answers
    Hang,
}

struct FakeEngine {
    behavior: Behavior,
    calls: AtomicUsize,
    last_params: Mutex<Vec<QueryParam>>,
    /// When set, every call waits for a permit before answering
    gate: Option<Arc<Semaphore>>,
}

impl FakeEngine {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            last_params: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(Behavior::Succeed)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryEngine for FakeEngine {
    fn driver_id(&self) -> &'static str {
        "fake"
    }

    async fn execute(
        &self,
        _query: &str,
        params: &[QueryParam],
        shape: OutcomeShape,
    ) -> EngineResult<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = params.to_vec();

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }

        match self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail => {
                return Err(EngineError::execution_error(
                    "Access denied for user 'root'@'10.0.0.5' (using password: YES)",
                ))
            }
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            Behavior::Hang => std::future::pending::<()>().await,
        }

        Ok(match shape {
            OutcomeShape::Rows => ExecutionOutcome::Rows(vec![Row::new()
                .with_column("id", Value::Int(1))
                .with_column("name", Value::Text("alice".into()))]),
            OutcomeShape::AffectedCount => ExecutionOutcome::AffectedCount(1),
        })
    }
}

fn limiter_config(per_minute: u32, concurrent: u32) -> LimiterConfig {
    LimiterConfig {
        max_per_minute: per_minute,
        max_per_hour: per_minute.max(1000),
        max_concurrent: concurrent,
        ..LimiterConfig::default()
    }
}

fn client(name: &str) -> Identity {
    Identity::new(name)
}

#[tokio::test]
async fn select_with_defaults_returns_rows() {
    let engine = Arc::new(FakeEngine::new(Behavior::Succeed));
    let executor = Executor::new(engine.clone(), ExecutorConfig::default());

    let envelope = executor
        .execute("SELECT * FROM users WHERE id = ?", &[QueryParam::Int(1)], &client("clientA"))
        .await;

    assert!(envelope.success());
    assert_eq!(envelope.rows_affected(), None);
    assert_eq!(envelope.data().map(|rows| rows.len()), Some(1));
    assert_eq!(*engine.last_params.lock(), vec![QueryParam::Int(1)]);

    let json = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["rowsAffected"], serde_json::Value::Null);
    assert_eq!(json["data"][0]["name"], "alice");
}

#[tokio::test]
async fn stacked_statements_are_refused_before_execution() {
    let engine = Arc::new(FakeEngine::new(Behavior::Succeed));
    let executor = Executor::new(
        engine.clone(),
        ExecutorConfig {
            permissions: PermissionSet::all_writes(),
            ..ExecutorConfig::default()
        },
    );

    let envelope = executor
        .execute("SELECT * FROM users; DROP TABLE users;", &[], &client("clientA"))
        .await;

    assert!(!envelope.success());
    assert_eq!(envelope.error(), Some("Multiple statements detected in query"));
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn delete_follows_its_permission_flag() {
    let engine = Arc::new(FakeEngine::new(Behavior::Succeed));

    let read_only = Executor::new(engine.clone(), ExecutorConfig::default());
    let envelope = read_only.execute("DELETE FROM users", &[], &client("clientA")).await;
    assert_eq!(envelope.error(), Some("DELETE operations are not allowed"));
    assert_eq!(engine.calls(), 0);

    let writable = Executor::new(
        engine.clone(),
        ExecutorConfig {
            permissions: PermissionSet {
                allow_delete: true,
                ..PermissionSet::default()
            },
            ..ExecutorConfig::default()
        },
    );
    let envelope = writable.execute("DELETE FROM users", &[], &client("clientA")).await;
    assert!(envelope.success());
    assert_eq!(envelope.rows_affected(), Some(1));
    assert!(envelope.data().is_none());
}

#[tokio::test]
async fn each_write_flag_unlocks_only_its_category() {
    let statements = [
        (QueryCategory::Insert, "INSERT INTO t VALUES (1)"),
        (QueryCategory::Update, "UPDATE t SET a = 1"),
        (QueryCategory::Delete, "DELETE FROM t"),
    ];

    for (enabled, _) in statements {
        let permissions = PermissionSet {
            allow_insert: enabled == QueryCategory::Insert,
            allow_update: enabled == QueryCategory::Update,
            allow_delete: enabled == QueryCategory::Delete,
        };
        let executor = Executor::new(
            Arc::new(FakeEngine::new(Behavior::Succeed)),
            ExecutorConfig {
                permissions,
                ..ExecutorConfig::default()
            },
        );

        for (category, sql) in statements {
            let envelope = executor.execute(sql, &[], &client("c")).await;
            assert_eq!(
                envelope.success(),
                category == enabled,
                "{} with only {} enabled",
                category,
                enabled
            );
        }
    }
}

#[tokio::test]
async fn commented_cte_writes_still_need_their_flag() {
    let engine = Arc::new(FakeEngine::new(Behavior::Succeed));
    let executor = Executor::new(engine.clone(), ExecutorConfig::default());

    for (sql, expected) in [
        (
            "WITH old AS (SELECT id FROM users) /* c */ DELETE FROM users",
            "DELETE operations are not allowed",
        ),
        (
            "WITH old AS (SELECT id FROM users) -- c\nUPDATE users SET active = 0",
            "UPDATE operations are not allowed",
        ),
    ] {
        let envelope = executor.execute(sql, &[], &client("c")).await;
        assert_eq!(envelope.error(), Some(expected), "{}", sql);
    }
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn ddl_is_refused_even_with_every_flag() {
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Succeed)),
        ExecutorConfig {
            permissions: PermissionSet::all_writes(),
            ..ExecutorConfig::default()
        },
    );

    for sql in ["DROP TABLE users", "create index i on t(a)", "  TRUNCATE t", "ALTER TABLE t ADD c INT"] {
        let envelope = executor.execute(sql, &[], &client("c")).await;
        assert_eq!(envelope.error(), Some("DDL operations are not allowed"), "{}", sql);
    }
}

#[tokio::test]
async fn table_whitelist_denies_unlisted_tables() {
    let rules = FilterRuleSet {
        whitelist_tables: ["orders".to_string()].into_iter().collect(),
        ..FilterRuleSet::default()
    };
    let filter = Arc::new(RuleFilter::try_new(rules).unwrap());
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Succeed)),
        ExecutorConfig::default(),
    )
    .with_filter(filter.clone());

    let denied = executor.execute("SELECT * FROM users", &[], &client("c")).await;
    assert_eq!(
        denied.error(),
        Some("Query blocked by filter: Table 'users' is not in whitelist")
    );

    let allowed = executor
        .execute("SELECT o.id FROM shop.orders AS o", &[], &client("c"))
        .await;
    assert!(allowed.success());

    filter.add_rule(RuleList::WhitelistTables, "Users").unwrap();
    assert!(executor.execute("SELECT * FROM users", &[], &client("c")).await.success());
}

#[tokio::test]
async fn blacklisted_pattern_names_the_pattern() {
    let rules = FilterRuleSet {
        blacklist_patterns: vec![r"information_schema".to_string()],
        ..FilterRuleSet::default()
    };
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Succeed)),
        ExecutorConfig::default(),
    )
    .with_filter(Arc::new(RuleFilter::try_new(rules).unwrap()));

    let envelope = executor
        .execute("select table_name from INFORMATION_SCHEMA.tables", &[], &client("c"))
        .await;
    assert_eq!(
        envelope.error(),
        Some("Query blocked by filter: Query matches blacklisted pattern: information_schema")
    );
}

#[tokio::test]
async fn invalid_pattern_fails_closed_by_default() {
    let rules = FilterRuleSet {
        blacklist_patterns: vec!["(unclosed".to_string()],
        ..FilterRuleSet::default()
    };
    let engine = Arc::new(FakeEngine::new(Behavior::Succeed));
    let executor = Executor::new(engine.clone(), ExecutorConfig::default())
        .with_filter(Arc::new(RuleFilter::new(rules)));

    let envelope = executor.execute("SELECT 1", &[], &client("c")).await;
    assert_eq!(envelope.error(), Some("Query filter unavailable"));
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn rate_limit_is_per_identity() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(AdmissionLimiter::with_clock(limiter_config(3, 10), clock.clone()).unwrap());
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Succeed)),
        ExecutorConfig::default(),
    )
    .with_limiter(limiter.clone());

    for _ in 0..3 {
        assert!(executor.execute("SELECT 1", &[], &client("a")).await.success());
    }

    let denied = executor.execute("SELECT 1", &[], &client("a")).await;
    assert_eq!(denied.error(), Some("Rate limit exceeded, retry after 60 seconds"));

    // a being limited leaves b's budget untouched
    for _ in 0..3 {
        assert!(executor.execute("SELECT 1", &[], &client("b")).await.success());
    }
    assert!(!executor.execute("SELECT 1", &[], &client("b")).await.success());

    clock.advance(Duration::from_secs(61));
    assert!(executor.execute("SELECT 1", &[], &client("a")).await.success());
}

#[tokio::test]
async fn concurrency_cap_refuses_the_extra_query_until_one_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(FakeEngine::gated(gate.clone()));
    let limiter = Arc::new(AdmissionLimiter::new(limiter_config(100, 2)).unwrap());
    let executor = Arc::new(
        Executor::new(engine.clone(), ExecutorConfig::default()).with_limiter(limiter.clone()),
    );
    let id = client("busy");

    let running: Vec<_> = (0..2)
        .map(|_| {
            let executor = executor.clone();
            let id = id.clone();
            tokio::spawn(async move { executor.execute("SELECT 1", &[], &id).await })
        })
        .collect();

    while limiter.status(&id).in_flight < 2 {
        tokio::task::yield_now().await;
    }

    let refused = executor.execute("SELECT 1", &[], &id).await;
    assert_eq!(refused.error(), Some("Too many concurrent queries"));

    // Another identity is unaffected
    gate.add_permits(1);
    assert!(executor.execute("SELECT 1", &[], &client("idle")).await.success());

    gate.add_permits(2);
    for handle in futures::future::join_all(running).await {
        assert!(handle.unwrap().success());
    }
    assert_eq!(limiter.status(&id).in_flight, 0);
    assert!(executor.execute("SELECT 1", &[], &id).await.success());
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_fixed_message_and_releases_slot() {
    let limiter = Arc::new(AdmissionLimiter::new(limiter_config(100, 1)).unwrap());
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Slow(Duration::from_secs(120)))),
        ExecutorConfig {
            query_timeout: Some(Duration::from_secs(5)),
            ..ExecutorConfig::default()
        },
    )
    .with_limiter(limiter.clone());
    let id = client("slow");

    let envelope = executor.execute("SELECT SLEEP(120)", &[], &id).await;

    assert_eq!(envelope.error(), Some("Query timed out"));
    assert_eq!(limiter.status(&id).in_flight, 0);
    assert_eq!(executor.metrics().snapshot().timeouts, 1);
}

#[tokio::test]
async fn dropping_the_call_releases_the_slot() {
    let limiter = Arc::new(AdmissionLimiter::new(limiter_config(100, 1)).unwrap());
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Hang)),
        ExecutorConfig::default(),
    )
    .with_limiter(limiter.clone());
    let id = client("impatient");

    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), executor.execute("SELECT 1", &[], &id))
            .await;

    assert!(cancelled.is_err());
    assert_eq!(limiter.status(&id).in_flight, 0);
}

#[tokio::test]
async fn failures_are_audited_without_driver_text() {
    let audit = Arc::new(AuditStore::in_memory(100));
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Fail)),
        ExecutorConfig::default(),
    )
    .with_audit(audit.clone());

    let failed = executor.execute("SELECT * FROM users", &[], &client("clientA")).await;
    let blocked = executor.execute("DROP TABLE users", &[], &client("clientA")).await;

    assert_eq!(failed.error(), Some("Query execution failed"));
    assert!(!serde_json::to_string(&failed).unwrap().contains("10.0.0.5"));
    assert!(!blocked.success());

    let events = audit.get_entries(&AuditQuery::default());
    assert_eq!(events.len(), 2);

    let blocked_event = &events[0];
    assert_eq!(blocked_event.kind, AuditEventKind::QueryBlocked);
    assert_eq!(blocked_event.category, Some(QueryCategory::Ddl));
    assert_eq!(blocked_event.identity, "clientA");
    assert_eq!(blocked_event.reason.as_deref(), Some("DDL operations are not allowed"));

    let failed_event = &events[1];
    assert_eq!(failed_event.kind, AuditEventKind::QueryFailed);
    assert_eq!(failed_event.query, "SELECT * FROM users");
    assert_eq!(failed_event.error_kind.as_deref(), Some("execution_failure"));

    let stats = audit.get_stats();
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn anonymous_callers_share_one_budget() {
    let limiter = Arc::new(AdmissionLimiter::new(limiter_config(2, 10)).unwrap());
    let executor = Executor::new(
        Arc::new(FakeEngine::new(Behavior::Succeed)),
        ExecutorConfig::default(),
    )
    .with_limiter(limiter);

    assert!(executor.execute("SELECT 1", &[], &Identity::from_optional(None)).await.success());
    assert!(executor.execute("SELECT 1", &[], &Identity::new("  ")).await.success());
    assert!(!executor.execute("SELECT 1", &[], &Identity::anonymous()).await.success());
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn any_second_statement_is_refused(
        head in "(SELECT|INSERT INTO t VALUES|DELETE FROM t|UPDATE t SET a =) [a-z0-9 ]{0,16}",
        tail in "[A-Za-z][A-Za-z0-9 ]{0,16}",
    ) {
        let executor = Executor::new(
            Arc::new(FakeEngine::new(Behavior::Succeed)),
            ExecutorConfig {
                permissions: PermissionSet::all_writes(),
                ..ExecutorConfig::default()
            },
        );
        let query = format!("{};{}", head, tail);
        let envelope = block_on(executor.execute(&query, &[], &Identity::anonymous()));
        prop_assert_eq!(envelope.error(), Some("Multiple statements detected in query"));
    }

    #[test]
    fn ddl_prefix_is_always_refused(
        keyword in "(CREATE|DROP|ALTER|TRUNCATE|RENAME|create|drop)",
        rest in "[a-z_ ]{0,24}",
    ) {
        let executor = Executor::new(
            Arc::new(FakeEngine::new(Behavior::Succeed)),
            ExecutorConfig {
                permissions: PermissionSet::all_writes(),
                ..ExecutorConfig::default()
            },
        );
        let query = format!("{} {}", keyword, rest);
        let envelope = block_on(executor.execute(&query, &[], &Identity::anonymous()));
        prop_assert_eq!(envelope.error(), Some("DDL operations are not allowed"));
    }
}
