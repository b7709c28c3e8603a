// SPDX-License-Identifier: Apache-2.0

//! Admission Limiter
//!
//! Per-identity sliding-window rate limiting (minute and hour horizons) and
//! a non-blocking concurrency cap. Each identity's state sits behind its own
//! mutex, so check-then-record and acquire/release are atomic per identity.
//! Different identities share only the brief lookup in the identity map;
//! window checks and slot counting run under the per-identity lock.
//!
//! State is created on first use and evicted once an identity is idle: no
//! in-flight slots, no active cooldown, nothing left in the hour window and
//! no request for `idle_ttl`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::LimiterError;
use super::types::Identity;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Time source, swappable in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterConfig {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_concurrent: u32,
    pub cooldown: Duration,
    /// Idle time after which an identity's state is dropped
    pub idle_ttl: Duration,
    /// Minimum spacing of opportunistic sweeps
    pub sweep_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 60,
            max_per_hour: 1000,
            max_concurrent: 10,
            cooldown: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.max_per_minute == 0 || self.max_per_hour == 0 || self.max_concurrent == 0 {
            return Err(LimiterError::InvalidConfig(
                "limits must be positive".to_string(),
            ));
        }
        if self.max_per_hour < self.max_per_minute {
            return Err(LimiterError::InvalidConfig(format!(
                "hourly limit {} is below the per-minute limit {}",
                self.max_per_hour, self.max_per_minute
            )));
        }
        Ok(())
    }
}

/// Externally visible limiter state of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterState {
    Open,
    Limited,
    Cooldown,
}

/// Result of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    Denied { retry_after_secs: u64 },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Rate-limit header information for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub state: LimiterState,
    pub minute_remaining: u32,
    pub hour_remaining: u32,
    pub in_flight: u32,
    pub retry_after: Option<u64>,
}

/// Rate and concurrency gate consulted by the executor
pub trait AdmissionControl: Send + Sync {
    /// Atomically checks both windows and records the request when allowed.
    fn check_and_record(&self, identity: &Identity) -> Result<AdmissionDecision, LimiterError>;

    /// Takes a concurrency slot without blocking; false when at capacity.
    fn acquire_slot(&self, identity: &Identity) -> Result<bool, LimiterError>;

    /// Returns a slot taken by a successful `acquire_slot`.
    fn release_slot(&self, identity: &Identity);
}

/// Holds one concurrency slot and releases it on drop.
///
/// Dropping covers every exit path: normal return, error, panic unwind and
/// a cancelled future.
pub struct SlotGuard {
    limiter: Arc<dyn AdmissionControl>,
    identity: Identity,
}

impl SlotGuard {
    /// Acquires a slot, or `None` when the identity is at capacity.
    pub fn acquire(
        limiter: Arc<dyn AdmissionControl>,
        identity: &Identity,
    ) -> Result<Option<Self>, LimiterError> {
        if !limiter.acquire_slot(identity)? {
            return Ok(None);
        }
        Ok(Some(Self {
            limiter,
            identity: identity.clone(),
        }))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.limiter.release_slot(&self.identity);
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("identity", &self.identity)
            .finish()
    }
}

#[derive(Debug)]
struct IdentityState {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    in_flight: u32,
    cooldown_until: Option<Instant>,
    last_seen: Instant,
}

impl IdentityState {
    fn new(now: Instant) -> Self {
        Self {
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            in_flight: 0,
            cooldown_until: None,
            last_seen: now,
        }
    }

    fn purge(&mut self, now: Instant) {
        purge_window(&mut self.minute, now, MINUTE);
        purge_window(&mut self.hour, now, HOUR);
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    fn check_and_record(&mut self, now: Instant, config: &LimiterConfig) -> AdmissionDecision {
        self.last_seen = now;

        if let Some(until) = self.cooldown_until {
            if now < until {
                return AdmissionDecision::Denied {
                    retry_after_secs: ceil_secs(until - now),
                };
            }
            self.cooldown_until = None;
        }

        self.purge(now);

        for (window, horizon, max) in [
            (&self.minute, MINUTE, config.max_per_minute),
            (&self.hour, HOUR, config.max_per_hour),
        ] {
            if window.len() >= max as usize {
                let window_reset = window
                    .front()
                    .map(|oldest| (*oldest + horizon).saturating_duration_since(now))
                    .unwrap_or_default();
                self.cooldown_until = Some(now + config.cooldown);
                return AdmissionDecision::Denied {
                    retry_after_secs: ceil_secs(config.cooldown.max(window_reset)),
                };
            }
        }

        self.minute.push_back(now);
        self.hour.push_back(now);
        AdmissionDecision::Allowed
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        // Dropping a live hour window would hand out a fresh hourly budget
        let hour_expired = self
            .hour
            .back()
            .map_or(true, |newest| now.saturating_duration_since(*newest) >= HOUR);
        self.in_flight == 0
            && hour_expired
            && !self.in_cooldown(now)
            && now.saturating_duration_since(self.last_seen) >= ttl
    }

    fn status(&mut self, now: Instant, config: &LimiterConfig) -> LimiterStatus {
        self.purge(now);
        let minute_remaining = config.max_per_minute.saturating_sub(self.minute.len() as u32);
        let hour_remaining = config.max_per_hour.saturating_sub(self.hour.len() as u32);

        let (state, retry_after) = match self.cooldown_until {
            Some(until) if now < until => (LimiterState::Cooldown, Some(ceil_secs(until - now))),
            _ if minute_remaining == 0 || hour_remaining == 0 => (LimiterState::Limited, None),
            _ => (LimiterState::Open, None),
        };

        LimiterStatus {
            state,
            minute_remaining,
            hour_remaining,
            in_flight: self.in_flight,
            retry_after,
        }
    }
}

fn purge_window(window: &mut VecDeque<Instant>, now: Instant, horizon: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Whole seconds, rounded up, never zero
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// In-process admission limiter keyed by identity
pub struct AdmissionLimiter {
    config: RwLock<LimiterConfig>,
    identities: Mutex<HashMap<Identity, Arc<Mutex<IdentityState>>>>,
    clock: Arc<dyn Clock>,
    last_sweep: Mutex<Instant>,
}

impl AdmissionLimiter {
    pub fn new(config: LimiterConfig) -> Result<Self, LimiterError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self, LimiterError> {
        config.validate()?;
        let now = clock.now();
        info!(
            per_minute = config.max_per_minute,
            per_hour = config.max_per_hour,
            concurrent = config.max_concurrent,
            "Admission limiter initialized"
        );
        Ok(Self {
            config: RwLock::new(config),
            identities: Mutex::new(HashMap::new()),
            clock,
            last_sweep: Mutex::new(now),
        })
    }

    pub fn config(&self) -> LimiterConfig {
        *self.config.read()
    }

    /// Replaces the limits; they apply from the next check.
    pub fn update_limits(&self, config: LimiterConfig) -> Result<(), LimiterError> {
        config.validate()?;
        *self.config.write() = config;
        info!(
            per_minute = config.max_per_minute,
            per_hour = config.max_per_hour,
            concurrent = config.max_concurrent,
            "Admission limits updated"
        );
        Ok(())
    }

    pub fn status(&self, identity: &Identity) -> LimiterStatus {
        let config = self.config();
        let now = self.clock.now();
        let existing = self.identities.lock().get(identity).cloned();
        match existing {
            Some(state) => state.lock().status(now, &config),
            None => LimiterStatus {
                state: LimiterState::Open,
                minute_remaining: config.max_per_minute,
                hour_remaining: config.max_per_hour,
                in_flight: 0,
                retry_after: None,
            },
        }
    }

    /// Number of identities with live state
    pub fn tracked_identities(&self) -> usize {
        self.identities.lock().len()
    }

    /// Drops state of idle identities. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        *self.last_sweep.lock() = now;
        let ttl = self.config().idle_ttl;

        let mut identities = self.identities.lock();
        let before = identities.len();
        identities.retain(|_, state| {
            // Someone between lookup and lock still holds a handle
            if Arc::strong_count(state) > 1 {
                return true;
            }
            match state.try_lock() {
                Some(guard) => !guard.is_idle(now, ttl),
                None => true,
            }
        });
        let removed = before - identities.len();
        if removed > 0 {
            debug!(removed, remaining = identities.len(), "Evicted idle limiter state");
        }
        removed
    }

    fn maybe_sweep(&self, now: Instant) {
        let interval = self.config().sweep_interval;
        let due = now.saturating_duration_since(*self.last_sweep.lock()) >= interval;
        if due {
            self.sweep_idle();
        }
    }

    fn state_for(&self, identity: &Identity, now: Instant) -> Arc<Mutex<IdentityState>> {
        let mut identities = self.identities.lock();
        Arc::clone(
            identities
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(IdentityState::new(now)))),
        )
    }
}

impl AdmissionControl for AdmissionLimiter {
    fn check_and_record(&self, identity: &Identity) -> Result<AdmissionDecision, LimiterError> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let config = self.config();
        let state = self.state_for(identity, now);
        let decision = state.lock().check_and_record(now, &config);

        if let AdmissionDecision::Denied { retry_after_secs } = decision {
            warn!(identity = %identity, retry_after_secs, "Rate limit exceeded");
        }
        Ok(decision)
    }

    fn acquire_slot(&self, identity: &Identity) -> Result<bool, LimiterError> {
        let now = self.clock.now();
        let max = self.config().max_concurrent;
        let state = self.state_for(identity, now);
        let mut state = state.lock();

        state.last_seen = now;
        if state.in_flight >= max {
            debug!(identity = %identity, in_flight = state.in_flight, "Concurrency limit reached");
            return Ok(false);
        }
        state.in_flight += 1;
        Ok(true)
    }

    fn release_slot(&self, identity: &Identity) {
        let now = self.clock.now();
        let existing = self.identities.lock().get(identity).cloned();
        let Some(state) = existing else {
            warn!(identity = %identity, "Slot released for untracked identity");
            return;
        };

        let mut state = state.lock();
        state.last_seen = now;
        if state.in_flight == 0 {
            warn!(identity = %identity, "Slot released more often than acquired");
            return;
        }
        state.in_flight -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_minute: u32, per_hour: u32, concurrent: u32, cooldown_secs: u64) -> LimiterConfig {
        LimiterConfig {
            max_per_minute: per_minute,
            max_per_hour: per_hour,
            max_concurrent: concurrent,
            cooldown: Duration::from_secs(cooldown_secs),
            ..Default::default()
        }
    }

    fn limiter(config: LimiterConfig) -> (AdmissionLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = AdmissionLimiter::with_clock(config, clock.clone()).unwrap();
        (limiter, clock)
    }

    fn check(limiter: &AdmissionLimiter, id: &str) -> AdmissionDecision {
        limiter.check_and_record(&Identity::new(id)).unwrap()
    }

    #[test]
    fn minute_limit_denies_the_next_call() {
        let (limiter, _) = limiter(config(10, 100, 3, 10));

        for i in 0..10 {
            assert!(check(&limiter, "test_client").is_allowed(), "request {}", i + 1);
        }
        match check(&limiter, "test_client") {
            AdmissionDecision::Denied { retry_after_secs } => assert!(retry_after_secs >= 10),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn identities_are_isolated() {
        let (limiter, _) = limiter(config(10, 100, 3, 10));

        for _ in 0..10 {
            check(&limiter, "client1");
        }
        assert!(!check(&limiter, "client1").is_allowed());
        assert!(check(&limiter, "client2").is_allowed());
    }

    #[test]
    fn cooldown_holds_even_after_window_drains() {
        let (limiter, clock) = limiter(config(2, 100, 3, 120));

        check(&limiter, "c");
        check(&limiter, "c");
        assert!(!check(&limiter, "c").is_allowed());

        // Minute window has emptied, cooldown has not
        clock.advance(Duration::from_secs(90));
        match check(&limiter, "c") {
            AdmissionDecision::Denied { retry_after_secs } => assert_eq!(retry_after_secs, 30),
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(limiter.status(&Identity::new("c")).state, LimiterState::Cooldown);

        clock.advance(Duration::from_secs(30));
        assert!(check(&limiter, "c").is_allowed());
        assert_eq!(limiter.status(&Identity::new("c")).state, LimiterState::Open);
    }

    #[test]
    fn sliding_window_frees_capacity_gradually() {
        let (limiter, clock) = limiter(config(4, 100, 3, 1));

        check(&limiter, "c");
        check(&limiter, "c");
        clock.advance(Duration::from_secs(30));
        check(&limiter, "c");
        check(&limiter, "c");

        // First two entries leave the window at t=60
        clock.advance(Duration::from_secs(31));
        assert!(check(&limiter, "c").is_allowed());
        assert!(check(&limiter, "c").is_allowed());
        assert!(!check(&limiter, "c").is_allowed());
    }

    #[test]
    fn hour_limit_applies_across_minutes() {
        let (limiter, clock) = limiter(config(5, 10, 3, 1));

        for _ in 0..2 {
            for _ in 0..5 {
                assert!(check(&limiter, "c").is_allowed());
            }
            clock.advance(Duration::from_secs(61));
        }
        match check(&limiter, "c") {
            AdmissionDecision::Denied { retry_after_secs } => {
                // Oldest request leaves the hour window after ~58 minutes
                assert!(retry_after_secs > 3000, "{retry_after_secs}");
            }
            other => panic!("expected hourly denial, got {other:?}"),
        }
    }

    #[test]
    fn denied_requests_are_not_recorded() {
        let (limiter, clock) = limiter(config(1, 100, 3, 1));
        check(&limiter, "c");
        assert!(!check(&limiter, "c").is_allowed());
        assert_eq!(limiter.status(&Identity::new("c")).hour_remaining, 99);
        clock.advance(Duration::from_secs(61));
        assert!(check(&limiter, "c").is_allowed());
    }

    #[test]
    fn concurrency_cap_is_non_blocking() {
        let (limiter, _) = limiter(config(10, 100, 3, 10));
        let id = Identity::new("test_client");

        for _ in 0..3 {
            assert!(limiter.acquire_slot(&id).unwrap());
        }
        assert!(!limiter.acquire_slot(&id).unwrap());
        assert!(limiter.acquire_slot(&Identity::new("other")).unwrap());

        limiter.release_slot(&id);
        assert!(limiter.acquire_slot(&id).unwrap());
        assert!(!limiter.acquire_slot(&id).unwrap());
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let clock = Arc::new(ManualClock::new());
        let limiter: Arc<AdmissionLimiter> =
            Arc::new(AdmissionLimiter::with_clock(config(10, 100, 1, 10), clock).unwrap());
        let control: Arc<dyn AdmissionControl> = limiter.clone();
        let id = Identity::new("c");

        let guard = SlotGuard::acquire(control.clone(), &id).unwrap();
        assert!(guard.is_some());
        assert!(SlotGuard::acquire(control.clone(), &id).unwrap().is_none());
        assert_eq!(limiter.status(&id).in_flight, 1);

        drop(guard);
        assert_eq!(limiter.status(&id).in_flight, 0);
        assert!(SlotGuard::acquire(control, &id).unwrap().is_some());
    }

    #[test]
    fn extra_release_does_not_underflow() {
        let (limiter, _) = limiter(config(10, 100, 1, 10));
        let id = Identity::new("c");
        limiter.release_slot(&id);
        assert!(limiter.acquire_slot(&id).unwrap());
        limiter.release_slot(&id);
        limiter.release_slot(&id);
        assert_eq!(limiter.status(&id).in_flight, 0);
    }

    #[test]
    fn concurrent_checks_never_exceed_the_limit() {
        let limiter = Arc::new(AdmissionLimiter::new(config(50, 1000, 3, 10)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| check(&limiter, "shared").is_allowed())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn idle_identities_are_evicted() {
        let cfg = LimiterConfig {
            idle_ttl: Duration::from_secs(300),
            ..config(10, 100, 3, 10)
        };
        let (limiter, clock) = limiter(cfg);

        check(&limiter, "idle");
        check(&limiter, "busy");
        assert!(limiter.acquire_slot(&Identity::new("busy")).unwrap());
        assert_eq!(limiter.tracked_identities(), 2);

        clock.advance(Duration::from_secs(3601));
        assert_eq!(limiter.sweep_idle(), 1);
        assert_eq!(limiter.tracked_identities(), 1);
        assert_eq!(limiter.status(&Identity::new("idle")).minute_remaining, 10);
    }

    #[test]
    fn eviction_keeps_the_hour_window() {
        let cfg = LimiterConfig {
            idle_ttl: Duration::from_secs(120),
            ..config(5, 10, 3, 10)
        };
        let (limiter, clock) = limiter(cfg);

        let mut admitted = 0;
        for _ in 0..5 {
            admitted += check(&limiter, "burst").is_allowed() as u32;
        }
        clock.advance(Duration::from_secs(61));
        for _ in 0..5 {
            admitted += check(&limiter, "burst").is_allowed() as u32;
        }
        clock.advance(Duration::from_secs(182));
        assert_eq!(limiter.sweep_idle(), 0);
        for _ in 0..5 {
            admitted += check(&limiter, "burst").is_allowed() as u32;
        }

        assert_eq!(admitted, 10);
        assert_eq!(limiter.status(&Identity::new("burst")).hour_remaining, 0);
    }

    #[test]
    fn identities_in_cooldown_are_kept() {
        let cfg = LimiterConfig {
            idle_ttl: Duration::from_secs(10),
            ..config(1, 100, 3, 600)
        };
        let (limiter, clock) = limiter(cfg);

        check(&limiter, "c");
        check(&limiter, "c");
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.sweep_idle(), 0);
        assert!(!check(&limiter, "c").is_allowed());
    }

    #[test]
    fn opportunistic_sweep_runs_during_checks() {
        let cfg = LimiterConfig {
            idle_ttl: Duration::from_secs(100),
            sweep_interval: Duration::from_secs(50),
            ..config(10, 100, 3, 10)
        };
        let (limiter, clock) = limiter(cfg);

        check(&limiter, "gone");
        clock.advance(Duration::from_secs(3601));
        check(&limiter, "new");
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[test]
    fn limits_update_at_runtime() {
        let (limiter, _) = limiter(config(1, 100, 3, 1));
        check(&limiter, "c");
        limiter.update_limits(config(5, 100, 3, 1)).unwrap();
        assert!(check(&limiter, "c").is_allowed());

        assert!(limiter.update_limits(config(0, 100, 3, 1)).is_err());
        assert!(limiter.update_limits(config(10, 5, 3, 1)).is_err());
    }
}
