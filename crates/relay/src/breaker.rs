// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breakers for shell-executing commands.
//!
//! Only timeouts and spawn errors count as failures. A shell command
//! that runs and exits non-zero is a legitimate result and must not
//! trip the breaker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Failures within `window` required to open.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted.
    pub window: Duration,
    /// Time spent open before allowing half-open probes.
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_calls: usize,
    /// Consecutive half-open successes required to close.
    pub success_threshold: usize,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            window: Duration::from_millis(120_000),
            recovery_timeout: Duration::from_millis(30_000),
            half_open_max_calls: 3,
            success_threshold: 2,
        }
    }
}

/// Why a call was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerRejection {
    /// The breaker is open; retry after the given duration.
    Open { retry_after: Duration },
    /// Half-open, and all probe slots are taken.
    Saturated,
}

impl std::fmt::Display for BreakerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { retry_after } => {
                write!(f, "circuit open, retry in {}ms", retry_after.as_millis())
            }
            Self::Saturated => f.write_str("circuit half-open, probe limit reached"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
    half_open_successes: usize,
}

/// Generic circuit breaker: closed until `failure_threshold` failures
/// land inside the sliding window, then open for `recovery_timeout`,
/// then half-open until `success_threshold` consecutive probe successes
/// close it again (any probe failure re-opens).
pub struct CircuitBreaker {
    opts: BreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(opts: BreakerOptions) -> Self {
        Self {
            opts,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Admit or reject a call, transitioning open → half-open when the
    /// recovery timeout has elapsed.
    pub async fn try_acquire(&self) -> Result<(), BreakerRejection> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner.failures, now, self.opts.window);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.opts.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(BreakerRejection::Open {
                        retry_after: self.opts.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.opts.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerRejection::Saturated)
                }
            }
        }
    }

    /// Record a qualifying failure (timeout or spawn error).
    pub async fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.failures.push_back(now);
        Self::prune(&mut inner.failures, now, self.opts.window);

        match inner.state {
            CircuitState::HalfOpen => {
                // A failed probe re-opens immediately.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => {
                if inner.failures.len() >= self.opts.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot without recording an outcome.
    /// Used when an admitted probe never actually ran.
    pub async fn release_probe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a completed call. Only meaningful while half-open.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        inner.half_open_successes += 1;
        if inner.half_open_successes >= self.opts.success_threshold {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.failures.clear();
            inner.half_open_in_flight = 0;
            inner.half_open_successes = 0;
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner.failures, now, self.opts.window);
        inner.failures.len()
    }

    fn prune(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while failures.front().is_some_and(|t| now.saturating_duration_since(*t) > window) {
            failures.pop_front();
        }
    }
}

// -- Hybrid per-session + global breaker ---------------------------------------

#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub session: BreakerOptions,
    pub global: BreakerOptions,
    /// Bound on tracked per-session breakers; LRU-evicted beyond this.
    pub max_states: usize,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            session: BreakerOptions { failure_threshold: 10, ..BreakerOptions::default() },
            global: BreakerOptions { failure_threshold: 50, ..BreakerOptions::default() },
            max_states: 1_000,
        }
    }
}

struct SessionSlot {
    breaker: Arc<CircuitBreaker>,
    last_access: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridStats {
    pub session_states: usize,
    pub global_state: CircuitState,
    pub global_failures: usize,
}

/// Per-session breakers plus one global breaker aggregating all
/// sessions. Either one being open rejects the call; the session
/// breaker is consulted first.
pub struct HybridBreaker {
    opts: HybridOptions,
    sessions: Mutex<IndexMap<String, SessionSlot>>,
    global: CircuitBreaker,
}

impl HybridBreaker {
    pub fn new(opts: HybridOptions) -> Self {
        let global = CircuitBreaker::new(opts.global.clone());
        Self { opts, sessions: Mutex::new(IndexMap::new()), global }
    }

    /// Whether a gated command may execute on this session. Returns a
    /// descriptive reason on rejection.
    pub async fn can_execute(&self, session_id: &str) -> Result<(), String> {
        let breaker = self.session_breaker(session_id).await;
        if let Err(rejection) = breaker.try_acquire().await {
            return Err(format!("session '{session_id}': {rejection}"));
        }
        if let Err(rejection) = self.global.try_acquire().await {
            // The session probe admitted above never runs; give its
            // slot back or the session breaker saturates for good.
            breaker.release_probe().await;
            return Err(format!("global: {rejection}"));
        }
        Ok(())
    }

    /// Record a timeout or spawn error against both breakers.
    pub async fn record_failure(&self, session_id: &str) {
        let breaker = self.session_breaker(session_id).await;
        breaker.record_failure().await;
        self.global.record_failure().await;
    }

    /// Record a completed execution against both breakers.
    pub async fn record_success(&self, session_id: &str) {
        let breaker = self.session_breaker(session_id).await;
        breaker.record_success().await;
        self.global.record_success().await;
    }

    /// Drop per-session breakers idle longer than `max_idle`. Returns
    /// how many were reclaimed.
    pub async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, slot| now.saturating_duration_since(slot.last_access) <= max_idle);
        before - sessions.len()
    }

    pub async fn stats(&self) -> HybridStats {
        HybridStats {
            session_states: self.sessions.lock().await.len(),
            global_state: self.global.state().await,
            global_failures: self.global.failure_count().await,
        }
    }

    pub async fn session_state(&self, session_id: &str) -> Option<CircuitState> {
        let breaker = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).map(|slot| Arc::clone(&slot.breaker))
        };
        match breaker {
            Some(b) => Some(b.state().await),
            None => None,
        }
    }

    /// Fetch-or-create the session's breaker, bumping it to
    /// most-recently-used and evicting the oldest beyond capacity.
    async fn session_breaker(&self, session_id: &str) -> Arc<CircuitBreaker> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let breaker = match sessions.shift_remove(session_id) {
            Some(mut slot) => {
                slot.last_access = now;
                let breaker = Arc::clone(&slot.breaker);
                sessions.insert(session_id.to_owned(), slot);
                breaker
            }
            None => {
                let breaker = Arc::new(CircuitBreaker::new(self.opts.session.clone()));
                sessions.insert(
                    session_id.to_owned(),
                    SessionSlot { breaker: Arc::clone(&breaker), last_access: now },
                );
                breaker
            }
        };
        while sessions.len() > self.opts.max_states {
            sessions.shift_remove_index(0);
        }
        breaker
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
