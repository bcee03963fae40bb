// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use crate::breaker::{BreakerOptions, HybridOptions};
use crate::command::TimeoutPolicy;
use crate::engine::EngineOptions;
use crate::replay::ReplayOptions;
use crate::session::ManagerOptions;

/// Configuration for the relay server.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "relay", about = "Agent session multiplexer")]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9700, env = "RELAY_PORT")]
    pub port: u16,

    /// Token for WebSocket auth. If unset, auth is disabled.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Timeout for commands outside the short bucket, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "RELAY_DEFAULT_COMMAND_TIMEOUT_MS")]
    pub default_command_timeout_ms: u64,

    /// Timeout for cheap read-mostly commands, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "RELAY_SHORT_COMMAND_TIMEOUT_MS")]
    pub short_command_timeout_ms: u64,

    /// Max wait for a cross-lane dependency, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "RELAY_DEPENDENCY_WAIT_TIMEOUT_MS")]
    pub dependency_wait_timeout_ms: u64,

    /// Idempotency cache TTL in milliseconds.
    #[arg(long, default_value_t = 600_000, env = "RELAY_IDEMPOTENCY_TTL_MS")]
    pub idempotency_ttl_ms: u64,

    /// Outcome LRU capacity.
    #[arg(long, default_value_t = 2_000, env = "RELAY_MAX_COMMAND_OUTCOMES")]
    pub max_command_outcomes: usize,

    /// In-flight command cap; excess commands are rejected.
    #[arg(long, default_value_t = 10_000, env = "RELAY_MAX_IN_FLIGHT_COMMANDS")]
    pub max_in_flight_commands: usize,

    /// Bound on tracked per-session breaker states.
    #[arg(long, default_value_t = 1_000, env = "RELAY_MAX_BREAKER_STATES")]
    pub max_breaker_states: usize,

    /// Timeout failures on one session required to open its breaker.
    #[arg(long, default_value_t = 10, env = "RELAY_SESSION_FAILURE_THRESHOLD")]
    pub session_failure_threshold: usize,

    /// Timeout failures across all sessions required to open the global
    /// breaker.
    #[arg(long, default_value_t = 50, env = "RELAY_GLOBAL_FAILURE_THRESHOLD")]
    pub global_failure_threshold: usize,

    /// Sliding failure window for both breakers, in milliseconds.
    #[arg(long, default_value_t = 120_000, env = "RELAY_BREAKER_WINDOW_MS")]
    pub breaker_window_ms: u64,

    /// Time an open breaker waits before half-open probes, in
    /// milliseconds.
    #[arg(long, default_value_t = 30_000, env = "RELAY_BREAKER_RECOVERY_MS")]
    pub breaker_recovery_ms: u64,

    /// Concurrent probes admitted while half-open.
    #[arg(long, default_value_t = 3, env = "RELAY_BREAKER_HALF_OPEN_MAX_CALLS")]
    pub breaker_half_open_max_calls: usize,

    /// Consecutive half-open successes required to close.
    #[arg(long, default_value_t = 2, env = "RELAY_BREAKER_SUCCESS_THRESHOLD")]
    pub breaker_success_threshold: usize,

    /// Idle bound before per-session breaker state is reclaimed, in
    /// milliseconds.
    #[arg(long, default_value_t = 1_800_000, env = "RELAY_BREAKER_IDLE_MS")]
    pub breaker_idle_ms: u64,

    /// Maintenance sweep interval in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "RELAY_MAINTENANCE_INTERVAL_MS")]
    pub maintenance_interval_ms: u64,
}

impl RelayConfig {
    /// Build the runtime options for the session manager and engine.
    pub fn manager_options(&self) -> ManagerOptions {
        let window = Duration::from_millis(self.breaker_window_ms);
        let recovery = Duration::from_millis(self.breaker_recovery_ms);

        ManagerOptions {
            engine: EngineOptions {
                timeouts: TimeoutPolicy {
                    default_timeout: Duration::from_millis(self.default_command_timeout_ms),
                    short_timeout: Duration::from_millis(self.short_command_timeout_ms),
                },
                dependency_wait_timeout: Duration::from_millis(self.dependency_wait_timeout_ms),
            },
            replay: ReplayOptions {
                max_in_flight: self.max_in_flight_commands,
                max_outcomes: self.max_command_outcomes,
                idempotency_ttl: Duration::from_millis(self.idempotency_ttl_ms),
            },
            breaker: HybridOptions {
                session: BreakerOptions {
                    failure_threshold: self.session_failure_threshold,
                    window,
                    recovery_timeout: recovery,
                    half_open_max_calls: self.breaker_half_open_max_calls,
                    success_threshold: self.breaker_success_threshold,
                },
                global: BreakerOptions {
                    failure_threshold: self.global_failure_threshold,
                    window,
                    recovery_timeout: recovery,
                    half_open_max_calls: self.breaker_half_open_max_calls,
                    success_threshold: self.breaker_success_threshold,
                },
                max_states: self.max_breaker_states,
            },
            breaker_idle_timeout: Duration::from_millis(self.breaker_idle_ms),
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms),
        }
    }
}
