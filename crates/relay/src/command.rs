// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command envelope, response, and the static classification tables.
//!
//! Commands arrive as JSON objects with a `type` tag and a free-form
//! payload. The envelope keeps the payload opaque (flattened map) so the
//! core can fingerprint and route commands without knowing every
//! payload shape; session implementations pull the fields they need.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Lane key for commands that do not target a session.
pub const SERVER_LANE: &str = "_server_";

/// A command envelope as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Client-chosen command id. A synthetic id is generated if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Command name, e.g. `prompt` or `create_session`.
    #[serde(rename = "type")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Command ids that must reach a terminal state before this one runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// Optimistic concurrency precondition on the session version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_session_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Type-specific payload fields, carried opaquely.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl CommandEnvelope {
    /// Build a bare envelope for the given command name.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            session_id: None,
            depends_on: None,
            if_session_version: None,
            idempotency_key: None,
            payload: serde_json::Map::new(),
        }
    }

    /// The serialization lane this command executes on.
    pub fn lane_key(&self) -> String {
        match &self.session_id {
            Some(id) => format!("session:{id}"),
            None => SERVER_LANE.to_owned(),
        }
    }

    /// Fetch a string payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// A command response. Timeouts are responses (`timedOut: true`), never
/// errors raised to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Echoed command name.
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Session version after a successful session command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_version: Option<u64>,
    /// Set when the response was served from the replay store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
}

impl CommandResponse {
    pub fn success(id: Option<String>, command: &str) -> Self {
        Self {
            id,
            command: command.to_owned(),
            success: true,
            data: None,
            error: None,
            code: None,
            session_version: None,
            replayed: None,
            timed_out: None,
        }
    }

    pub fn failure(
        id: Option<String>,
        command: &str,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            command: command.to_owned(),
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
            session_version: None,
            replayed: None,
            timed_out: None,
        }
    }

    pub fn timed_out(id: Option<String>, command: &str, after: Duration) -> Self {
        let mut resp = Self::failure(
            id,
            command,
            ErrorCode::Timeout,
            format!("command timed out after {}ms", after.as_millis()),
        );
        resp.timed_out = Some(true);
        resp
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// -- Classification tables -----------------------------------------------------

/// Timeout buckets resolved by [`timeout_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Timeout for commands outside the short and uncancellable sets.
    pub default_timeout: Duration,
    /// Timeout for the cheap read-mostly command set.
    pub short_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(300_000),
            short_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Cheap read-mostly queries that get the short timeout.
pub fn is_short_timeout(command: &str) -> bool {
    matches!(
        command,
        "get_state"
            | "get_messages"
            | "get_available_models"
            | "get_commands"
            | "get_skills"
            | "get_tools"
            | "list_session_files"
            | "get_session_stats"
            | "get_fork_messages"
            | "get_last_assistant_text"
            | "get_context_usage"
            | "set_session_name"
    )
}

/// Atomic-creation operations run to completion and cannot be pre-empted.
pub fn is_cancellable(command: &str) -> bool {
    command != "create_session"
}

/// Resolve the timeout bucket for a command. `None` means uncancellable.
pub fn timeout_for(command: &str, policy: &TimeoutPolicy) -> Option<Duration> {
    if !is_cancellable(command) {
        None
    } else if is_short_timeout(command) {
        Some(policy.short_timeout)
    } else {
        Some(policy.default_timeout)
    }
}

/// Commands that never change session state.
pub fn is_read_only(command: &str) -> bool {
    matches!(
        command,
        "get_state"
            | "get_messages"
            | "get_available_models"
            | "get_commands"
            | "get_skills"
            | "get_tools"
            | "list_session_files"
            | "get_session_stats"
            | "get_fork_messages"
            | "get_last_assistant_text"
            | "get_context_usage"
            | "switch_session"
    )
}

/// Commands that are neither mutating nor read-only.
pub fn is_special(command: &str) -> bool {
    command == "extension_ui_response"
}

/// Whether a successful command advances the session version.
///
/// Unknown command types are treated as mutations; read-only is the
/// exception, not the default.
pub fn is_mutation(command: &str) -> bool {
    !is_read_only(command) && !is_special(command)
}

/// Shell-executing commands gated by the hybrid circuit breaker.
pub fn is_shell(command: &str) -> bool {
    command == "bash"
}

/// Commands dispatched by the server itself rather than a session.
pub fn is_server_command(command: &str) -> bool {
    matches!(
        command,
        "list_sessions"
            | "create_session"
            | "delete_session"
            | "switch_session"
            | "get_metrics"
            | "health_check"
    )
}

/// Whether the command must carry a `sessionId`.
pub fn requires_session(command: &str) -> bool {
    !matches!(command, "create_session" | "list_sessions" | "get_metrics" | "health_check")
}

/// The full known command surface.
pub fn is_known_command(command: &str) -> bool {
    is_server_command(command)
        || is_short_timeout(command)
        || matches!(command, "prompt" | "bash" | "extension_ui_response")
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
