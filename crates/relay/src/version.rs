// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session monotonic version counters.
//!
//! Every live session has exactly one version entry, initialized to 0 at
//! creation and advanced once per successful mutating command. Responses
//! to session commands are stamped with the resulting version so clients
//! can issue `ifSessionVersion` preconditions.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::command::{self, CommandEnvelope, CommandResponse};

#[derive(Default)]
pub struct SessionVersionStore {
    versions: RwLock<HashMap<String, u64>>,
}

impl SessionVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version for a session. Missing entries read as 0.
    pub async fn get(&self, session_id: &str) -> u64 {
        self.versions.read().await.get(session_id).copied().unwrap_or(0)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.versions.read().await.contains_key(session_id)
    }

    /// Create the version entry for a new session at 0.
    pub async fn initialize(&self, session_id: &str) -> u64 {
        self.versions.write().await.insert(session_id.to_owned(), 0);
        0
    }

    /// Advance and return the next version.
    pub async fn increment(&self, session_id: &str) -> u64 {
        let mut versions = self.versions.write().await;
        let entry = versions.entry(session_id.to_owned()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub async fn set(&self, session_id: &str, version: u64) {
        self.versions.write().await.insert(session_id.to_owned(), version);
    }

    pub async fn remove(&self, session_id: &str) {
        self.versions.write().await.remove(session_id);
    }

    pub async fn clear(&self) {
        self.versions.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.versions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.versions.read().await.is_empty()
    }

    /// Stamp a response with the session version resulting from a command.
    ///
    /// Failed responses pass through unchanged. `create_session` success
    /// initializes the new session (id read from `data.sessionId`) and
    /// stamps version 0; `delete_session` success removes the entry and
    /// stamps nothing. Any other session-targeted command persists
    /// `current + 1` when the command is a mutation, `current` otherwise,
    /// and stamps the result. Server-level commands without a session id
    /// pass through unchanged.
    pub async fn apply(
        &self,
        command: &CommandEnvelope,
        mut response: CommandResponse,
    ) -> CommandResponse {
        if !response.success {
            return response;
        }

        match command.command.as_str() {
            "create_session" => {
                let created = response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned);
                if let Some(id) = created {
                    let version = self.initialize(&id).await;
                    response.session_version = Some(version);
                }
                response
            }
            "delete_session" => {
                if let Some(id) = &command.session_id {
                    self.remove(id).await;
                }
                response
            }
            _ => {
                let Some(session_id) = &command.session_id else {
                    return response;
                };
                let current = self.get(session_id).await;
                let next = if command::is_mutation(&command.command) { current + 1 } else { current };
                self.set(session_id, next).await;
                response.session_version = Some(next);
                response
            }
        }
    }
}

#[cfg(test)]
#[path = "version_tests.rs"]
mod tests;
