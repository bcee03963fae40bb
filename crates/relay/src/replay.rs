// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command replay store: id/key deduplication, fingerprint conflict
//! detection, in-flight tracking, and a bounded outcome history.
//!
//! Identity of a request is its fingerprint — the canonical JSON
//! serialization of the envelope with `id` and `idempotencyKey` removed.
//! `serde_json` stores objects as `BTreeMap`, so keys come out
//! lexicographically sorted at every nesting level and the serialization
//! is deterministic; array order is preserved.
//!
//! The in-flight registry rejects new entries over capacity instead of
//! evicting — an evicted in-flight entry would break `dependsOn`
//! references. Outcomes and idempotency entries are bounded the other
//! way: LRU eviction and TTL sweeps respectively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{watch, Mutex};

use crate::command::{CommandEnvelope, CommandResponse, SERVER_LANE};
use crate::error::ErrorCode;

/// Reserved prefix for server-generated command ids.
pub const ANON_PREFIX: &str = "anon:";

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Canonical fingerprint of a command, excluding retry identity.
pub fn fingerprint(command: &CommandEnvelope) -> String {
    match serde_json::to_value(command) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.remove("id");
            map.remove("idempotencyKey");
            serde_json::Value::Object(map).to_string()
        }
        // An envelope always serializes to an object.
        _ => String::new(),
    }
}

/// Receiver side of an in-flight command's terminal response.
pub type ResponseWatch = watch::Receiver<Option<CommandResponse>>;

/// Recorded terminal state of a command.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub command_id: String,
    pub command_type: String,
    pub lane_key: String,
    pub fingerprint: String,
    pub success: bool,
    pub error: Option<String>,
    pub response: CommandResponse,
    pub session_version: Option<u64>,
    pub finished_at: u64,
}

/// A command that has been accepted but has not reached a terminal state.
#[derive(Clone)]
pub struct InFlightRecord {
    pub command_type: String,
    pub lane_key: String,
    pub fingerprint: String,
    pub rx: ResponseWatch,
}

struct InFlightSlot {
    record: InFlightRecord,
    epoch: u64,
}

struct IdempotencyEntry {
    expires_at: u64,
    command_type: String,
    fingerprint: String,
    response: CommandResponse,
}

/// Outcome of the replay check for an incoming command.
pub enum ReplayDecision {
    /// No replay possible; execute normally.
    Proceed,
    /// Same id or idempotency key previously used with a different
    /// fingerprint.
    Conflict(CommandResponse),
    /// Served from the idempotency cache or a completed outcome.
    Cached(CommandResponse),
    /// An equivalent command is in flight; await its terminal response.
    InFlight(ResponseWatch),
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub max_in_flight: usize,
    pub max_outcomes: usize,
    pub idempotency_ttl: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 10_000,
            max_outcomes: 2_000,
            idempotency_ttl: Duration::from_millis(600_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub in_flight: usize,
    pub outcomes: usize,
    pub idempotency_entries: usize,
    pub in_flight_rejections: u64,
}

#[derive(Default)]
struct ReplayInner {
    in_flight: HashMap<String, InFlightSlot>,
    outcomes: IndexMap<String, OutcomeRecord>,
    idempotency: HashMap<String, IdempotencyEntry>,
}

pub struct ReplayStore {
    opts: ReplayOptions,
    /// Stamp baked into synthetic ids. Never reset, so ids stay unique
    /// across `clear()`.
    process_start_ms: u64,
    seq: AtomicU64,
    epoch: AtomicU64,
    rejections: AtomicU64,
    inner: Mutex<ReplayInner>,
}

impl ReplayStore {
    pub fn new(opts: ReplayOptions) -> Self {
        Self {
            opts,
            process_start_ms: epoch_ms(),
            seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            inner: Mutex::new(ReplayInner::default()),
        }
    }

    /// Return the client-supplied id, or mint a synthetic
    /// `anon:<processStartMs>:<seq>` id.
    pub fn get_or_create_command_id(&self, command: &CommandEnvelope) -> String {
        match &command.id {
            Some(id) => id.clone(),
            None => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{ANON_PREFIX}{}:{seq}", self.process_start_ms)
            }
        }
    }

    /// Run the replay check for a command. Lookup order: idempotency
    /// cache, completed outcomes by id, in-flight by id. The first hit
    /// decides.
    pub async fn check(
        &self,
        command: &CommandEnvelope,
        command_id: &str,
        fingerprint: &str,
    ) -> ReplayDecision {
        self.check_at(command, command_id, fingerprint, epoch_ms()).await
    }

    async fn check_at(
        &self,
        command: &CommandEnvelope,
        command_id: &str,
        fingerprint: &str,
        now_ms: u64,
    ) -> ReplayDecision {
        let mut inner = self.inner.lock().await;
        inner.idempotency.retain(|_, entry| entry.expires_at > now_ms);

        if let Some(key) = &command.idempotency_key {
            let scope_key = idempotency_scope(command, key);
            if let Some(entry) = inner.idempotency.get(&scope_key) {
                if entry.fingerprint != fingerprint {
                    return ReplayDecision::Conflict(CommandResponse::failure(
                        command.id.clone(),
                        &command.command,
                        ErrorCode::Conflict,
                        format!(
                            "Conflicting idempotency key '{key}': previously used for '{}', now used for '{}'",
                            entry.command_type, command.command
                        ),
                    ));
                }
                return ReplayDecision::Cached(replayed(entry.response.clone(), command));
            }
        }

        if let Some(outcome) = inner.outcomes.get(command_id) {
            if outcome.fingerprint != fingerprint {
                return ReplayDecision::Conflict(CommandResponse::failure(
                    command.id.clone(),
                    &command.command,
                    ErrorCode::Conflict,
                    format!(
                        "Conflicting id '{command_id}': previously used for '{}', now used for '{}'",
                        outcome.command_type, command.command
                    ),
                ));
            }
            return ReplayDecision::Cached(replayed(outcome.response.clone(), command));
        }

        if let Some(slot) = inner.in_flight.get(command_id) {
            if slot.record.fingerprint != fingerprint {
                return ReplayDecision::Conflict(CommandResponse::failure(
                    command.id.clone(),
                    &command.command,
                    ErrorCode::Conflict,
                    format!(
                        "Conflicting id '{command_id}': previously used for '{}', now used for '{}'",
                        slot.record.command_type, command.command
                    ),
                ));
            }
            return ReplayDecision::InFlight(slot.record.rx.clone());
        }

        ReplayDecision::Proceed
    }

    /// Register a command as in flight. Returns the registration epoch,
    /// or `None` when a new entry would exceed capacity (reject, never
    /// evict). Overwriting an existing id is always allowed.
    pub async fn register_in_flight(
        &self,
        command_id: &str,
        record: InFlightRecord,
    ) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if !inner.in_flight.contains_key(command_id)
            && inner.in_flight.len() >= self.opts.max_in_flight
        {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        inner.in_flight.insert(command_id.to_owned(), InFlightSlot { record, epoch });
        Some(epoch)
    }

    /// Remove an in-flight entry, but only if it is still the same
    /// registration (a concurrent overwrite must not be removed by the
    /// earlier registration's cleanup).
    pub async fn unregister_in_flight(&self, command_id: &str, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.get(command_id).is_some_and(|slot| slot.epoch == epoch) {
            inner.in_flight.remove(command_id);
        }
    }

    pub async fn in_flight_snapshot(&self, command_id: &str) -> Option<InFlightRecord> {
        self.inner.lock().await.in_flight.get(command_id).map(|slot| slot.record.clone())
    }

    pub async fn outcome(&self, command_id: &str) -> Option<OutcomeRecord> {
        self.inner.lock().await.outcomes.get(command_id).cloned()
    }

    /// Record a terminal outcome. Overwriting an existing id keeps its
    /// LRU position; new ids append and evict the oldest on overflow.
    pub async fn store_outcome(&self, record: OutcomeRecord) {
        let mut inner = self.inner.lock().await;
        let existed = inner.outcomes.insert(record.command_id.clone(), record).is_some();
        if !existed {
            while inner.outcomes.len() > self.opts.max_outcomes {
                inner.outcomes.shift_remove_index(0);
            }
        }
    }

    /// Cache a terminal response under the command's idempotency key.
    pub async fn cache_idempotency(&self, command: &CommandEnvelope, response: &CommandResponse) {
        self.cache_idempotency_at(command, response, epoch_ms()).await;
    }

    async fn cache_idempotency_at(
        &self,
        command: &CommandEnvelope,
        response: &CommandResponse,
        now_ms: u64,
    ) {
        let Some(key) = &command.idempotency_key else {
            return;
        };
        let entry = IdempotencyEntry {
            expires_at: now_ms + self.opts.idempotency_ttl.as_millis() as u64,
            command_type: command.command.clone(),
            fingerprint: fingerprint(command),
            response: response.clone(),
        };
        self.inner.lock().await.idempotency.insert(idempotency_scope(command, key), entry);
    }

    /// Sweep expired idempotency entries. Returns how many were removed.
    pub async fn sweep_idempotency(&self) -> usize {
        self.sweep_idempotency_at(epoch_ms()).await
    }

    async fn sweep_idempotency_at(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, entry| entry.expires_at > now_ms);
        before - inner.idempotency.len()
    }

    pub async fn stats(&self) -> ReplayStats {
        let inner = self.inner.lock().await;
        ReplayStats {
            in_flight: inner.in_flight.len(),
            outcomes: inner.outcomes.len(),
            idempotency_entries: inner.idempotency.len(),
            in_flight_rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Drop all cached state. The synthetic-id sequence is deliberately
    /// not reset; ids stay unique for the process lifetime.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_flight.clear();
        inner.outcomes.clear();
        inner.idempotency.clear();
    }
}

fn idempotency_scope(command: &CommandEnvelope, key: &str) -> String {
    let scope = command.session_id.as_deref().unwrap_or(SERVER_LANE);
    format!("{scope}:{key}")
}

/// Shallow-clone a stored response for a replaying caller: stamped
/// `replayed: true` and carrying the caller's id (stripped when the
/// caller supplied none).
fn replayed(mut response: CommandResponse, command: &CommandEnvelope) -> CommandResponse {
    response.replayed = Some(true);
    response.id = command.id.clone();
    response
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;
