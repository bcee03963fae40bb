// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle and the thin manager shell around the engine.
//!
//! The manager owns the session map, the subscriber hub, and the server
//! command surface. Agent sessions are opaque: the core only sees the
//! [`AgentSession`] trait (dispatch, event stream, dispose). Session
//! handles wrap the agent to intercept manager-owned commands
//! (`set_session_name`, pending-UI bookkeeping for
//! `extension_ui_response`) and to carry metadata.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{HybridBreaker, HybridOptions};
use crate::command::{CommandEnvelope, CommandResponse};
use crate::engine::{EngineOptions, ExecutionEngine, LaneScheduler};
use crate::error::ErrorCode;
use crate::events::{SessionEvent, SubscriberHub};
use crate::replay::{epoch_ms, ReplayOptions, ReplayStore};
use crate::version::SessionVersionStore;

/// Object-safe boxed future, the shape dyn session traits return.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A dispatch failure surfaced by a session or the server dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
    /// True when the underlying process could not be spawned. Spawn
    /// errors count as circuit-breaker failures; ordinary command
    /// failures do not.
    pub spawn_failure: bool,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), spawn_failure: false }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::InternalError, message: message.into(), spawn_failure: true }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// An opaque agent session. Object-safe for use as `Arc<dyn AgentSession>`.
pub trait AgentSession: Send + Sync {
    /// Dispatch one command to this session.
    fn handle(
        &self,
        command: CommandEnvelope,
    ) -> BoxFuture<'_, Result<serde_json::Value, DispatchError>>;

    /// Subscribe to the session's event stream.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Release the session's resources. Idempotent.
    fn dispose(&self) -> BoxFuture<'_, ()>;
}

/// Builds agent sessions for `create_session`.
pub trait SessionFactory: Send + Sync {
    fn create<'a>(
        &'a self,
        session_id: &'a str,
        command: &'a CommandEnvelope,
    ) -> BoxFuture<'a, Result<Arc<dyn AgentSession>, DispatchError>>;
}

/// Session lookup, consumed by the engine.
pub trait SessionResolver: Send + Sync {
    fn resolve<'a>(&'a self, session_id: &'a str)
        -> BoxFuture<'a, Option<Arc<dyn AgentSession>>>;
}

/// Server-level command dispatch, consumed by the engine.
pub trait ServerDispatch: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        command: &'a CommandEnvelope,
    ) -> BoxFuture<'a, Result<serde_json::Value, DispatchError>>;
}

// -- Session handle ------------------------------------------------------------

/// A live session: the opaque agent plus manager-owned metadata.
pub struct SessionHandle {
    pub id: String,
    pub name: RwLock<Option<String>>,
    pub created_at: u64,
    pub cancel: CancellationToken,
    agent: Arc<dyn AgentSession>,
    /// UI request ids observed on the event stream and not yet answered.
    pending_ui: Mutex<HashSet<String>>,
}

impl SessionHandle {
    pub fn new(id: String, agent: Arc<dyn AgentSession>, name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: RwLock::new(name),
            created_at: epoch_ms(),
            cancel: CancellationToken::new(),
            agent,
            pending_ui: Mutex::new(HashSet::new()),
        })
    }

    async fn snapshot(&self, versions: &SessionVersionStore) -> serde_json::Value {
        json!({
            "sessionId": self.id,
            "name": *self.name.read().await,
            "createdAt": self.created_at,
            "version": versions.get(&self.id).await,
        })
    }
}

impl AgentSession for SessionHandle {
    fn handle(
        &self,
        command: CommandEnvelope,
    ) -> BoxFuture<'_, Result<serde_json::Value, DispatchError>> {
        Box::pin(async move {
            let kind = command.command.clone();
            match kind.as_str() {
                "set_session_name" => {
                    let name = command
                        .payload_str("name")
                        .ok_or_else(|| DispatchError::validation("set_session_name requires 'name'"))?
                        .to_owned();
                    *self.name.write().await = Some(name.clone());
                    Ok(json!({ "sessionId": self.id, "name": name }))
                }
                "extension_ui_response" => {
                    let request_id = command
                        .payload_str("requestId")
                        .ok_or_else(|| {
                            DispatchError::validation("extension_ui_response requires 'requestId'")
                        })?
                        .to_owned();
                    if !self.pending_ui.lock().await.remove(&request_id) {
                        return Err(DispatchError::validation(format!(
                            "no pending ui request '{request_id}'"
                        )));
                    }
                    self.agent.handle(command).await
                }
                _ => self.agent.handle(command).await,
            }
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.agent.subscribe()
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cancel.cancel();
            self.pending_ui.lock().await.clear();
            self.agent.dispose().await;
        })
    }
}

/// Forward a session's event stream into the hub until the session is
/// cancelled, tracking pending UI requests along the way.
fn spawn_event_forwarder(hub: Arc<SubscriberHub>, handle: Arc<SessionHandle>) {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                event = rx.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(session_id = %handle.id, skipped, "event forwarder lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    match &event {
                        SessionEvent::UiRequest { request_id, .. } => {
                            handle.pending_ui.lock().await.insert(request_id.clone());
                        }
                        SessionEvent::UiCancelled { request_id } => {
                            handle.pending_ui.lock().await.remove(request_id);
                        }
                        _ => {}
                    }
                    hub.broadcast(&handle.id, event).await;
                }
            }
        }
    });
}

// -- Manager -------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub engine: EngineOptions,
    pub replay: ReplayOptions,
    pub breaker: HybridOptions,
    /// Per-session breaker state idle longer than this is reclaimed.
    pub breaker_idle_timeout: Duration,
    /// Maintenance sweep cadence.
    pub maintenance_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            engine: EngineOptions::default(),
            replay: ReplayOptions::default(),
            breaker: HybridOptions::default(),
            breaker_idle_timeout: Duration::from_millis(1_800_000),
            maintenance_interval: Duration::from_millis(60_000),
        }
    }
}

/// Shared dispatch target: session map, subscriber hub, and the server
/// command surface.
struct ManagerCore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    factory: Arc<dyn SessionFactory>,
    hub: Arc<SubscriberHub>,
    versions: Arc<SessionVersionStore>,
    replay: Arc<ReplayStore>,
    lanes: Arc<LaneScheduler>,
    breaker: Arc<HybridBreaker>,
    started_at: u64,
}

impl ManagerCore {
    async fn create_session(
        &self,
        command: &CommandEnvelope,
    ) -> Result<serde_json::Value, DispatchError> {
        let session_id = Uuid::new_v4().to_string();
        let agent = self.factory.create(&session_id, command).await?;
        let name = command.payload_str("name").map(ToOwned::to_owned);
        let handle = SessionHandle::new(session_id.clone(), agent, name.clone());

        self.sessions.write().await.insert(session_id.clone(), Arc::clone(&handle));
        spawn_event_forwarder(Arc::clone(&self.hub), Arc::clone(&handle));
        info!(session_id = %session_id, "session created");

        Ok(json!({
            "sessionId": session_id,
            "name": name,
            "createdAt": handle.created_at,
        }))
    }

    async fn delete_session(
        &self,
        command: &CommandEnvelope,
    ) -> Result<serde_json::Value, DispatchError> {
        let Some(session_id) = &command.session_id else {
            return Err(DispatchError::validation("delete_session requires sessionId"));
        };
        let Some(handle) = self.sessions.write().await.remove(session_id) else {
            return Err(DispatchError::new(
                ErrorCode::UnknownSession,
                format!("unknown session '{session_id}'"),
            ));
        };

        // Cancel anything a client is still waiting on before the agent
        // goes away.
        let pending: Vec<String> = handle.pending_ui.lock().await.drain().collect();
        for request_id in pending {
            self.hub.broadcast(session_id, SessionEvent::UiCancelled { request_id }).await;
        }
        self.hub.broadcast(session_id, SessionEvent::Disposed).await;

        handle.dispose().await;
        self.hub.scrub_session(session_id).await;
        info!(session_id = %session_id, "session deleted");

        Ok(json!({ "sessionId": session_id, "deleted": true }))
    }

    async fn switch_session(
        &self,
        command: &CommandEnvelope,
    ) -> Result<serde_json::Value, DispatchError> {
        let Some(session_id) = &command.session_id else {
            return Err(DispatchError::validation("switch_session requires sessionId"));
        };
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(Arc::clone)
        };
        match handle {
            Some(handle) => Ok(handle.snapshot(&self.versions).await),
            None => Err(DispatchError::new(
                ErrorCode::UnknownSession,
                format!("unknown session '{session_id}'"),
            )),
        }
    }

    async fn list_sessions(&self) -> serde_json::Value {
        let handles: Vec<Arc<SessionHandle>> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(Arc::clone).collect()
        };
        let mut entries = Vec::with_capacity(handles.len());
        for handle in handles {
            entries.push(handle.snapshot(&self.versions).await);
        }
        entries.sort_by_key(|entry| entry["createdAt"].as_u64().unwrap_or(0));
        json!({ "sessions": entries })
    }

    async fn get_metrics(&self) -> serde_json::Value {
        let replay = self.replay.stats().await;
        let breaker = self.breaker.stats().await;
        json!({
            "uptimeMs": epoch_ms().saturating_sub(self.started_at),
            "sessions": self.sessions.read().await.len(),
            "subscribers": self.hub.len().await,
            "lanes": self.lanes.lane_count().await,
            "commands": {
                "inFlight": replay.in_flight,
                "outcomes": replay.outcomes,
                "idempotencyEntries": replay.idempotency_entries,
                "inFlightRejections": replay.in_flight_rejections,
            },
            "breaker": {
                "globalState": breaker.global_state.as_str(),
                "globalFailures": breaker.global_failures,
                "sessionStates": breaker.session_states,
            },
        })
    }

    async fn health_check(&self) -> serde_json::Value {
        json!({
            "status": "running",
            "sessions": self.sessions.read().await.len(),
            "uptimeMs": epoch_ms().saturating_sub(self.started_at),
        })
    }
}

impl SessionResolver for ManagerCore {
    fn resolve<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Option<Arc<dyn AgentSession>>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(|h| Arc::clone(h) as Arc<dyn AgentSession>)
        })
    }
}

impl ServerDispatch for ManagerCore {
    fn dispatch<'a>(
        &'a self,
        command: &'a CommandEnvelope,
    ) -> BoxFuture<'a, Result<serde_json::Value, DispatchError>> {
        Box::pin(async move {
            match command.command.as_str() {
                "list_sessions" => Ok(self.list_sessions().await),
                "create_session" => self.create_session(command).await,
                "delete_session" => self.delete_session(command).await,
                "switch_session" => self.switch_session(command).await,
                "get_metrics" => Ok(self.get_metrics().await),
                "health_check" => Ok(self.health_check().await),
                other => Err(DispatchError::new(
                    ErrorCode::UnknownCommand,
                    format!("unknown server command '{other}'"),
                )),
            }
        })
    }
}

/// The session multiplexer façade: routes every command through the
/// execution engine and owns session lifecycle plus event fan-out.
pub struct SessionManager {
    core: Arc<ManagerCore>,
    engine: ExecutionEngine,
    opts: ManagerOptions,
}

impl SessionManager {
    pub fn new(opts: ManagerOptions, factory: Arc<dyn SessionFactory>) -> Self {
        let lanes = Arc::new(LaneScheduler::new());
        let replay = Arc::new(ReplayStore::new(opts.replay.clone()));
        let versions = Arc::new(SessionVersionStore::new());
        let breaker = Arc::new(HybridBreaker::new(opts.breaker.clone()));

        let core = Arc::new(ManagerCore {
            sessions: RwLock::new(HashMap::new()),
            factory,
            hub: Arc::new(SubscriberHub::new()),
            versions: Arc::clone(&versions),
            replay: Arc::clone(&replay),
            lanes: Arc::clone(&lanes),
            breaker: Arc::clone(&breaker),
            started_at: epoch_ms(),
        });

        let engine = ExecutionEngine::new(
            opts.engine.clone(),
            lanes,
            replay,
            versions,
            breaker,
            Arc::clone(&core) as Arc<dyn SessionResolver>,
            Arc::clone(&core) as Arc<dyn ServerDispatch>,
        );

        Self { core, engine, opts }
    }

    /// Execute one command envelope. Never fails; see
    /// [`ExecutionEngine::execute`].
    pub async fn execute(&self, command: CommandEnvelope) -> CommandResponse {
        self.engine.execute(command).await
    }

    /// The subscriber hub for event fan-out.
    pub fn hub(&self) -> Arc<SubscriberHub> {
        Arc::clone(&self.core.hub)
    }

    pub async fn session_count(&self) -> usize {
        self.core.sessions.read().await.len()
    }

    /// Periodically reclaim stale breaker state and expired idempotency
    /// entries until shutdown.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) {
        let breaker = Arc::clone(&self.core.breaker);
        let replay = Arc::clone(&self.core.replay);
        let interval = self.opts.maintenance_interval;
        let idle = self.opts.breaker_idle_timeout;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let reclaimed = breaker.cleanup_stale(idle).await;
                let swept = replay.sweep_idempotency().await;
                if reclaimed > 0 || swept > 0 {
                    debug!(reclaimed, swept, "maintenance sweep");
                }
            }
        });
    }

    /// Dispose every live session (graceful shutdown).
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.core.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.dispose().await;
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
