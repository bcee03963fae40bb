// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution engine: lane scheduling, replay, dependencies,
//! preconditions, timeouts, and orchestration of the stores.
//!
//! Every command runs on a lane — a FIFO with a single worker. Lanes
//! serialize commands per session (`session:<id>`) or per server
//! (`_server_`); different lanes run in parallel. A drained lane is
//! removed from the map entirely.
//!
//! Timeouts are responses, never cancellation: when a dispatch overruns
//! its classified timeout, the caller receives `timedOut: true`, the
//! lane is released, and the work is detached to finish in the
//! background where it records its outcome normally. A duplicate retry
//! then deduplicates against that outcome.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::debug;

use crate::breaker::HybridBreaker;
use crate::command::{self, CommandEnvelope, CommandResponse, TimeoutPolicy};
use crate::error::ErrorCode;
use crate::replay::{
    self, epoch_ms, InFlightRecord, OutcomeRecord, ReplayDecision, ReplayStore, ResponseWatch,
    ANON_PREFIX,
};
use crate::session::{AgentSession, DispatchError, ServerDispatch, SessionResolver};
use crate::version::SessionVersionStore;

/// A unit of lane work.
type LaneTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Per-lane FIFO scheduler. One worker per lane; unbounded concurrency
/// between lanes; drained lanes are removed.
#[derive(Default)]
pub struct LaneScheduler {
    lanes: Mutex<HashMap<String, LaneState>>,
}

struct LaneState {
    queue: VecDeque<LaneTask>,
}

impl LaneScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task to a lane, starting a worker if the lane is idle.
    pub async fn enqueue(sched: &Arc<Self>, lane_key: &str, task: LaneTask) {
        let mut lanes = sched.lanes.lock().await;
        if let Some(state) = lanes.get_mut(lane_key) {
            state.queue.push_back(task);
            return;
        }
        lanes.insert(lane_key.to_owned(), LaneState { queue: VecDeque::new() });
        drop(lanes);

        let sched = Arc::clone(sched);
        let lane_key = lane_key.to_owned();
        tokio::spawn(async move { sched.run_lane(lane_key, task).await });
    }

    async fn run_lane(&self, lane_key: String, first: LaneTask) {
        let mut task = first;
        loop {
            task.await;
            let mut lanes = self.lanes.lock().await;
            let Some(state) = lanes.get_mut(&lane_key) else {
                break;
            };
            match state.queue.pop_front() {
                Some(next) => {
                    drop(lanes);
                    task = next;
                }
                None => {
                    lanes.remove(&lane_key);
                    break;
                }
            }
        }
    }

    /// Number of lanes with queued or running work.
    pub async fn lane_count(&self) -> usize {
        self.lanes.lock().await.len()
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub timeouts: TimeoutPolicy,
    /// Upper bound on waiting for a cross-lane dependency.
    pub dependency_wait_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            dependency_wait_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Per-command execution context threaded through the pipeline.
struct CommandCtx {
    command: CommandEnvelope,
    command_id: String,
    fingerprint: String,
    lane_key: String,
    epoch: u64,
    watch_tx: watch::Sender<Option<CommandResponse>>,
}

/// Where a command's dispatch lands.
enum DispatchTarget {
    Server,
    Session(Arc<dyn AgentSession>),
}

#[derive(Clone)]
pub struct ExecutionEngine {
    opts: Arc<EngineOptions>,
    lanes: Arc<LaneScheduler>,
    replay: Arc<ReplayStore>,
    versions: Arc<SessionVersionStore>,
    breaker: Arc<HybridBreaker>,
    resolver: Arc<dyn SessionResolver>,
    server: Arc<dyn ServerDispatch>,
}

impl ExecutionEngine {
    pub fn new(
        opts: EngineOptions,
        lanes: Arc<LaneScheduler>,
        replay: Arc<ReplayStore>,
        versions: Arc<SessionVersionStore>,
        breaker: Arc<HybridBreaker>,
        resolver: Arc<dyn SessionResolver>,
        server: Arc<dyn ServerDispatch>,
    ) -> Self {
        Self { opts: Arc::new(opts), lanes, replay, versions, breaker, resolver, server }
    }

    /// Execute one command. Never returns an error — every path,
    /// including timeouts and internal failures, produces a response.
    pub async fn execute(&self, command: CommandEnvelope) -> CommandResponse {
        if let Some(id) = &command.id {
            if id.starts_with(ANON_PREFIX) {
                return CommandResponse::failure(
                    command.id.clone(),
                    &command.command,
                    ErrorCode::ValidationError,
                    format!("client ids must not use the reserved '{ANON_PREFIX}' prefix"),
                );
            }
        }
        if !command::is_known_command(&command.command) {
            return CommandResponse::failure(
                command.id.clone(),
                &command.command,
                ErrorCode::UnknownCommand,
                format!("unknown command '{}'", command.command),
            );
        }
        if command::requires_session(&command.command) && command.session_id.is_none() {
            return CommandResponse::failure(
                command.id.clone(),
                &command.command,
                ErrorCode::ValidationError,
                format!("'{}' requires sessionId", command.command),
            );
        }

        let command_id = self.replay.get_or_create_command_id(&command);
        let fingerprint = replay::fingerprint(&command);
        let lane_key = command.lane_key();

        match self.replay.check(&command, &command_id, &fingerprint).await {
            ReplayDecision::Proceed => {}
            ReplayDecision::Conflict(resp) | ReplayDecision::Cached(resp) => return resp,
            ReplayDecision::InFlight(rx) => return await_in_flight(rx, &command).await,
        }

        let (watch_tx, watch_rx) = watch::channel(None);
        let record = InFlightRecord {
            command_type: command.command.clone(),
            lane_key: lane_key.clone(),
            fingerprint: fingerprint.clone(),
            rx: watch_rx,
        };
        let Some(epoch) = self.replay.register_in_flight(&command_id, record).await else {
            return CommandResponse::failure(
                Some(command_id),
                &command.command,
                ErrorCode::InFlightLimit,
                "in-flight command limit reached, retry later",
            );
        };

        let ctx = CommandCtx {
            command,
            command_id,
            fingerprint,
            lane_key: lane_key.clone(),
            epoch,
            watch_tx,
        };

        if let Err(resp) = self.await_dependencies(&ctx).await {
            return self.finalize(&ctx, resp).await;
        }

        let command_name = ctx.command.command.clone();
        let command_id = ctx.command_id.clone();
        let (caller_tx, caller_rx) = oneshot::channel();
        let engine = self.clone();
        let task: LaneTask = Box::pin(async move { engine.run_lane_task(ctx, caller_tx).await });
        LaneScheduler::enqueue(&self.lanes, &lane_key, task).await;

        match caller_rx.await {
            Ok(resp) => resp,
            Err(_) => CommandResponse::failure(
                Some(command_id),
                &command_name,
                ErrorCode::InternalError,
                "executor dropped before producing a response",
            ),
        }
    }

    /// Step 4: resolve `dependsOn` before the command is queued.
    async fn await_dependencies(&self, ctx: &CommandCtx) -> Result<(), CommandResponse> {
        let Some(deps) = &ctx.command.depends_on else {
            return Ok(());
        };
        for dep in deps {
            if let Some(outcome) = self.replay.outcome(dep).await {
                if outcome.success {
                    continue;
                }
                return Err(self.dependency_failure(
                    ctx,
                    ErrorCode::DependencyFailed,
                    format!("dependency '{dep}' failed"),
                ));
            }

            let Some(record) = self.replay.in_flight_snapshot(dep).await else {
                return Err(self.dependency_failure(
                    ctx,
                    ErrorCode::DependencyUnknown,
                    format!("unknown dependency '{dep}'"),
                ));
            };
            if record.lane_key == ctx.lane_key {
                // Waiting for an earlier command on our own lane would
                // deadlock the lane.
                return Err(self.dependency_failure(
                    ctx,
                    ErrorCode::DependencySameLane,
                    format!("dependency '{dep}' is in flight on the same lane"),
                ));
            }

            let mut rx = record.rx;
            let wait = self.opts.dependency_wait_timeout;
            match tokio::time::timeout(wait, wait_terminal(&mut rx)).await {
                Ok(Some(resp)) if resp.success => continue,
                Ok(Some(_)) => {
                    return Err(self.dependency_failure(
                        ctx,
                        ErrorCode::DependencyFailed,
                        format!("dependency '{dep}' failed"),
                    ));
                }
                Ok(None) => {
                    return Err(self.dependency_failure(
                        ctx,
                        ErrorCode::DependencyFailed,
                        format!("dependency '{dep}' was dropped before completing"),
                    ));
                }
                Err(_) => {
                    return Err(self.dependency_failure(
                        ctx,
                        ErrorCode::DependencyTimeout,
                        format!(
                            "timed out after {}ms waiting for dependency '{dep}'",
                            wait.as_millis()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn dependency_failure(
        &self,
        ctx: &CommandCtx,
        code: ErrorCode,
        message: String,
    ) -> CommandResponse {
        CommandResponse::failure(Some(ctx.command_id.clone()), &ctx.command.command, code, message)
    }

    /// Steps 6–9, running on the command's lane.
    async fn run_lane_task(self, ctx: CommandCtx, caller_tx: oneshot::Sender<CommandResponse>) {
        // 6. Optimistic concurrency precondition.
        if let (Some(session_id), Some(expected)) =
            (&ctx.command.session_id, ctx.command.if_session_version)
        {
            let actual = self.versions.get(session_id).await;
            if actual != expected {
                let resp = CommandResponse::failure(
                    None,
                    &ctx.command.command,
                    ErrorCode::VersionConflict,
                    format!("session version is {actual}, expected {expected}"),
                )
                .with_data(json!({ "actualVersion": actual }));
                let resp = self.finalize(&ctx, resp).await;
                let _ = caller_tx.send(resp);
                return;
            }
        }

        // 7. Resolve the dispatch target and gate shell commands.
        let target = match self.resolve_target(&ctx).await {
            Ok(target) => target,
            Err(resp) => {
                let resp = self.finalize(&ctx, resp).await;
                let _ = caller_tx.send(resp);
                return;
            }
        };

        // 8. Dispatch under the classified timeout.
        let timeout = command::timeout_for(&ctx.command.command, &self.opts.timeouts);
        let cmd = ctx.command.clone();
        let mut dispatch: Pin<Box<dyn Future<Output = Result<serde_json::Value, DispatchError>> + Send>> =
            match target {
                DispatchTarget::Server => {
                    let server = Arc::clone(&self.server);
                    Box::pin(async move { server.dispatch(&cmd).await })
                }
                DispatchTarget::Session(session) => {
                    Box::pin(async move { session.handle(cmd).await })
                }
            };

        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, dispatch.as_mut()).await {
                Ok(result) => Some(result),
                Err(_) => None,
            },
            None => Some(dispatch.as_mut().await),
        };

        match result {
            Some(result) => {
                self.record_breaker(&ctx, &result).await;
                let resp = self.response_from(&ctx, result);
                let resp = self.finalize(&ctx, resp).await;
                let _ = caller_tx.send(resp);
            }
            None => {
                // Timeout: the caller gets a timedOut response now; the
                // work is detached (never cancelled) and records its own
                // outcome when it finishes.
                if command::is_shell(&ctx.command.command) {
                    if let Some(session_id) = &ctx.command.session_id {
                        self.breaker.record_failure(session_id).await;
                    }
                }
                let elapsed = timeout.unwrap_or_default();
                let timed = CommandResponse::timed_out(
                    Some(ctx.command_id.clone()),
                    &ctx.command.command,
                    elapsed,
                );
                let _ = caller_tx.send(timed);

                debug!(
                    command_id = %ctx.command_id,
                    command = %ctx.command.command,
                    lane = %ctx.lane_key,
                    "command overran its timeout, detaching"
                );
                let engine = self.clone();
                tokio::spawn(async move {
                    let result = dispatch.await;
                    engine.record_breaker(&ctx, &result).await;
                    let resp = engine.response_from(&ctx, result);
                    let _ = engine.finalize(&ctx, resp).await;
                });
            }
        }
    }

    async fn resolve_target(&self, ctx: &CommandCtx) -> Result<DispatchTarget, CommandResponse> {
        let unknown_session = |session_id: &str| {
            CommandResponse::failure(
                None,
                &ctx.command.command,
                ErrorCode::UnknownSession,
                format!("unknown session '{session_id}'"),
            )
        };

        if command::is_server_command(&ctx.command.command) {
            if let Some(session_id) = &ctx.command.session_id {
                if self.resolver.resolve(session_id).await.is_none() {
                    return Err(unknown_session(session_id));
                }
            }
            return Ok(DispatchTarget::Server);
        }

        let Some(session_id) = &ctx.command.session_id else {
            return Err(CommandResponse::failure(
                None,
                &ctx.command.command,
                ErrorCode::ValidationError,
                format!("'{}' requires sessionId", ctx.command.command),
            ));
        };
        let Some(session) = self.resolver.resolve(session_id).await else {
            return Err(unknown_session(session_id));
        };

        if command::is_shell(&ctx.command.command) {
            if let Err(reason) = self.breaker.can_execute(session_id).await {
                return Err(CommandResponse::failure(
                    None,
                    &ctx.command.command,
                    ErrorCode::CircuitOpen,
                    format!("circuit open: {reason}"),
                ));
            }
        }

        Ok(DispatchTarget::Session(session))
    }

    async fn record_breaker(
        &self,
        ctx: &CommandCtx,
        result: &Result<serde_json::Value, DispatchError>,
    ) {
        if !command::is_shell(&ctx.command.command) {
            return;
        }
        let Some(session_id) = &ctx.command.session_id else {
            return;
        };
        match result {
            Ok(_) => self.breaker.record_success(session_id).await,
            Err(e) if e.spawn_failure => self.breaker.record_failure(session_id).await,
            Err(_) => {}
        }
    }

    fn response_from(
        &self,
        ctx: &CommandCtx,
        result: Result<serde_json::Value, DispatchError>,
    ) -> CommandResponse {
        match result {
            Ok(data) => CommandResponse::success(Some(ctx.command_id.clone()), &ctx.command.command)
                .with_data(data),
            Err(e) => CommandResponse::failure(
                Some(ctx.command_id.clone()),
                &ctx.command.command,
                e.code,
                e.message,
            ),
        }
    }

    /// Step 9: stamp the session version, record the outcome, publish
    /// the terminal response to awaiters, and leave the in-flight
    /// registry.
    async fn finalize(&self, ctx: &CommandCtx, mut response: CommandResponse) -> CommandResponse {
        response.id = Some(ctx.command_id.clone());
        let response = self.versions.apply(&ctx.command, response).await;

        let outcome = OutcomeRecord {
            command_id: ctx.command_id.clone(),
            command_type: ctx.command.command.clone(),
            lane_key: ctx.lane_key.clone(),
            fingerprint: ctx.fingerprint.clone(),
            success: response.success,
            error: response.error.clone(),
            response: response.clone(),
            session_version: response.session_version,
            finished_at: epoch_ms(),
        };
        self.replay.store_outcome(outcome).await;
        if ctx.command.idempotency_key.is_some() {
            self.replay.cache_idempotency(&ctx.command, &response).await;
        }

        let _ = ctx.watch_tx.send(Some(response.clone()));
        self.replay.unregister_in_flight(&ctx.command_id, ctx.epoch).await;
        response
    }
}

/// Await a terminal response on a watch channel. Returns `None` if the
/// sender was dropped before publishing one.
async fn wait_terminal(rx: &mut ResponseWatch) -> Option<CommandResponse> {
    loop {
        if let Some(resp) = rx.borrow_and_update().clone() {
            return Some(resp);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// Await an equivalent in-flight command and serve its response as a
/// replay.
async fn await_in_flight(mut rx: ResponseWatch, command: &CommandEnvelope) -> CommandResponse {
    match wait_terminal(&mut rx).await {
        Some(mut resp) => {
            resp.replayed = Some(true);
            resp.id = command.id.clone();
            resp
        }
        None => CommandResponse::failure(
            command.id.clone(),
            &command.command,
            ErrorCode::InternalError,
            "in-flight command was dropped before completing",
        ),
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
