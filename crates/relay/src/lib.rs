// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay: agent session multiplexer.
//!
//! One long-lived process accepts RPC command envelopes from many
//! WebSocket clients, serializes execution per session, deduplicates
//! retries, enforces optimistic-concurrency preconditions, and fans
//! session events back to subscribers. Long-running shell commands are
//! guarded by a hybrid per-session/global circuit breaker.

pub mod agent;
pub mod breaker;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod replay;
pub mod session;
pub mod transport;
pub mod version;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::LocalAgentFactory;
use crate::config::RelayConfig;
use crate::session::SessionManager;
use crate::transport::build_router;

/// Shared server state.
pub struct RelayState {
    pub manager: SessionManager,
    pub config: RelayConfig,
    pub shutdown: CancellationToken,
}

/// Run the relay server until shutdown.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let manager = SessionManager::new(config.manager_options(), Arc::new(LocalAgentFactory));
    manager.spawn_maintenance(shutdown.clone());

    let state = Arc::new(RelayState { manager, config, shutdown: shutdown.clone() });

    tracing::info!("relay listening on {addr}");
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    state.manager.shutdown().await;
    Ok(())
}
