// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end relay tests.
//!
//! Starts an in-process relay server on an ephemeral port and drives it
//! over a real WebSocket, the way production clients do.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use relay::agent::LocalAgentFactory;
use relay::config::RelayConfig;
use relay::session::{ManagerOptions, SessionManager};
use relay::transport::build_router;
use relay::RelayState;

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process relay server bound to an ephemeral port.
pub struct RelayServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(ManagerOptions::default()).await
    }

    pub async fn start_with(opts: ManagerOptions) -> anyhow::Result<Self> {
        let config = RelayConfig::parse_from(["relay"]);
        let manager = SessionManager::new(opts, Arc::new(LocalAgentFactory));
        let shutdown = CancellationToken::new();
        let state = Arc::new(RelayState { manager, config, shutdown: shutdown.clone() });

        let router = build_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await;
        });

        Ok(Self { addr, shutdown })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> anyhow::Result<WsClient> {
        WsClient::connect(&self.ws_url()).await
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A WebSocket client speaking the relay wire protocol.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { stream })
    }

    /// Send one command envelope.
    pub async fn send(&mut self, command: serde_json::Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(command.to_string().into())).await?;
        Ok(())
    }

    /// Next JSON frame of any kind.
    pub async fn next_frame(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(FRAME_TIMEOUT, self.stream.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
            if let Message::Text(text) = msg {
                return Ok(serde_json::from_str(&text)?);
            }
        }
    }

    /// Next response frame, skipping interleaved events.
    pub async fn next_response(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame["type"] == "response" {
                return Ok(frame);
            }
        }
    }

    /// Next response carrying the given command id.
    pub async fn response_for(&mut self, id: &str) -> anyhow::Result<serde_json::Value> {
        loop {
            let frame = self.next_response().await?;
            if frame["id"] == id {
                return Ok(frame);
            }
        }
    }

    /// Next event frame, skipping responses.
    pub async fn next_event(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame["type"] == "event" {
                return Ok(frame);
            }
        }
    }

    /// Send a command and await the next response.
    pub async fn request(&mut self, command: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.send(command).await?;
        self.next_response().await
    }
}

/// Create a session and return its id.
pub async fn create_session(client: &mut WsClient, name: &str) -> anyhow::Result<String> {
    let resp = client
        .request(serde_json::json!({ "type": "create_session", "name": name }))
        .await?;
    anyhow::ensure!(resp["success"] == true, "create_session failed: {resp}");
    resp["data"]["sessionId"]
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow::anyhow!("create_session response missing sessionId: {resp}"))
}
