// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Built-in local agent session.
//!
//! A deliberately small [`AgentSession`] used by the standalone binary
//! and the end-to-end tests: `prompt` keeps a transcript and answers
//! with a deterministic echo, `bash` runs `sh -c` via `tokio::process`,
//! and the read-mostly getters answer from the transcript. A non-zero
//! exit code is a legitimate result; only a failed spawn is surfaced as
//! a spawn error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};

use crate::command::CommandEnvelope;
use crate::events::SessionEvent;
use crate::replay::epoch_ms;
use crate::session::{AgentSession, BoxFuture, DispatchError, SessionFactory};

/// Builds a [`LocalAgent`] per `create_session`.
#[derive(Default)]
pub struct LocalAgentFactory;

impl SessionFactory for LocalAgentFactory {
    fn create<'a>(
        &'a self,
        session_id: &'a str,
        _command: &'a CommandEnvelope,
    ) -> BoxFuture<'a, Result<Arc<dyn AgentSession>, DispatchError>> {
        Box::pin(async move { Ok(Arc::new(LocalAgent::new(session_id)) as Arc<dyn AgentSession>) })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptMessage {
    id: String,
    role: String,
    text: String,
    at: u64,
}

pub struct LocalAgent {
    session_id: String,
    created_at: u64,
    messages: Mutex<Vec<TranscriptMessage>>,
    event_tx: broadcast::Sender<SessionEvent>,
    disposed: AtomicBool,
    message_seq: AtomicU64,
}

impl LocalAgent {
    pub fn new(session_id: &str) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            session_id: session_id.to_owned(),
            created_at: epoch_ms(),
            messages: Mutex::new(Vec::new()),
            event_tx,
            disposed: AtomicBool::new(false),
            message_seq: AtomicU64::new(0),
        }
    }

    fn next_message_id(&self) -> String {
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{seq}", self.session_id)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn append(&self, role: &str, text: &str) -> String {
        let id = self.next_message_id();
        let message = TranscriptMessage {
            id: id.clone(),
            role: role.to_owned(),
            text: text.to_owned(),
            at: epoch_ms(),
        };
        self.messages.lock().await.push(message);
        self.emit(SessionEvent::Message {
            role: role.to_owned(),
            text: text.to_owned(),
            id: Some(id.clone()),
        });
        id
    }

    async fn prompt(&self, command: &CommandEnvelope) -> Result<serde_json::Value, DispatchError> {
        let message = command
            .payload_str("message")
            .ok_or_else(|| DispatchError::validation("prompt requires 'message'"))?
            .to_owned();

        self.emit(SessionEvent::State { state: "busy".to_owned() });
        self.append("user", &message).await;
        let reply = format!("echo: {message}");
        let reply_id = self.append("assistant", &reply).await;
        self.emit(SessionEvent::State { state: "idle".to_owned() });

        Ok(json!({ "messageId": reply_id, "reply": reply }))
    }

    async fn bash(&self, command: &CommandEnvelope) -> Result<serde_json::Value, DispatchError> {
        let shell_command = command
            .payload_str("command")
            .ok_or_else(|| DispatchError::validation("bash requires 'command'"))?
            .to_owned();

        self.emit(SessionEvent::State { state: "busy".to_owned() });
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&shell_command)
            .output()
            .await;
        self.emit(SessionEvent::State { state: "idle".to_owned() });

        let output = output.map_err(|e| DispatchError::spawn(format!("failed to spawn shell: {e}")))?;
        Ok(json!({
            "exitCode": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }

    async fn get_messages(&self) -> serde_json::Value {
        let messages = self.messages.lock().await;
        json!({ "messages": &*messages })
    }

    async fn get_fork_messages(&self, command: &CommandEnvelope) -> serde_json::Value {
        let messages = self.messages.lock().await;
        let upto = command
            .payload
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).min(messages.len()))
            .unwrap_or(messages.len());
        json!({ "messages": &messages[..upto] })
    }

    async fn get_last_assistant_text(&self) -> serde_json::Value {
        let messages = self.messages.lock().await;
        let text = messages.iter().rev().find(|m| m.role == "assistant").map(|m| m.text.clone());
        json!({ "text": text })
    }

    async fn get_context_usage(&self) -> serde_json::Value {
        let messages = self.messages.lock().await;
        let chars: usize = messages.iter().map(|m| m.text.len()).sum();
        json!({
            "messages": messages.len(),
            // Rough heuristic: four characters per token.
            "tokens": chars / 4,
        })
    }

    async fn get_session_stats(&self) -> serde_json::Value {
        json!({
            "sessionId": self.session_id,
            "createdAt": self.created_at,
            "uptimeMs": epoch_ms().saturating_sub(self.created_at),
            "messageCount": self.messages.lock().await.len(),
        })
    }
}

impl AgentSession for LocalAgent {
    fn handle(
        &self,
        command: CommandEnvelope,
    ) -> BoxFuture<'_, Result<serde_json::Value, DispatchError>> {
        Box::pin(async move {
            if self.disposed.load(Ordering::Acquire) {
                return Err(DispatchError::internal("session is disposed"));
            }
            match command.command.as_str() {
                "prompt" => self.prompt(&command).await,
                "bash" => self.bash(&command).await,
                "get_state" => Ok(json!({
                    "state": "idle",
                    "messageCount": self.messages.lock().await.len(),
                })),
                "get_messages" => Ok(self.get_messages().await),
                "get_fork_messages" => Ok(self.get_fork_messages(&command).await),
                "get_last_assistant_text" => Ok(self.get_last_assistant_text().await),
                "get_context_usage" => Ok(self.get_context_usage().await),
                "get_session_stats" => Ok(self.get_session_stats().await),
                "get_available_models" => Ok(json!({ "models": ["local-echo"] })),
                "get_commands" => Ok(json!({ "commands": [] })),
                "get_skills" => Ok(json!({ "skills": [] })),
                "get_tools" => Ok(json!({ "tools": [] })),
                "list_session_files" => Ok(json!({ "files": [] })),
                "extension_ui_response" => {
                    // The local agent never raises UI requests.
                    Err(DispatchError::validation("no ui request handler"))
                }
                other => Err(DispatchError::internal(format!(
                    "local agent does not implement '{other}'"
                ))),
            }
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disposed.store(true, Ordering::Release);
        })
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
