// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session event types and the subscriber fan-out hub.
//!
//! Sessions publish events on their own broadcast stream; the manager
//! forwards them into the hub, which delivers to every subscriber whose
//! subscription set matches. One subscriber failing or falling behind
//! never affects the others — closed subscribers are pruned on send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::command::CommandResponse;

/// Events emitted by an agent session, tagged for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// A transcript message was appended.
    Message {
        role: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The session's agent state changed.
    State { state: String },
    /// The session asks a client to answer a UI request.
    UiRequest {
        request_id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// A pending UI request was cancelled (session deleted or agent
    /// moved on).
    UiCancelled { request_id: String },
    /// The session was disposed.
    Disposed,
}

/// An event bound for subscribers, tagged with its source session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub session_id: String,
    pub event: SessionEvent,
}

/// Outbound wire frame: a command response or a session event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response(CommandResponse),
    Event(EventFrame),
}

// -- Subscriber hub ------------------------------------------------------------

pub type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::UnboundedSender<EventFrame>,
    /// `None` subscribes to every session.
    sessions: Option<HashSet<String>>,
}

/// Fan-out hub: subscribers register a channel plus a session filter and
/// receive matching [`EventFrame`]s.
#[derive(Default)]
pub struct SubscriberHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. `sessions: None` means all sessions.
    pub async fn add(
        &self,
        sessions: Option<HashSet<String>>,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<EventFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.insert(id, Subscriber { tx, sessions });
        (id, rx)
    }

    pub async fn remove(&self, id: SubscriberId) {
        self.subscribers.lock().await.remove(&id);
    }

    /// Replace a subscriber's session filter.
    pub async fn set_sessions(&self, id: SubscriberId, sessions: Option<HashSet<String>>) {
        if let Some(sub) = self.subscribers.lock().await.get_mut(&id) {
            sub.sessions = sessions;
        }
    }

    /// Add one session to a subscriber's filter. A subscriber watching
    /// all sessions stays that way.
    pub async fn subscribe_session(&self, id: SubscriberId, session_id: &str) {
        if let Some(sub) = self.subscribers.lock().await.get_mut(&id) {
            if let Some(sessions) = &mut sub.sessions {
                sessions.insert(session_id.to_owned());
            }
        }
    }

    /// Remove a deleted session from every subscriber's filter.
    pub async fn scrub_session(&self, session_id: &str) {
        let mut subscribers = self.subscribers.lock().await;
        for sub in subscribers.values_mut() {
            if let Some(sessions) = &mut sub.sessions {
                sessions.remove(session_id);
            }
        }
    }

    /// Deliver an event to every matching subscriber. Send failures are
    /// swallowed; the failed subscriber is pruned.
    pub async fn broadcast(&self, session_id: &str, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter() {
            let wants = match &sub.sessions {
                None => true,
                Some(sessions) => sessions.contains(session_id),
            };
            if !wants {
                continue;
            }
            let frame =
                EventFrame { session_id: session_id.to_owned(), event: event.clone() };
            if sub.tx.send(frame).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
