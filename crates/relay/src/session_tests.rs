// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::agent::LocalAgentFactory;
use crate::events::EventFrame;

fn manager() -> SessionManager {
    SessionManager::new(ManagerOptions::default(), Arc::new(LocalAgentFactory))
}

fn cmd(command: &str) -> CommandEnvelope {
    CommandEnvelope::new(command)
}

fn session_cmd(command: &str, session_id: &str) -> CommandEnvelope {
    let mut c = cmd(command);
    c.session_id = Some(session_id.to_owned());
    c
}

async fn create_session(manager: &SessionManager, name: &str) -> String {
    let mut create = cmd("create_session");
    create.payload.insert("name".to_owned(), json!(name));
    let resp = manager.execute(create).await;
    assert!(resp.success, "create_session failed: {:?}", resp.error);
    assert_eq!(resp.session_version, Some(0));
    match resp.data.as_ref().and_then(|d| d["sessionId"].as_str()) {
        Some(id) => id.to_owned(),
        None => unreachable!("create_session response missing sessionId"),
    }
}

#[tokio::test]
async fn create_list_delete_lifecycle() {
    let manager = manager();
    let id = create_session(&manager, "alpha").await;
    assert_eq!(manager.session_count().await, 1);

    let resp = manager.execute(cmd("list_sessions")).await;
    assert!(resp.success);
    let sessions = resp.data.as_ref().and_then(|d| d["sessions"].as_array()).cloned();
    let sessions = sessions.unwrap_or_default();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], json!(id));
    assert_eq!(sessions[0]["name"], json!("alpha"));
    assert_eq!(sessions[0]["version"], json!(0));

    let resp = manager.execute(session_cmd("delete_session", &id)).await;
    assert!(resp.success);
    assert_eq!(manager.session_count().await, 0);

    // The session is gone for every follow-up command.
    let mut prompt = session_cmd("prompt", &id);
    prompt.payload.insert("message".to_owned(), json!("hi"));
    let resp = manager.execute(prompt).await;
    assert_eq!(resp.code, Some(crate::error::ErrorCode::UnknownSession));
}

#[tokio::test]
async fn prompt_advances_version_and_fans_out_events() {
    let manager = manager();
    let hub = manager.hub();
    let (_sub, mut rx) = hub.add(None).await;

    let id = create_session(&manager, "chat").await;

    let mut prompt = session_cmd("prompt", &id);
    prompt.payload.insert("message".to_owned(), json!("hello there"));
    let resp = manager.execute(prompt).await;
    assert!(resp.success);
    assert_eq!(resp.session_version, Some(1));
    let reply = resp.data.as_ref().and_then(|d| d["reply"].as_str()).map(ToOwned::to_owned);
    assert_eq!(reply.as_deref(), Some("echo: hello there"));

    // The transcript events reach subscribers, tagged with the session.
    let mut saw_user = false;
    let mut saw_assistant = false;
    for _ in 0..8 {
        let Some(EventFrame { session_id, event }) = rx.recv().await else {
            break;
        };
        assert_eq!(session_id, id);
        if let SessionEvent::Message { role, .. } = event {
            match role.as_str() {
                "user" => saw_user = true,
                "assistant" => saw_assistant = true,
                _ => {}
            }
        }
        if saw_user && saw_assistant {
            break;
        }
    }
    assert!(saw_user && saw_assistant, "transcript events never arrived");
}

#[tokio::test]
async fn set_session_name_is_a_short_timeout_mutation() {
    let manager = manager();
    let id = create_session(&manager, "before").await;

    let mut rename = session_cmd("set_session_name", &id);
    rename.payload.insert("name".to_owned(), json!("after"));
    let resp = manager.execute(rename).await;
    assert!(resp.success);
    assert_eq!(resp.session_version, Some(1), "rename must advance the version");

    let resp = manager.execute(session_cmd("switch_session", &id)).await;
    assert!(resp.success);
    assert_eq!(resp.data.as_ref().map(|d| d["name"].clone()), Some(json!("after")));
    // switch_session is read-only.
    assert_eq!(resp.session_version, Some(1));
}

#[tokio::test]
async fn switch_session_unknown_target() {
    let manager = manager();
    let resp = manager.execute(session_cmd("switch_session", "nope")).await;
    assert_eq!(resp.code, Some(crate::error::ErrorCode::UnknownSession));
}

#[tokio::test]
async fn delete_broadcasts_disposal_and_scrubs_subscriptions() {
    let manager = manager();
    let id = create_session(&manager, "doomed").await;

    let hub = manager.hub();
    let (sub, mut rx) = hub.add(Some(std::collections::HashSet::new())).await;
    hub.subscribe_session(sub, &id).await;

    let resp = manager.execute(session_cmd("delete_session", &id)).await;
    assert!(resp.success);

    let frame = rx.recv().await;
    assert!(
        frame.is_some_and(|f| matches!(f.event, SessionEvent::Disposed)),
        "subscriber should see the disposal event"
    );
}

#[tokio::test]
async fn ui_response_without_pending_request_is_rejected() {
    let manager = manager();
    let id = create_session(&manager, "ui").await;

    let mut resp_cmd = session_cmd("extension_ui_response", &id);
    resp_cmd.payload.insert("requestId".to_owned(), json!("r-1"));
    let resp = manager.execute(resp_cmd).await;
    assert!(!resp.success);
    assert_eq!(resp.code, Some(crate::error::ErrorCode::ValidationError));
    // Neither mutating nor read-only: the version is untouched even on
    // the failure path.
    let resp = manager.execute(session_cmd("get_state", &id)).await;
    assert_eq!(resp.session_version, Some(0));
}

#[tokio::test]
async fn health_check_and_metrics_report_state() {
    let manager = manager();
    let _id = create_session(&manager, "m").await;

    let resp = manager.execute(cmd("health_check")).await;
    assert!(resp.success);
    let data = resp.data.unwrap_or_default();
    assert_eq!(data["status"], "running");
    assert_eq!(data["sessions"], 1);

    let resp = manager.execute(cmd("get_metrics")).await;
    assert!(resp.success);
    let data = resp.data.unwrap_or_default();
    assert_eq!(data["sessions"], 1);
    assert_eq!(data["breaker"]["globalState"], "closed");
    assert!(data["commands"]["outcomes"].as_u64().is_some_and(|n| n >= 1));
}

#[tokio::test]
async fn shutdown_disposes_all_sessions() {
    let manager = manager();
    create_session(&manager, "a").await;
    create_session(&manager, "b").await;
    assert_eq!(manager.session_count().await, 2);

    manager.shutdown().await;
    assert_eq!(manager.session_count().await, 0);
}

#[tokio::test]
async fn dispatch_errors_surface_as_failed_responses() {
    let manager = manager();
    let id = create_session(&manager, "x").await;

    // Missing required payload.
    let resp = manager.execute(session_cmd("prompt", &id)).await;
    assert!(!resp.success);
    assert_eq!(resp.code, Some(crate::error::ErrorCode::ValidationError));
    assert_eq!(resp.error.as_deref(), Some("prompt requires 'message'"));
}
