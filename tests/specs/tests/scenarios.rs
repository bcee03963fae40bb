// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests driving the relay over a real WebSocket.

use std::time::{Duration, Instant};

use serde_json::json;

use relay::command::TimeoutPolicy;
use relay::engine::EngineOptions;
use relay::session::ManagerOptions;
use relay_specs::{create_session, RelayServer};

// -- Replay and conflicts ------------------------------------------------------

#[tokio::test]
async fn replay_after_success() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;

    let first = client.request(json!({ "id": "c1", "type": "list_sessions" })).await?;
    assert_eq!(first["success"], true);
    assert!(first.get("replayed").is_none());

    let second = client.request(json!({ "id": "c1", "type": "list_sessions" })).await?;
    assert_eq!(second["success"], true);
    assert_eq!(second["replayed"], true);
    assert_eq!(second["data"], first["data"]);
    Ok(())
}

#[tokio::test]
async fn conflicting_id_reuse() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;

    let first = client.request(json!({ "id": "c2", "type": "list_sessions" })).await?;
    assert_eq!(first["success"], true);

    let second = client.request(json!({ "id": "c2", "type": "get_metrics" })).await?;
    assert_eq!(second["success"], false);
    assert_eq!(
        second["error"],
        "Conflicting id 'c2': previously used for 'list_sessions', now used for 'get_metrics'"
    );
    Ok(())
}

#[tokio::test]
async fn idempotency_key_replays_across_ids() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let session = create_session(&mut client, "idem").await?;

    let first = client
        .request(json!({
            "id": "k1", "type": "prompt", "sessionId": session,
            "message": "only once", "idempotencyKey": "once",
        }))
        .await?;
    assert_eq!(first["success"], true);
    assert_eq!(first["sessionVersion"], 1);

    let second = client
        .request(json!({
            "id": "k2", "type": "prompt", "sessionId": session,
            "message": "only once", "idempotencyKey": "once",
        }))
        .await?;
    assert_eq!(second["success"], true);
    assert_eq!(second["replayed"], true);
    assert_eq!(second["id"], "k2");
    // The cached response was served; the session version did not move.
    assert_eq!(second["sessionVersion"], 1);
    Ok(())
}

// -- Versions ------------------------------------------------------------------

#[tokio::test]
async fn version_precondition() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let session = create_session(&mut client, "versioned").await?;

    let first = client
        .request(json!({
            "id": "p1", "type": "prompt", "sessionId": session,
            "message": "hi", "ifSessionVersion": 0,
        }))
        .await?;
    assert_eq!(first["success"], true);
    assert_eq!(first["sessionVersion"], 1);

    let second = client
        .request(json!({
            "id": "p2", "type": "prompt", "sessionId": session,
            "message": "hi", "ifSessionVersion": 0,
        }))
        .await?;
    assert_eq!(second["success"], false);
    assert_eq!(second["code"], "version_conflict");
    assert_eq!(second["data"]["actualVersion"], 1);
    Ok(())
}

// -- Dependencies --------------------------------------------------------------

#[tokio::test]
async fn dependent_command_waits_for_other_lane() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let s1 = create_session(&mut client, "s1").await?;
    let s2 = create_session(&mut client, "s2").await?;

    let started = Instant::now();
    client
        .send(json!({
            "id": "a", "type": "bash", "sessionId": s1, "command": "sleep 0.3",
        }))
        .await?;
    client
        .send(json!({
            "id": "b", "type": "prompt", "sessionId": s2,
            "message": "after a", "dependsOn": ["a"],
        }))
        .await?;

    let b = client.response_for("b").await?;
    assert_eq!(b["success"], true);
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "b completed before its dependency could have finished"
    );
    Ok(())
}

#[tokio::test]
async fn same_lane_dependency_is_rejected() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let s1 = create_session(&mut client, "s1").await?;

    client
        .send(json!({
            "id": "a", "type": "bash", "sessionId": s1, "command": "sleep 0.3",
        }))
        .await?;
    client
        .send(json!({
            "id": "b", "type": "prompt", "sessionId": s1,
            "message": "doomed", "dependsOn": ["a"],
        }))
        .await?;

    let b = client.response_for("b").await?;
    assert_eq!(b["success"], false);
    assert_eq!(b["code"], "dependency_same_lane");
    Ok(())
}

// -- Circuit breaker -----------------------------------------------------------

#[tokio::test]
async fn repeated_bash_timeouts_open_the_circuit() -> anyhow::Result<()> {
    let opts = ManagerOptions {
        engine: EngineOptions {
            timeouts: TimeoutPolicy {
                default_timeout: Duration::from_millis(50),
                ..TimeoutPolicy::default()
            },
            ..EngineOptions::default()
        },
        ..ManagerOptions::default()
    };
    let server = RelayServer::start_with(opts).await?;
    let mut client = server.connect().await?;
    let session = create_session(&mut client, "shell").await?;

    for i in 0..10 {
        let resp = client
            .request(json!({
                "id": format!("slow{i}"), "type": "bash",
                "sessionId": session, "command": "sleep 1",
            }))
            .await?;
        assert_eq!(resp["success"], false, "bash {i} should time out: {resp}");
        assert_eq!(resp["timedOut"], true);
    }

    let resp = client
        .request(json!({
            "id": "gated", "type": "bash", "sessionId": session, "command": "sleep 1",
        }))
        .await?;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "circuit_open");
    assert!(
        resp["error"].as_str().is_some_and(|e| e.contains("session")),
        "reason should name the session breaker: {resp}"
    );
    Ok(())
}

// -- Events and subscriptions --------------------------------------------------

#[tokio::test]
async fn prompt_events_reach_the_creator() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    // Subscribe to nothing up front; creating a session auto-subscribes.
    let mut client =
        relay_specs::WsClient::connect(&format!("{}?sessions=", server.ws_url())).await?;
    let session = create_session(&mut client, "chatty").await?;

    client
        .send(json!({
            "id": "p", "type": "prompt", "sessionId": session, "message": "ping",
        }))
        .await?;

    let mut saw_assistant = false;
    for _ in 0..8 {
        let frame = client.next_frame().await?;
        if frame["type"] == "event"
            && frame["sessionId"] == session.as_str()
            && frame["event"]["type"] == "message"
            && frame["event"]["role"] == "assistant"
        {
            saw_assistant = true;
            break;
        }
    }
    assert!(saw_assistant, "assistant message event never arrived");
    Ok(())
}

#[tokio::test]
async fn switch_session_repoints_the_subscription() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut owner = server.connect().await?;
    let session = create_session(&mut owner, "shared").await?;

    let mut watcher =
        relay_specs::WsClient::connect(&format!("{}?sessions=", server.ws_url())).await?;
    let resp = watcher
        .request(json!({ "type": "switch_session", "sessionId": session }))
        .await?;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["data"]["sessionId"], session.as_str());
    // Read-only: the version did not advance.
    assert_eq!(resp["sessionVersion"], 0);

    owner
        .send(json!({
            "id": "p", "type": "prompt", "sessionId": session, "message": "to watcher",
        }))
        .await?;

    let event = watcher.next_event().await?;
    assert_eq!(event["sessionId"], session.as_str());
    Ok(())
}

#[tokio::test]
async fn delete_session_notifies_and_forgets() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let session = create_session(&mut client, "temp").await?;

    let resp = client
        .request(json!({ "id": "d", "type": "delete_session", "sessionId": session }))
        .await?;
    assert_eq!(resp["success"], true);
    assert!(resp.get("sessionVersion").is_none(), "delete stamps no version");

    let resp = client
        .request(json!({ "type": "prompt", "sessionId": session, "message": "ghost" }))
        .await?;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "unknown_session");
    Ok(())
}

#[tokio::test]
async fn bash_exit_codes_are_results() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;
    let session = create_session(&mut client, "sh").await?;

    let resp = client
        .request(json!({
            "type": "bash", "sessionId": session, "command": "printf spec-ok; exit 3",
        }))
        .await?;
    assert_eq!(resp["success"], true, "non-zero exit is still a result: {resp}");
    assert_eq!(resp["data"]["exitCode"], 3);
    assert_eq!(resp["data"]["stdout"], "spec-ok");
    Ok(())
}

#[tokio::test]
async fn reserved_ids_and_unknown_commands_are_rejected() -> anyhow::Result<()> {
    let server = RelayServer::start().await?;
    let mut client = server.connect().await?;

    let resp = client.request(json!({ "id": "anon:1:1", "type": "list_sessions" })).await?;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "validation_error");

    let resp = client.request(json!({ "id": "x", "type": "frobnicate" })).await?;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["code"], "unknown_command");
    Ok(())
}
