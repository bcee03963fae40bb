// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn parse(json: &str) -> CommandEnvelope {
    match serde_json::from_str(json) {
        Ok(cmd) => cmd,
        Err(e) => unreachable!("envelope should parse: {e}"),
    }
}

#[test]
fn envelope_parses_camel_case_fields() {
    let cmd = parse(
        r#"{"id":"c1","type":"prompt","sessionId":"s1","dependsOn":["a"],
            "ifSessionVersion":3,"idempotencyKey":"k","message":"hi"}"#,
    );
    assert_eq!(cmd.id.as_deref(), Some("c1"));
    assert_eq!(cmd.command, "prompt");
    assert_eq!(cmd.session_id.as_deref(), Some("s1"));
    assert_eq!(cmd.depends_on.as_deref(), Some(&["a".to_owned()][..]));
    assert_eq!(cmd.if_session_version, Some(3));
    assert_eq!(cmd.idempotency_key.as_deref(), Some("k"));
    assert_eq!(cmd.payload_str("message"), Some("hi"));
}

#[test]
fn envelope_payload_is_opaque() {
    let cmd = parse(r#"{"type":"bash","sessionId":"s","command":"ls","cwd":"/tmp"}"#);
    assert_eq!(cmd.payload_str("command"), Some("ls"));
    assert_eq!(cmd.payload_str("cwd"), Some("/tmp"));
    assert_eq!(cmd.payload_str("missing"), None);
}

#[test]
fn lane_key_routes_by_session() {
    let mut cmd = CommandEnvelope::new("prompt");
    cmd.session_id = Some("s1".to_owned());
    assert_eq!(cmd.lane_key(), "session:s1");

    let server = CommandEnvelope::new("list_sessions");
    assert_eq!(server.lane_key(), SERVER_LANE);
}

#[test]
fn response_serializes_camel_case() -> anyhow::Result<()> {
    let mut resp = CommandResponse::success(Some("c1".to_owned()), "prompt");
    resp.session_version = Some(2);
    resp.timed_out = Some(true);
    let json = serde_json::to_value(&resp)?;
    assert_eq!(json["sessionVersion"], 2);
    assert_eq!(json["timedOut"], true);
    assert!(json.get("replayed").is_none());
    Ok(())
}

#[test]
fn short_timeout_set() {
    for cmd in [
        "get_state",
        "get_messages",
        "get_available_models",
        "get_commands",
        "get_skills",
        "get_tools",
        "list_session_files",
        "get_session_stats",
        "get_fork_messages",
        "get_last_assistant_text",
        "get_context_usage",
        "set_session_name",
    ] {
        assert!(is_short_timeout(cmd), "{cmd} should be short-timeout");
    }
    assert!(!is_short_timeout("prompt"));
    assert!(!is_short_timeout("switch_session"));
}

#[test]
fn create_session_is_uncancellable() {
    assert!(!is_cancellable("create_session"));
    let policy = TimeoutPolicy::default();
    assert_eq!(timeout_for("create_session", &policy), None);
}

#[test]
fn timeout_buckets() {
    let policy = TimeoutPolicy {
        default_timeout: Duration::from_secs(10),
        short_timeout: Duration::from_secs(1),
    };
    assert_eq!(timeout_for("get_state", &policy), Some(Duration::from_secs(1)));
    assert_eq!(timeout_for("prompt", &policy), Some(Duration::from_secs(10)));
    assert_eq!(timeout_for("bash", &policy), Some(Duration::from_secs(10)));
    // Unknown commands fall into the default bucket.
    assert_eq!(timeout_for("does_not_exist", &policy), Some(Duration::from_secs(10)));
}

#[test]
fn mutation_classification() {
    // Read-only: short set minus set_session_name, plus switch_session.
    assert!(is_read_only("get_state"));
    assert!(is_read_only("switch_session"));
    assert!(!is_read_only("set_session_name"));
    assert!(is_mutation("set_session_name"));

    // extension_ui_response is neither mutating nor read-only.
    assert!(is_special("extension_ui_response"));
    assert!(!is_mutation("extension_ui_response"));
    assert!(!is_read_only("extension_ui_response"));

    // Mutations are the safe default, including unknown types.
    assert!(is_mutation("prompt"));
    assert!(is_mutation("bash"));
    assert!(is_mutation("totally_unknown"));
}

#[test]
fn server_and_session_requirements() {
    assert!(is_server_command("delete_session"));
    assert!(requires_session("delete_session"));
    assert!(requires_session("switch_session"));
    assert!(!requires_session("create_session"));
    assert!(!requires_session("health_check"));
    assert!(requires_session("prompt"));
}

#[test]
fn known_command_surface() {
    for cmd in ["prompt", "bash", "extension_ui_response", "health_check", "get_fork_messages"] {
        assert!(is_known_command(cmd), "{cmd} should be known");
    }
    assert!(!is_known_command("explode"));
}

#[test]
fn timed_out_response_shape() {
    let resp = CommandResponse::timed_out(Some("x".to_owned()), "bash", Duration::from_millis(250));
    assert!(!resp.success);
    assert_eq!(resp.timed_out, Some(true));
    assert_eq!(resp.code, Some(crate::error::ErrorCode::Timeout));
    assert_eq!(resp.error.as_deref(), Some("command timed out after 250ms"));
}
