//! RPC command plane: envelopes, state queries, session commands, and
//! event fan-out.

mod common;

use common::{build_agent, tool_call, Script, ScriptedProvider};
use plover::model::Message;
use plover::rpc::{self, SessionEvent, SessionHost};
use plover::session::{Session, SessionEntry};
use plover::ui_bridge::UiBridge;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn build_host(session: Session, script: Vec<Script>) -> (Arc<SessionHost>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(script);
    let agent = build_agent(session, provider, dir.path(), vec![]);

    let (events_tx, _) = tokio::sync::broadcast::channel::<SessionEvent>(256);
    let ui_events = events_tx.clone();
    let ui = Arc::new(UiBridge::new(move |request| {
        let _ = ui_events.send(SessionEvent::UiRequest(request));
    }));
    let host = Arc::new(SessionHost::new(
        agent,
        ui,
        events_tx,
        dir.path().join("sessions"),
    ));
    (host, dir)
}

async fn wait_idle(host: &Arc<SessionHost>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !host.agent.flags().is_streaming() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never went idle"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unknown_command_fails_cleanly() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    let response = rpc::dispatch(&host, &json!({ "type": "time_travel", "id": "1" })).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["id"], "1");
    assert!(response["error"].as_str().unwrap().contains("time_travel"));
}

#[tokio::test]
async fn missing_type_fails_cleanly() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    let response = rpc::dispatch(&host, &json!({ "message": "hi" })).await;
    assert_eq!(response["success"], false);
}

#[tokio::test]
async fn get_state_is_idempotent_until_mutation() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);

    let first = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    let second = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    assert_eq!(first, second);
    assert_eq!(first["data"]["isStreaming"], false);
    assert_eq!(first["data"]["messageCount"], 0);

    // A mutating command changes the observed state.
    rpc::dispatch(
        &host,
        &json!({ "type": "set_thinking_level", "level": "high" }),
    )
    .await;
    let third = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    assert_eq!(third["data"]["thinkingLevel"], "high");
    assert_ne!(first, third);
}

#[tokio::test]
async fn prompt_acks_then_streams_to_completion() {
    let (host, _dir) = build_host(
        Session::in_memory(),
        vec![Script::Text("hello back".to_string())],
    );
    let mut events = host.subscribe();

    let response = rpc::dispatch(&host, &json!({ "type": "prompt", "message": "hi", "id": "p1" })).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["id"], "p1");

    // Events arrive on the plane until agent_end.
    let mut saw_agent_end = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !saw_agent_end {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("event plane stalled")
            .expect("event plane closed");
        if let SessionEvent::Agent(agent_event) = &event {
            let value = serde_json::to_value(agent_event).unwrap();
            if value["type"] == "agent_end" {
                saw_agent_end = true;
            }
        }
    }

    wait_idle(&host).await;
    let state = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    assert_eq!(state["data"]["isStreaming"], false);

    let messages = rpc::dispatch(&host, &json!({ "type": "get_messages" })).await;
    let listed = messages["data"]["messages"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["role"], "user");
    assert_eq!(listed[1]["role"], "assistant");
}

#[tokio::test]
async fn sse_fan_out_order_and_subscriber_isolation() {
    let (host, _dir) = build_host(
        Session::in_memory(),
        vec![Script::ToolCalls(vec![tool_call(
            "c1",
            "bash",
            json!({"command": "echo fanout"}),
        )]), Script::Text("done".to_string())],
    );

    let collect = |mut rx: tokio::sync::broadcast::Receiver<SessionEvent>, die_after: Option<usize>| {
        tokio::spawn(async move {
            let mut names = Vec::new();
            loop {
                match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                    Ok(Ok(SessionEvent::Agent(event))) => {
                        let value = serde_json::to_value(&event).unwrap();
                        let name = value["type"].as_str().unwrap().to_string();
                        let end = name == "agent_end";
                        names.push(name);
                        if end {
                            break;
                        }
                        if die_after.is_some_and(|n| names.len() >= n) {
                            break; // simulated subscriber death
                        }
                    }
                    Ok(Ok(_)) => {}
                    _ => break,
                }
            }
            names
        })
    };

    let full_a = collect(host.subscribe(), None);
    let full_b = collect(host.subscribe(), None);
    let dying = collect(host.subscribe(), Some(3));

    rpc::dispatch(&host, &json!({ "type": "prompt", "message": "go" })).await;

    let a = full_a.await.unwrap();
    let b = full_b.await.unwrap();
    let dead = dying.await.unwrap();

    // Both live subscribers observed the identical ordered sequence; the
    // dead subscriber's exit did not disturb them.
    assert_eq!(a, b);
    assert!(a.len() > dead.len());
    assert_eq!(a.last().map(String::as_str), Some("agent_end"));
    wait_idle(&host).await;
}

#[tokio::test]
async fn fork_preserves_source_session() {
    let mut session = Session::in_memory();
    let _a = session.append_message(Message::user_text("a")).unwrap();
    let b = session.append_message(Message::user_text("b")).unwrap();
    let _c = session.append_message(Message::user_text("c")).unwrap();
    let d = session.append_message(Message::user_text("d")).unwrap();
    let source_id = session.header.id.clone();

    let (host, _dir) = build_host(session, vec![]);

    let forked = rpc::dispatch(&host, &json!({ "type": "fork", "entryId": b })).await;
    assert_eq!(forked["success"], true);
    assert_eq!(forked["data"]["leafId"], json!(b));
    assert_ne!(forked["data"]["sessionId"], json!(source_id));

    // The host now points at the fork: two entries, leaf at b.
    let session = host.agent.session();
    let session = session.lock().await;
    assert_eq!(session.entries().len(), 2);
    assert_eq!(session.leaf_id.as_deref(), Some(b.as_str()));
    assert_ne!(session.leaf_id.as_deref(), Some(d.as_str()));
}

#[tokio::test]
async fn get_fork_messages_returns_prefix() {
    let mut session = Session::in_memory();
    session.append_message(Message::user_text("one")).unwrap();
    let two = session.append_message(Message::user_text("two")).unwrap();
    session.append_message(Message::user_text("three")).unwrap();

    let (host, _dir) = build_host(session, vec![]);
    let response =
        rpc::dispatch(&host, &json!({ "type": "get_fork_messages", "entryId": two })).await;
    let messages = response["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);

    let missing =
        rpc::dispatch(&host, &json!({ "type": "get_fork_messages", "entryId": "zzz" })).await;
    assert_eq!(missing["success"], false);
}

#[tokio::test]
async fn bash_command_runs_and_is_recorded() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    let response = rpc::dispatch(&host, &json!({ "type": "bash", "command": "echo rpc-bash" })).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["data"]["exitCode"], 0);
    assert!(response["data"]["output"]
        .as_str()
        .unwrap()
        .contains("rpc-bash"));

    // Recorded on the branch as a user-visible message for the next turn.
    let session = host.agent.session();
    let session = session.lock().await;
    assert_eq!(
        session
            .branch()
            .iter()
            .filter(|e| matches!(e, SessionEntry::Message(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn queue_mode_commands() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);

    let response =
        rpc::dispatch(&host, &json!({ "type": "set_steering_mode", "mode": "all" })).await;
    assert_eq!(response["success"], true);
    let state = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    assert_eq!(state["data"]["steeringMode"], "all");

    let bad = rpc::dispatch(&host, &json!({ "type": "set_follow_up_mode", "mode": "sometimes" }))
        .await;
    assert_eq!(bad["success"], false);
}

#[tokio::test]
async fn thinking_level_cycles() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    let first = rpc::dispatch(&host, &json!({ "type": "cycle_thinking_level" })).await;
    assert_eq!(first["data"]["level"], "minimal");
    let second = rpc::dispatch(&host, &json!({ "type": "cycle_thinking_level" })).await;
    assert_eq!(second["data"]["level"], "low");
}

#[tokio::test]
async fn export_html_writes_branch() {
    let mut session = Session::in_memory();
    session
        .append_message(Message::user_text("export me"))
        .unwrap();
    let (host, dir) = build_host(session, vec![]);

    let out = dir.path().join("session.html");
    let response = rpc::dispatch(
        &host,
        &json!({ "type": "export_html", "path": out.display().to_string() }),
    )
    .await;
    assert_eq!(response["success"], true);
    let html = std::fs::read_to_string(&out).unwrap();
    assert!(html.contains("export me"));
}

#[tokio::test]
async fn new_session_replaces_current() {
    let mut session = Session::in_memory();
    session.append_message(Message::user_text("old")).unwrap();
    let old_id = session.header.id.clone();
    let (host, _dir) = build_host(session, vec![]);

    let response = rpc::dispatch(&host, &json!({ "type": "new_session" })).await;
    assert_eq!(response["success"], true);
    assert_ne!(response["data"]["sessionId"], json!(old_id));

    let session = host.agent.session();
    let session = session.lock().await;
    assert_eq!(session.entries().len(), 0);
}

#[tokio::test]
async fn session_name_round_trip() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    rpc::dispatch(&host, &json!({ "type": "set_session_name", "name": "my task" })).await;
    let state = rpc::dispatch(&host, &json!({ "type": "get_state" })).await;
    assert_eq!(state["data"]["sessionName"], "my task");
}

#[tokio::test]
async fn extension_ui_response_resolves_pending() {
    let (host, _dir) = build_host(Session::in_memory(), vec![]);
    let mut events = host.subscribe();

    let ui = Arc::clone(&host.ui);
    let waiter =
        tokio::spawn(async move { ui.request("confirm", json!({ "title": "ok?" }), None, None).await });

    // The request surfaces on the event plane with its correlation id.
    let request_id = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SessionEvent::UiRequest(request) => break request.id.unwrap(),
            _ => continue,
        }
    };

    let response = rpc::dispatch(
        &host,
        &json!({ "type": "extension_ui_response", "requestId": request_id, "value": true }),
    )
    .await;
    assert_eq!(response["success"], true);
    assert_eq!(waiter.await.unwrap(), Value::Bool(true));

    // Unknown ids are acknowledged (already timed out).
    let stale = rpc::dispatch(
        &host,
        &json!({ "type": "extension_ui_response", "requestId": "gone", "value": 1 }),
    )
    .await;
    assert_eq!(stale["success"], true);
}

#[tokio::test]
async fn get_session_stats_counts_branch() {
    let mut session = Session::in_memory();
    session.append_message(Message::user_text("q1")).unwrap();
    session.append_message(Message::user_text("q2")).unwrap();
    let (host, _dir) = build_host(session, vec![]);

    let stats = rpc::dispatch(&host, &json!({ "type": "get_session_stats" })).await;
    assert_eq!(stats["data"]["userMessages"], 2);
    assert_eq!(stats["data"]["entryCount"], 2);
}
