//! RPC command plane: typed command -> response dispatch, independent of
//! transport.
//!
//! Commands arrive as JSON objects with a `type` discriminator and optional
//! correlation `id`; every command produces exactly one
//! `{id, type:"response", command, success, data|error}` envelope.
//! Asynchronous effects (notably `prompt`) acknowledge synchronously and
//! deliver outcomes through the event plane. The same dispatcher backs the
//! stdio line protocol and the HTTP `POST /rpc` surface.

use crate::agent::{AbortHandle, Agent, AgentEvent, QueueMode};
use crate::error::Error;
use crate::extension_events::ExtensionErrorReport;
use crate::extensions::MergedInput;
use crate::model::{ContentBlock, ImageContent, Message, TextContent, UserContent, UserMessage};
use crate::provider::{find_model, next_model, MODEL_CATALOG};
use crate::session::{Session, SessionEntry};
use crate::tools::{run_shell, DEFAULT_BASH_TIMEOUT_SECS};
use crate::ui_bridge::{UiBridge, UiRequest};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Per-command timeout for long-running command types.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(300);

/// An event on the session event plane.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Scheduler lifecycle, message delta, or tool update.
    Agent(AgentEvent),
    /// UI round-trip request from an extension.
    UiRequest(UiRequest),
    /// Extension handler fault.
    ExtensionError(ExtensionErrorReport),
}

impl SessionEvent {
    /// SSE event name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Agent(_) => "agent_event",
            Self::UiRequest(_) => "extension_ui_request",
            Self::ExtensionError(_) => "extension_error",
        }
    }

    /// JSON payload.
    pub fn data(&self) -> Value {
        match self {
            Self::Agent(event) => serde_json::to_value(event).unwrap_or(Value::Null),
            Self::UiRequest(request) => serde_json::to_value(request).unwrap_or(Value::Null),
            Self::ExtensionError(report) => serde_json::to_value(report).unwrap_or(Value::Null),
        }
    }

    /// One-object form for the stdio transport.
    pub fn to_line_value(&self) -> Value {
        match self {
            Self::Agent(event) => serde_json::to_value(event).unwrap_or(Value::Null),
            Self::UiRequest(request) => {
                let mut value = serde_json::to_value(request).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "type".to_string(),
                        Value::String("extension_ui_request".to_string()),
                    );
                }
                value
            }
            Self::ExtensionError(report) => {
                let mut value = serde_json::to_value(report).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "type".to_string(),
                        Value::String("extension_error".to_string()),
                    );
                }
                value
            }
        }
    }
}

/// The shared session host: scheduler + event fan-out + UI bridge.
pub struct SessionHost {
    pub agent: Arc<Agent>,
    pub ui: Arc<UiBridge>,
    events: broadcast::Sender<SessionEvent>,
    sessions_dir: PathBuf,
    bash_abort: StdMutex<Option<AbortHandle>>,
}

impl SessionHost {
    pub fn new(
        agent: Arc<Agent>,
        ui: Arc<UiBridge>,
        events: broadcast::Sender<SessionEvent>,
        sessions_dir: PathBuf,
    ) -> Self {
        Self {
            agent,
            ui,
            events,
            sessions_dir,
            bash_abort: StdMutex::new(None),
        }
    }

    /// Subscribe to the event plane.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Scheduler event callback wired into the event plane.
    pub fn event_fn(self: &Arc<Self>) -> crate::agent::EventFn {
        let host = Arc::clone(self);
        Arc::new(move |event: AgentEvent| {
            host.publish(SessionEvent::Agent(event));
        })
    }
}

// ============================================================================
// Envelope helpers
// ============================================================================

fn response_ok(id: Option<&str>, command: &str, data: Option<Value>) -> Value {
    let mut resp = json!({
        "type": "response",
        "command": command,
        "success": true,
    });
    if let Some(id) = id {
        resp["id"] = json!(id);
    }
    if let Some(data) = data {
        resp["data"] = data;
    }
    resp
}

fn response_error(id: Option<&str>, command: &str, error: impl Into<String>) -> Value {
    let mut resp = json!({
        "type": "response",
        "command": command,
        "success": false,
        "error": error.into(),
    });
    if let Some(id) = id {
        resp["id"] = json!(id);
    }
    resp
}

fn parse_images(value: Option<&Value>) -> Result<Vec<ImageContent>, Error> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    serde_json::from_value(value.clone())
        .map_err(|e| Error::validation(format!("invalid images: {e}")))
}

fn build_user_message(text: &str, images: &[ImageContent]) -> Message {
    if images.is_empty() {
        return Message::user_text(text);
    }
    let mut blocks = vec![ContentBlock::Text(TextContent::new(text))];
    for image in images {
        blocks.push(ContentBlock::Image(image.clone()));
    }
    Message::User(UserMessage {
        content: UserContent::Blocks(blocks),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Handle one command and produce its response envelope.
#[allow(clippy::too_many_lines)]
pub async fn dispatch(host: &Arc<SessionHost>, command: &Value) -> Value {
    let Some(command_type) = command.get("type").and_then(Value::as_str) else {
        return response_error(None, "parse", "Missing command type");
    };
    let id = command.get("id").and_then(Value::as_str);
    let agent = &host.agent;

    match command_type {
        "prompt" | "steer" | "follow_up" => {
            let Some(message) = command.get("message").and_then(Value::as_str) else {
                return response_error(id, command_type, "Missing message");
            };
            let images = match parse_images(command.get("images")) {
                Ok(images) => images,
                Err(err) => return response_error(id, command_type, err.to_string()),
            };

            let behavior = match command_type {
                "steer" => Some("steer"),
                "follow_up" => Some("followUp"),
                _ => match command.get("streamingBehavior") {
                    None => None,
                    Some(Value::String(s)) => Some(s.as_str()),
                    Some(_) => {
                        return response_error(
                            id,
                            command_type,
                            "streamingBehavior must be a string",
                        )
                    }
                },
            };

            if agent.flags().is_streaming() {
                let queued = match behavior {
                    Some("steer") => {
                        agent.queue_steering(build_user_message(message, &images));
                        true
                    }
                    Some("followUp" | "follow-up") => {
                        agent.queue_follow_up(build_user_message(message, &images));
                        true
                    }
                    Some("nextTurn" | "next-turn") => {
                        agent.queue_next_turn(build_user_message(message, &images));
                        true
                    }
                    Some(other) => {
                        return response_error(
                            id,
                            command_type,
                            format!("Invalid streamingBehavior: {other}"),
                        )
                    }
                    None => false,
                };
                if !queued {
                    return response_error(
                        id,
                        command_type,
                        "Agent is currently streaming; specify streamingBehavior",
                    );
                }
                return response_ok(id, command_type, None);
            }

            if behavior == Some("nextTurn") || behavior == Some("next-turn") {
                agent.queue_next_turn(build_user_message(message, &images));
                return response_ok(id, command_type, None);
            }

            // Idle: input hook, then spawn the turn. Ack immediately.
            let host = Arc::clone(host);
            let text = message.to_string();
            tokio::spawn(async move {
                let agent = Arc::clone(&host.agent);
                let input = agent.bus().dispatch_input(text, images).await;
                let (text, images) = match input {
                    MergedInput::Handled => return,
                    MergedInput::Continue { text, images } => (text, images),
                };
                let prompt = build_user_message(&text, &images);
                let on_event = host.event_fn();
                if let Err(err) = agent.run_prompt(Some(prompt), on_event).await {
                    tracing::error!(%err, "prompt run failed");
                    host.publish(SessionEvent::Agent(AgentEvent::AgentEnd {
                        session_id: String::new(),
                        error: Some(err.to_string()),
                    }));
                }
            });
            response_ok(id, command_type, None)
        }

        "abort" => {
            agent.abort();
            response_ok(id, "abort", None)
        }

        "abort_retry" => {
            agent.flags().abort_retry();
            response_ok(id, "abort_retry", None)
        }

        "get_state" => {
            let session = agent.session();
            let session = session.lock().await;
            let queue = agent.queue();
            let queue = queue.lock().expect("queue lock");
            let provider = agent.provider();
            let flags = agent.flags();
            let data = json!({
                "provider": provider.name(),
                "model": provider.model_id(),
                "thinkingLevel": agent.stream_options().thinking_level.to_string(),
                "isStreaming": flags.is_streaming(),
                "isCompacting": flags.is_compacting(),
                "steeringMode": queue.steering_mode.as_str(),
                "followUpMode": queue.follow_up_mode.as_str(),
                "sessionFile": session.path.as_ref().map(|p| p.display().to_string()),
                "sessionId": session.header.id,
                "sessionName": session.name(),
                "autoCompactionEnabled": flags.auto_compaction.load(std::sync::atomic::Ordering::SeqCst),
                "autoRetryEnabled": flags.auto_retry.load(std::sync::atomic::Ordering::SeqCst),
                "messageCount": session.entries().iter().filter(|e| matches!(e, SessionEntry::Message(_))).count(),
                "pendingMessageCount": queue.pending_len(),
            });
            response_ok(id, "get_state", Some(data))
        }

        "get_messages" => {
            let session = agent.session();
            let session = session.lock().await;
            let messages: Vec<Value> = session
                .materialize()
                .iter()
                .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
                .collect();
            response_ok(id, "get_messages", Some(json!({ "messages": messages })))
        }

        "get_session_stats" => {
            let session = agent.session();
            let session = session.lock().await;
            let branch = session.branch();
            let mut user_messages = 0usize;
            let mut assistant_messages = 0usize;
            let mut tool_results = 0usize;
            let mut total_cost = 0.0f64;
            for entry in &branch {
                if let SessionEntry::Message(message) = entry {
                    match &message.message {
                        Message::User(_) => user_messages += 1,
                        Message::Assistant(assistant) => {
                            assistant_messages += 1;
                            total_cost += assistant.usage.cost;
                        }
                        Message::ToolResult(_) => tool_results += 1,
                        Message::System(_) => {}
                    }
                }
            }
            let data = json!({
                "entryCount": session.entries().len(),
                "branchLength": branch.len(),
                "userMessages": user_messages,
                "assistantMessages": assistant_messages,
                "toolResults": tool_results,
                "estimatedTokens": crate::compaction::estimate_branch_tokens(&branch),
                "totalCost": total_cost,
            });
            response_ok(id, "get_session_stats", Some(data))
        }

        "get_available_models" => {
            let models: Vec<Value> = MODEL_CATALOG
                .iter()
                .map(|spec| serde_json::to_value(spec).unwrap_or(Value::Null))
                .collect();
            response_ok(id, "get_available_models", Some(json!({ "models": models })))
        }

        "set_model" => {
            let Some(provider) = command.get("provider").and_then(Value::as_str) else {
                return response_error(id, "set_model", "Missing provider");
            };
            let Some(model_id) = command.get("modelId").and_then(Value::as_str) else {
                return response_error(id, "set_model", "Missing modelId");
            };
            let Some(spec) = find_model(provider, model_id) else {
                return response_error(
                    id,
                    "set_model",
                    format!("Model not found: {provider}/{model_id}"),
                );
            };
            match crate::providers::create_provider(spec) {
                Ok(new_provider) => {
                    agent.set_provider(new_provider);
                    response_ok(
                        id,
                        "set_model",
                        Some(json!({ "provider": provider, "model": model_id })),
                    )
                }
                Err(err) => response_error(id, "set_model", err.to_string()),
            }
        }

        "cycle_model" => {
            let current = agent.provider().model_id().to_string();
            let spec = next_model(&current);
            match crate::providers::create_provider(spec) {
                Ok(new_provider) => {
                    agent.set_provider(new_provider);
                    response_ok(
                        id,
                        "cycle_model",
                        Some(json!({ "provider": spec.provider, "model": spec.id })),
                    )
                }
                Err(err) => response_error(id, "cycle_model", err.to_string()),
            }
        }

        "set_thinking_level" => {
            let Some(level) = command.get("level").and_then(Value::as_str) else {
                return response_error(id, "set_thinking_level", "Missing level");
            };
            match level.parse::<crate::model::ThinkingLevel>() {
                Ok(level) => {
                    agent.set_thinking_level(level);
                    response_ok(
                        id,
                        "set_thinking_level",
                        Some(json!({ "level": level.to_string() })),
                    )
                }
                Err(err) => response_error(id, "set_thinking_level", err),
            }
        }

        "cycle_thinking_level" => {
            let level = agent.stream_options().thinking_level.next();
            agent.set_thinking_level(level);
            response_ok(
                id,
                "cycle_thinking_level",
                Some(json!({ "level": level.to_string() })),
            )
        }

        "set_steering_mode" | "set_follow_up_mode" => {
            let Some(mode) = command
                .get("mode")
                .and_then(Value::as_str)
                .and_then(QueueMode::parse)
            else {
                return response_error(
                    id,
                    command_type,
                    "mode must be 'all' or 'one-at-a-time'",
                );
            };
            {
                let queue = agent.queue();
                let mut queue = queue.lock().expect("queue lock");
                if command_type == "set_steering_mode" {
                    queue.steering_mode = mode;
                } else {
                    queue.follow_up_mode = mode;
                }
            }
            response_ok(id, command_type, Some(json!({ "mode": mode.as_str() })))
        }

        "set_auto_compaction" | "set_auto_retry" => {
            let Some(enabled) = command.get("enabled").and_then(Value::as_bool) else {
                return response_error(id, command_type, "Missing enabled");
            };
            let flags = agent.flags();
            if command_type == "set_auto_compaction" {
                flags
                    .auto_compaction
                    .store(enabled, std::sync::atomic::Ordering::SeqCst);
            } else {
                flags
                    .auto_retry
                    .store(enabled, std::sync::atomic::Ordering::SeqCst);
            }
            response_ok(id, command_type, Some(json!({ "enabled": enabled })))
        }

        "compact" => {
            let instructions = command
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string);
            let result = tokio::time::timeout(
                RPC_TIMEOUT,
                agent.compact_now(instructions.as_deref()),
            )
            .await;
            match result {
                Ok(Ok(Some(outcome))) => response_ok(
                    id,
                    "compact",
                    Some(json!({
                        "entryId": outcome.entry_id,
                        "firstKeptEntryId": outcome.first_kept_entry_id,
                        "tokensBefore": outcome.tokens_before,
                        "tokensAfter": outcome.tokens_after,
                        "fromExtension": outcome.from_extension,
                    })),
                ),
                Ok(Ok(None)) => response_ok(id, "compact", Some(json!({ "compacted": false }))),
                Ok(Err(err)) => response_error(id, "compact", err.to_string()),
                Err(_) => response_error(id, "compact", "compaction timed out"),
            }
        }

        "bash" => {
            let Some(shell_command) = command.get("command").and_then(Value::as_str) else {
                return response_error(id, "bash", "Missing command");
            };
            let (handle, signal) = AbortHandle::new();
            *host.bash_abort.lock().expect("bash abort lock") = Some(handle);

            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let run = tokio::time::timeout(
                RPC_TIMEOUT,
                run_shell(
                    shell_command,
                    &cwd,
                    Duration::from_secs(DEFAULT_BASH_TIMEOUT_SECS),
                    &signal,
                    |_| {},
                ),
            )
            .await;
            *host.bash_abort.lock().expect("bash abort lock") = None;

            match run {
                Ok(Ok(run)) => {
                    let (output, _) =
                        crate::tools::apply_output_contract("bash", &run.output, true);
                    {
                        let session = agent.session();
                        let mut session = session.lock().await;
                        if let Err(err) = session.append_shell_execution(
                            shell_command,
                            &output,
                            run.exit_code,
                            run.cancelled,
                        ) {
                            tracing::warn!(%err, "failed to record bash execution");
                        }
                    }
                    response_ok(
                        id,
                        "bash",
                        Some(json!({
                            "output": output,
                            "exitCode": run.exit_code,
                            "cancelled": run.cancelled,
                        })),
                    )
                }
                Ok(Err(err)) => response_error(id, "bash", err.to_string()),
                Err(_) => response_error(id, "bash", "bash command timed out"),
            }
        }

        "abort_bash" => {
            if let Some(handle) = host.bash_abort.lock().expect("bash abort lock").as_ref() {
                handle.abort();
            }
            response_ok(id, "abort_bash", None)
        }

        "new_session" => {
            match Session::create_in_dir(&host.sessions_dir) {
                Ok(session) => {
                    let session_id = session.header.id.clone();
                    let path = session.path.as_ref().map(|p| p.display().to_string());
                    agent.replace_session(session).await;
                    response_ok(
                        id,
                        "new_session",
                        Some(json!({ "sessionId": session_id, "sessionFile": path })),
                    )
                }
                Err(err) => response_error(id, "new_session", err.to_string()),
            }
        }

        "switch_session" => {
            let Some(path) = command.get("path").and_then(Value::as_str) else {
                return response_error(id, "switch_session", "Missing path");
            };
            let decision = agent.bus().dispatch_before_switch(path).await;
            if decision.cancel {
                return response_error(
                    id,
                    "switch_session",
                    decision
                        .reason
                        .unwrap_or_else(|| "switch cancelled by extension".to_string()),
                );
            }
            match Session::open(std::path::Path::new(path)) {
                Ok(session) => {
                    let session_id = session.header.id.clone();
                    agent.replace_session(session).await;
                    response_ok(
                        id,
                        "switch_session",
                        Some(json!({ "sessionId": session_id })),
                    )
                }
                Err(err) => response_error(id, "switch_session", err.to_string()),
            }
        }

        "fork" => {
            let Some(entry_id) = command.get("entryId").and_then(Value::as_str) else {
                return response_error(id, "fork", "Missing entryId");
            };
            let decision = agent.bus().dispatch_before_fork(entry_id).await;
            if decision.cancel {
                return response_error(
                    id,
                    "fork",
                    decision
                        .reason
                        .unwrap_or_else(|| "fork cancelled by extension".to_string()),
                );
            }
            let fork_path = host.sessions_dir.join(format!(
                "fork_{}.jsonl",
                uuid::Uuid::new_v4().simple()
            ));
            let session = agent.session();
            let forked = {
                let session = session.lock().await;
                session.fork(entry_id, &fork_path)
            };
            match forked {
                Ok(forked) => {
                    let session_id = forked.header.id.clone();
                    let leaf = forked.leaf_id.clone();
                    agent.replace_session(forked).await;
                    response_ok(
                        id,
                        "fork",
                        Some(json!({
                            "sessionId": session_id,
                            "sessionFile": fork_path.display().to_string(),
                            "leafId": leaf,
                        })),
                    )
                }
                Err(err) => response_error(id, "fork", err.to_string()),
            }
        }

        "get_fork_messages" => {
            let Some(entry_id) = command.get("entryId").and_then(Value::as_str) else {
                return response_error(id, "get_fork_messages", "Missing entryId");
            };
            let session = agent.session();
            let session = session.lock().await;
            if session.get_entry(entry_id).is_none() {
                return response_error(
                    id,
                    "get_fork_messages",
                    format!("entry '{entry_id}' not found"),
                );
            }
            let messages: Vec<Value> = session
                .path_to(entry_id)
                .iter()
                .filter_map(|entry_id| session.get_entry(entry_id))
                .filter_map(|entry| match entry {
                    SessionEntry::Message(message) => {
                        Some(serde_json::to_value(&message.message).unwrap_or(Value::Null))
                    }
                    _ => None,
                })
                .collect();
            response_ok(
                id,
                "get_fork_messages",
                Some(json!({ "messages": messages })),
            )
        }

        "get_last_assistant_text" => {
            let session = agent.session();
            let session = session.lock().await;
            response_ok(
                id,
                "get_last_assistant_text",
                Some(json!({ "text": session.last_assistant_text() })),
            )
        }

        "export_html" => {
            let Some(path) = command.get("path").and_then(Value::as_str) else {
                return response_error(id, "export_html", "Missing path");
            };
            let html = {
                let session = agent.session();
                let session = session.lock().await;
                session.to_html()
            };
            match tokio::fs::write(path, html).await {
                Ok(()) => response_ok(id, "export_html", Some(json!({ "path": path }))),
                Err(err) => response_error(id, "export_html", err.to_string()),
            }
        }

        "set_session_name" => {
            let name = command
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let session = agent.session();
            let mut session = session.lock().await;
            match session.set_name(name.clone()) {
                Ok(_) => response_ok(id, "set_session_name", Some(json!({ "name": name }))),
                Err(err) => response_error(id, "set_session_name", err.to_string()),
            }
        }

        "extension_ui_response" => {
            let Some(request_id) = command.get("requestId").and_then(Value::as_str) else {
                return response_error(id, "extension_ui_response", "Missing requestId");
            };
            let value = command.get("value").cloned().unwrap_or(Value::Null);
            // Unknown ids are fine: the request already timed out.
            host.ui.resolve(request_id, value);
            response_ok(id, "extension_ui_response", None)
        }

        other => response_error(id, other, format!("Unknown command type: {other}")),
    }
}

// ============================================================================
// Stdio transport
// ============================================================================

/// Run the line-delimited JSON protocol over stdin/stdout.
///
/// Stdin carries commands and `extension_ui_response` messages; stdout
/// carries responses, every session event, and every UI request.
pub async fn run_stdio(host: Arc<SessionHost>) -> crate::error::Result<()> {
    let (out_tx, out_rx) = std::sync::mpsc::channel::<String>();

    // Writer thread: one JSON object per line.
    let writer = std::thread::spawn(move || {
        use std::io::Write as _;
        let stdout = std::io::stdout();
        let mut writer = std::io::BufWriter::new(stdout.lock());
        for line in out_rx {
            if writer.write_all(line.as_bytes()).is_err()
                || writer.write_all(b"\n").is_err()
                || writer.flush().is_err()
            {
                break;
            }
        }
    });

    // Event pump: broadcast -> stdout.
    let pump = {
        let mut events = host.subscribe();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = out_tx.send(event.to_line_value().to_string());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "stdout event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Reader thread: stdin lines -> channel.
    let (in_tx, mut in_rx) = tokio::sync::mpsc::channel::<String>(1024);
    std::thread::spawn(move || {
        use std::io::BufRead as _;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if in_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = in_rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                let resp = response_error(None, "parse", format!("Failed to parse command: {err}"));
                let _ = out_tx.send(resp.to_string());
                continue;
            }
        };
        let response = dispatch(&host, &parsed).await;
        let _ = out_tx.send(response.to_string());
    }

    host.agent.shutdown().await;
    host.ui.shutdown();
    pump.abort();
    drop(out_tx);
    let _ = writer.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let ok = response_ok(Some("7"), "get_state", Some(json!({ "x": 1 })));
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["command"], "get_state");
        assert_eq!(ok["success"], true);
        assert_eq!(ok["id"], "7");
        assert_eq!(ok["data"]["x"], 1);

        let err = response_error(None, "prompt", "nope");
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "nope");
        assert!(err.get("id").is_none());
    }

    #[test]
    fn session_event_names() {
        let event = SessionEvent::Agent(AgentEvent::AgentStart {
            session_id: "s".to_string(),
        });
        assert_eq!(event.name(), "agent_event");
        assert_eq!(event.data()["type"], "agent_start");

        let ui = SessionEvent::UiRequest(UiRequest {
            id: Some("c1".to_string()),
            method: "confirm".to_string(),
            payload: json!({}),
        });
        assert_eq!(ui.name(), "extension_ui_request");
        assert_eq!(ui.to_line_value()["type"], "extension_ui_request");
    }
}
