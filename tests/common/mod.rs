//! Shared test harness: a scripted in-process provider and event capture.

#![allow(dead_code)]

use futures::StreamExt;
use plover::agent::{Agent, AgentConfig, AgentEvent, EventFn, RetryPolicy};
use plover::compaction::CompactionSettings;
use plover::error::{Error, Result};
use plover::extensions::{Extension, ExtensionBus, ExtensionCx};
use plover::model::{
    AssistantMessage, ContentBlock, StopReason, StreamEvent, TextContent, ToolCall, Usage,
};
use plover::provider::{EventStream, Provider, Request, StreamOptions};
use plover::session::Session;
use plover::tools::ToolRegistry;
use plover::ui_bridge::UiBridge;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted provider response.
pub enum Script {
    /// Stream a text reply, delta by delta.
    Text(String),
    /// Stream a text reply after a delay (for steering/follow-up timing).
    TextDelayed(String, Duration),
    /// Reply with tool calls.
    ToolCalls(Vec<ToolCall>),
    /// Fail the request before streaming starts.
    Fail(u16, String),
    /// Emit a start event, then hang until aborted.
    Stall,
}

/// A provider that replays a fixed script, one entry per `stream` call.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<Request>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn base_message(&self) -> AssistantMessage {
        AssistantMessage {
            content: Vec::new(),
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
            usage: Usage {
                input: 10,
                output: 5,
                cache_read: 0,
                cache_write: 0,
                total_tokens: 15,
                cost: 0.0,
            },
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-1"
    }

    fn context_window(&self) -> u32 {
        100_000
    }

    async fn stream(&self, request: &Request, _options: &StreamOptions) -> Result<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted provider ran out of script");

        let mut message = self.base_message();
        match step {
            Script::Fail(status, text) => Err(Error::api(status, text)),
            Script::Text(text) => {
                message.content = vec![ContentBlock::Text(TextContent::new(text.clone()))];
                let events = vec![
                    Ok(StreamEvent::Start {
                        partial: self.base_message(),
                    }),
                    Ok(StreamEvent::TextDelta {
                        content_index: 0,
                        delta: text,
                    }),
                    Ok(StreamEvent::Done { message }),
                ];
                Ok(Box::pin(futures::stream::iter(events)))
            }
            Script::TextDelayed(text, delay) => {
                message.content = vec![ContentBlock::Text(TextContent::new(text.clone()))];
                let events = vec![
                    Ok(StreamEvent::Start {
                        partial: self.base_message(),
                    }),
                    Ok(StreamEvent::TextDelta {
                        content_index: 0,
                        delta: text,
                    }),
                    Ok(StreamEvent::Done { message }),
                ];
                let per_event = delay / events.len() as u32;
                Ok(Box::pin(futures::stream::iter(events).then(
                    move |event| async move {
                        tokio::time::sleep(per_event).await;
                        event
                    },
                )))
            }
            Script::ToolCalls(calls) => {
                message.stop_reason = StopReason::ToolUse;
                let mut events = vec![Ok(StreamEvent::Start {
                    partial: self.base_message(),
                })];
                for (index, call) in calls.iter().enumerate() {
                    events.push(Ok(StreamEvent::ToolCallStart {
                        content_index: index,
                    }));
                    events.push(Ok(StreamEvent::ToolCallEnd {
                        content_index: index,
                        tool_call: call.clone(),
                    }));
                    message.content.push(ContentBlock::ToolCall(call.clone()));
                }
                events.push(Ok(StreamEvent::Done { message }));
                Ok(Box::pin(futures::stream::iter(events)))
            }
            Script::Stall => {
                let start = futures::stream::iter(vec![Ok(StreamEvent::Start {
                    partial: self.base_message(),
                })]);
                Ok(Box::pin(start.chain(futures::stream::pending())))
            }
        }
    }
}

/// Build a tool call value for scripts.
pub fn tool_call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args,
    }
}

/// Captured scheduler events with wait support.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<AgentEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> EventFn {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| {
            events.lock().unwrap().push(event);
        })
    }

    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Names of captured events, in order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|event| {
                serde_json::to_value(event).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    /// Wait until a captured event satisfies the predicate.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&AgentEvent) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events.lock().unwrap().iter().any(&mut predicate) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Assemble an agent over a scripted provider and a temp-dir tool registry.
pub fn build_agent(
    session: Session,
    provider: Arc<ScriptedProvider>,
    cwd: &std::path::Path,
    extensions: Vec<Arc<dyn Extension>>,
) -> Arc<Agent> {
    build_agent_with_config(session, provider, cwd, extensions, AgentConfig {
        system_prompt: None,
        max_tool_iterations: 20,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
        },
        compaction: CompactionSettings {
            keep_recent_tokens: 30_000,
            reserve_tokens: 1024,
        },
    })
}

pub fn build_agent_with_config(
    session: Session,
    provider: Arc<ScriptedProvider>,
    cwd: &std::path::Path,
    extensions: Vec<Arc<dyn Extension>>,
    config: AgentConfig,
) -> Arc<Agent> {
    let ui = Arc::new(UiBridge::new(|_| {}));
    let bus = if extensions.is_empty() {
        ExtensionBus::empty(Arc::clone(&ui))
    } else {
        ExtensionBus::new(extensions, ExtensionCx::new(ui), Arc::new(|_| {}))
    };
    let tools = ToolRegistry::builtin(&["read", "write", "edit", "bash", "grep", "find", "ls"], cwd);
    let agent = Arc::new(Agent::new(
        session,
        provider,
        tools,
        Arc::new(bus),
        config,
        StreamOptions::default(),
    ));
    agent
        .bus()
        .bind_actions(Arc::new(plover::agent::AgentHostActions::new(&agent)));
    agent
}
