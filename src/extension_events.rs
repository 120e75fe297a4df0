//! Typed extension event and decision payloads.
//!
//! Events are delivered to handlers in registration order, one at a time.
//! Each handler may return a decision object; merge rules per event kind
//! live in [`crate::extensions::ExtensionBus`].

use crate::model::{ContentBlock, ImageContent, Message, ToolResultMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Observational lifecycle events (no decision).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    AgentStart { session_id: String },
    #[serde(rename_all = "camelCase")]
    AgentEnd {
        session_id: String,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TurnStart {
        session_id: String,
        turn_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    TurnEnd {
        session_id: String,
        turn_index: usize,
        tool_results: Vec<ToolResultMessage>,
    },
}

impl LifecycleEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
        }
    }
}

/// Payload for the `tool_call` event (fired before execution).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    pub input: Value,
}

/// Decision from a `tool_call` handler. First `block: true` wins; the
/// remaining handlers still run for observation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDecision {
    #[serde(default)]
    pub block: bool,
    pub reason: Option<String>,
}

/// Payload for the `tool_result` event (fired after execution).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    pub input: Value,
    pub content: Vec<ContentBlock>,
    pub details: Option<Value>,
    pub is_error: bool,
}

/// Decision from a `tool_result` handler: a replacement that supersedes the
/// original. Later handlers see earlier replacements (chained transform).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultDecision {
    pub content: Option<Vec<ContentBlock>>,
    pub details: Option<Value>,
    pub is_error: Option<bool>,
}

/// Decision from `before_agent_start`. Injected messages accumulate across
/// handlers; system prompt replacements chain.
#[derive(Debug, Clone, Default)]
pub struct BeforeAgentStartDecision {
    /// Text appended as a user message before the prompt.
    pub message: Option<String>,
    /// Replacement for the effective system prompt this turn. The handler
    /// receives the previous handler's output.
    pub system_prompt: Option<String>,
}

/// Decision from cancellable `session_before_*` events. First cancel wins.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelDecision {
    #[serde(default)]
    pub cancel: bool,
    pub reason: Option<String>,
}

/// Decision from `session_before_compact`: cancel the compaction entirely,
/// or supply a summary directly (skipping the LLM call).
#[derive(Debug, Clone, Default)]
pub struct CompactDecision {
    pub cancel: bool,
    /// A directly-supplied compaction. `first_kept_entry_id` must exist on
    /// the active branch and `summary` must be non-empty.
    pub compaction: Option<SuppliedCompaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppliedCompaction {
    pub summary: String,
    pub first_kept_entry_id: String,
}

/// Payload for the `input` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    pub text: String,
    pub images: Vec<ImageContent>,
}

/// Terminal action from an `input` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Skip the agent entirely. First wins.
    Handled,
    /// Modify the input; later handlers see the transformed value.
    Transform {
        text: String,
        images: Vec<ImageContent>,
    },
    /// Pass through unchanged.
    Continue,
}

/// Payload for the `context` event: a deep copy of the outgoing message
/// list. Handlers may return a replacement; replacements chain.
#[derive(Debug, Clone)]
pub struct ContextEvent {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
}

/// A handler fault surfaced on the event plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionErrorReport {
    pub extension: String,
    pub event: String,
    pub error: String,
}
