//! Extension bus: ordered, sequential dispatch with per-event merge rules.
//!
//! Extensions are linked into the binary and registered at session start
//! (the dispatch contract is the same one an out-of-process host would
//! speak). Handlers run in registration order, one at a time; a handler
//! fault is isolated, reported as an `extension_error`, and never aborts
//! the session.

use crate::error::Result;
use crate::extension_events::{
    BeforeAgentStartDecision, CancelDecision, CompactDecision, ContextEvent, ExtensionErrorReport,
    InputAction, InputEvent, LifecycleEvent, ToolCallDecision, ToolCallEvent, ToolResultDecision,
    ToolResultEvent,
};
use crate::model::Message;
use crate::tools::Tool;
use crate::ui_bridge::UiBridge;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Action capabilities handed to extension handlers.
#[async_trait]
pub trait HostActions: Send + Sync {
    /// Queue a user message for the next turn (follow-up semantics).
    async fn send_user_message(&self, text: String);

    /// Append a custom entry to the session log.
    async fn append_custom_entry(&self, custom_type: String, data: Option<Value>) -> Result<String>;

    /// Switch the active model.
    async fn set_model(&self, provider: String, model_id: String) -> Result<()>;

    /// Restrict the tools offered to the model (`None` restores all).
    async fn set_active_tools(&self, names: Option<Vec<String>>);
}

/// No-op actions for tests and detached dispatch.
pub struct NullHostActions;

#[async_trait]
impl HostActions for NullHostActions {
    async fn send_user_message(&self, _text: String) {}

    async fn append_custom_entry(
        &self,
        _custom_type: String,
        _data: Option<Value>,
    ) -> Result<String> {
        Ok(String::new())
    }

    async fn set_model(&self, _provider: String, _model_id: String) -> Result<()> {
        Ok(())
    }

    async fn set_active_tools(&self, _names: Option<Vec<String>>) {}
}

/// Late-bound action slot: the host binds its capabilities after the
/// scheduler exists; until then actions are no-ops.
pub struct ActionsSlot(std::sync::Mutex<Arc<dyn HostActions>>);

impl ActionsSlot {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(Arc::new(NullHostActions)))
    }

    pub fn bind(&self, actions: Arc<dyn HostActions>) {
        *self.0.lock().expect("actions lock") = actions;
    }

    pub fn get(&self) -> Arc<dyn HostActions> {
        Arc::clone(&self.0.lock().expect("actions lock"))
    }
}

impl Default for ActionsSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed to every handler: UI primitives plus action capabilities.
#[derive(Clone)]
pub struct ExtensionCx {
    pub ui: Arc<UiBridge>,
    actions: Arc<ActionsSlot>,
}

impl ExtensionCx {
    pub fn new(ui: Arc<UiBridge>) -> Self {
        Self {
            ui,
            actions: Arc::new(ActionsSlot::new()),
        }
    }

    /// Current host action capabilities.
    pub fn actions(&self) -> Arc<dyn HostActions> {
        self.actions.get()
    }
}

/// An extension registered with the session.
///
/// All handlers default to pass-through; an extension implements only the
/// hooks it cares about.
#[async_trait]
#[allow(unused_variables)]
pub trait Extension: Send + Sync {
    /// Stable extension name, used in error reports.
    fn name(&self) -> &str;

    /// Tools contributed by this extension, collected once at load time.
    fn tools(&self) -> Vec<Box<dyn Tool>> {
        Vec::new()
    }

    /// Slash-command names this extension claims for `input` handling.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_lifecycle(&self, event: &LifecycleEvent, cx: &ExtensionCx) -> Result<()> {
        Ok(())
    }

    async fn on_tool_call(
        &self,
        event: &ToolCallEvent,
        cx: &ExtensionCx,
    ) -> Result<Option<ToolCallDecision>> {
        Ok(None)
    }

    async fn on_tool_result(
        &self,
        event: &ToolResultEvent,
        cx: &ExtensionCx,
    ) -> Result<Option<ToolResultDecision>> {
        Ok(None)
    }

    async fn on_before_agent_start(
        &self,
        cx: &ExtensionCx,
    ) -> Result<Option<BeforeAgentStartDecision>> {
        Ok(None)
    }

    async fn on_context(
        &self,
        event: &ContextEvent,
        cx: &ExtensionCx,
    ) -> Result<Option<Vec<Message>>> {
        Ok(None)
    }

    async fn on_input(&self, event: &InputEvent, cx: &ExtensionCx) -> Result<InputAction> {
        Ok(InputAction::Continue)
    }

    async fn on_before_compact(&self, cx: &ExtensionCx) -> Result<Option<CompactDecision>> {
        Ok(None)
    }

    async fn on_before_switch(
        &self,
        target_session: &str,
        cx: &ExtensionCx,
    ) -> Result<Option<CancelDecision>> {
        Ok(None)
    }

    async fn on_before_fork(
        &self,
        fork_entry_id: &str,
        cx: &ExtensionCx,
    ) -> Result<Option<CancelDecision>> {
        Ok(None)
    }

    async fn on_shutdown(&self, cx: &ExtensionCx) -> Result<()> {
        Ok(())
    }
}

/// Outcome of merged `tool_call` dispatch.
#[derive(Debug, Clone, Default)]
pub struct MergedToolCallDecision {
    pub block: bool,
    pub reason: Option<String>,
}

/// Outcome of merged `before_agent_start` dispatch.
#[derive(Debug, Clone, Default)]
pub struct MergedBeforeAgentStart {
    /// Injected user messages, in registration order.
    pub messages: Vec<String>,
    /// Final chained system prompt replacement.
    pub system_prompt: Option<String>,
}

/// Outcome of merged `input` dispatch.
#[derive(Debug, Clone)]
pub enum MergedInput {
    Handled,
    Continue {
        text: String,
        images: Vec<crate::model::ImageContent>,
    },
}

type ErrorSink = Arc<dyn Fn(ExtensionErrorReport) + Send + Sync>;

/// The extension bus.
pub struct ExtensionBus {
    extensions: Vec<Arc<dyn Extension>>,
    cx: ExtensionCx,
    error_sink: ErrorSink,
}

impl ExtensionBus {
    pub fn new(
        extensions: Vec<Arc<dyn Extension>>,
        cx: ExtensionCx,
        error_sink: ErrorSink,
    ) -> Self {
        Self {
            extensions,
            cx,
            error_sink,
        }
    }

    /// Bus with no extensions; every dispatch is a no-op.
    pub fn empty(ui: Arc<UiBridge>) -> Self {
        Self {
            extensions: Vec::new(),
            cx: ExtensionCx::new(ui),
            error_sink: Arc::new(|_| {}),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Bind the host action capabilities (late, once the scheduler exists).
    pub fn bind_actions(&self, actions: Arc<dyn HostActions>) {
        self.cx.actions.bind(actions);
    }

    /// Tools contributed by all extensions, in registration order.
    pub fn collect_tools(&self) -> Vec<Box<dyn Tool>> {
        self.extensions
            .iter()
            .flat_map(|ext| ext.tools())
            .collect()
    }

    fn report(&self, extension: &str, event: &str, error: &crate::error::Error) {
        tracing::warn!(extension, event, %error, "extension handler failed (fail-open)");
        (self.error_sink)(ExtensionErrorReport {
            extension: extension.to_string(),
            event: event.to_string(),
            error: error.to_string(),
        });
    }

    /// Deliver an observational lifecycle event to every handler.
    pub async fn dispatch_lifecycle(&self, event: &LifecycleEvent) {
        for ext in &self.extensions {
            if let Err(err) = ext.on_lifecycle(event, &self.cx).await {
                self.report(ext.name(), event.name(), &err);
            }
        }
    }

    /// `tool_call`: first `{block: true}` wins; remaining handlers still run
    /// for observation.
    pub async fn dispatch_tool_call(&self, event: &ToolCallEvent) -> MergedToolCallDecision {
        let mut merged = MergedToolCallDecision::default();
        for ext in &self.extensions {
            match ext.on_tool_call(event, &self.cx).await {
                Ok(Some(decision)) if decision.block && !merged.block => {
                    merged.block = true;
                    merged.reason = decision.reason;
                }
                Ok(_) => {}
                Err(err) => self.report(ext.name(), "tool_call", &err),
            }
        }
        merged
    }

    /// `tool_result`: later handlers see and can further modify the result.
    pub async fn dispatch_tool_result(&self, mut event: ToolResultEvent) -> ToolResultEvent {
        for ext in &self.extensions {
            match ext.on_tool_result(&event, &self.cx).await {
                Ok(Some(decision)) => {
                    if let Some(content) = decision.content {
                        event.content = content;
                    }
                    if let Some(details) = decision.details {
                        event.details = Some(details);
                    }
                    if let Some(is_error) = decision.is_error {
                        event.is_error = is_error;
                    }
                }
                Ok(None) => {}
                Err(err) => self.report(ext.name(), "tool_result", &err),
            }
        }
        event
    }

    /// `before_agent_start`: message injections accumulate; system prompt
    /// replacements chain.
    pub async fn dispatch_before_agent_start(&self) -> MergedBeforeAgentStart {
        let mut merged = MergedBeforeAgentStart::default();
        for ext in &self.extensions {
            match ext.on_before_agent_start(&self.cx).await {
                Ok(Some(decision)) => {
                    if let Some(message) = decision.message {
                        merged.messages.push(message);
                    }
                    if let Some(prompt) = decision.system_prompt {
                        merged.system_prompt = Some(prompt);
                    }
                }
                Ok(None) => {}
                Err(err) => self.report(ext.name(), "before_agent_start", &err),
            }
        }
        merged
    }

    /// `context`: handlers receive a deep copy of the outgoing messages and
    /// may return a replacement; replacements chain.
    pub async fn dispatch_context(
        &self,
        messages: Vec<Message>,
        system_prompt: Option<String>,
    ) -> Vec<Message> {
        let mut event = ContextEvent {
            messages,
            system_prompt,
        };
        for ext in &self.extensions {
            match ext.on_context(&event, &self.cx).await {
                Ok(Some(replacement)) => event.messages = replacement,
                Ok(None) => {}
                Err(err) => self.report(ext.name(), "context", &err),
            }
        }
        event.messages
    }

    /// `input`: `handled` (first wins) skips the agent; `transform` chains;
    /// `continue` passes through.
    pub async fn dispatch_input(
        &self,
        text: String,
        images: Vec<crate::model::ImageContent>,
    ) -> MergedInput {
        let mut event = InputEvent { text, images };
        for ext in &self.extensions {
            match ext.on_input(&event, &self.cx).await {
                Ok(InputAction::Handled) => return MergedInput::Handled,
                Ok(InputAction::Transform { text, images }) => {
                    event.text = text;
                    event.images = images;
                }
                Ok(InputAction::Continue) => {}
                Err(err) => self.report(ext.name(), "input", &err),
            }
        }
        MergedInput::Continue {
            text: event.text,
            images: event.images,
        }
    }

    /// `session_before_compact`: first cancel aborts; a supplied compaction
    /// from an earlier handler is kept.
    pub async fn dispatch_before_compact(&self) -> CompactDecision {
        let mut merged = CompactDecision::default();
        for ext in &self.extensions {
            match ext.on_before_compact(&self.cx).await {
                Ok(Some(decision)) => {
                    if decision.cancel {
                        merged.cancel = true;
                        return merged;
                    }
                    if merged.compaction.is_none() {
                        merged.compaction = decision.compaction;
                    }
                }
                Ok(None) => {}
                Err(err) => self.report(ext.name(), "session_before_compact", &err),
            }
        }
        merged
    }

    /// `session_before_switch`: first `{cancel: true}` aborts the switch.
    pub async fn dispatch_before_switch(&self, target_session: &str) -> CancelDecision {
        for ext in &self.extensions {
            match ext.on_before_switch(target_session, &self.cx).await {
                Ok(Some(decision)) if decision.cancel => return decision,
                Ok(_) => {}
                Err(err) => self.report(ext.name(), "session_before_switch", &err),
            }
        }
        CancelDecision::default()
    }

    /// `session_before_fork`: first `{cancel: true}` aborts the fork.
    pub async fn dispatch_before_fork(&self, fork_entry_id: &str) -> CancelDecision {
        for ext in &self.extensions {
            match ext.on_before_fork(fork_entry_id, &self.cx).await {
                Ok(Some(decision)) if decision.cancel => return decision,
                Ok(_) => {}
                Err(err) => self.report(ext.name(), "session_before_fork", &err),
            }
        }
        CancelDecision::default()
    }

    /// `session_shutdown`, delivered during teardown.
    pub async fn dispatch_shutdown(&self) {
        for ext in &self.extensions {
            if let Err(err) = ext.on_shutdown(&self.cx).await {
                self.report(ext.name(), "session_shutdown", &err);
            }
        }
    }
}
