//! Agent turn scheduler.
//!
//! One cooperative state machine per session drives a user prompt through
//! LLM streaming, tool execution, and result assembly:
//!
//! 1. Receive user input (or queued steer/follow-up messages)
//! 2. Materialize the active branch + tool schemas into a request
//! 3. Stream the completion, piping deltas to observers
//! 4. Execute tool calls sequentially, append results
//! 5. If any tool ran, loop to 2; otherwise drain follow-ups or go idle
//!
//! Steering cancels the in-flight tool, drops the remaining calls, and
//! restarts the stream with the steer message as user input; abort cancels
//! the stream and the running tool while persisting the partial assistant
//! message. Context overflow triggers compaction and a single retry;
//! transient provider errors retry with exponential backoff.

use crate::compaction::{self, CompactionSettings};
use crate::error::{Error, Result};
use crate::extension_events::{ExtensionErrorReport, LifecycleEvent, ToolCallEvent, ToolResultEvent};
use crate::extensions::ExtensionBus;
use crate::model::{
    AssistantDelta, AssistantMessage, ContentBlock, Message, ReasoningContent, StopReason,
    StreamEvent, TextContent, ToolCall, ToolResultMessage, Usage,
};
use crate::provider::{Provider, Request, StreamOptions};
use crate::session::Session;
use crate::tools::{ToolOutput, ToolRegistry, ToolUpdate};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, Notify};

// ============================================================================
// Abort signalling
// ============================================================================

/// Handle to request an abort of an in-flight run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

/// Signal for observing abort requests.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    /// Create a new handle + signal pair.
    #[must_use]
    pub fn new() -> (Self, AbortSignal) {
        let inner = Arc::new(AbortInner {
            aborted: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            AbortSignal { inner },
        )
    }

    /// Trigger the abort.
    pub fn abort(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }
}

impl AbortSignal {
    /// Whether an abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Wait until the abort fires (returns immediately if it already has).
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking the flag so a concurrent abort
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Delivery mode for queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Drain the whole queue at each delivery boundary.
    All,
    /// Deliver one queued message per boundary.
    OneAtATime,
}

impl QueueMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::OneAtATime => "one-at-a-time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "all" => Some(Self::All),
            "one-at-a-time" => Some(Self::OneAtATime),
            _ => None,
        }
    }
}

/// Steer and follow-up queues with their delivery modes.
#[derive(Debug)]
pub struct MessageQueue {
    steering: VecDeque<Message>,
    follow_up: VecDeque<Message>,
    /// Held until the next manual prompt; never triggers a turn by itself.
    next_turn: VecDeque<Message>,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
}

impl MessageQueue {
    pub const fn new(steering_mode: QueueMode, follow_up_mode: QueueMode) -> Self {
        Self {
            steering: VecDeque::new(),
            follow_up: VecDeque::new(),
            next_turn: VecDeque::new(),
            steering_mode,
            follow_up_mode,
        }
    }

    pub fn push_steering(&mut self, message: Message) {
        self.steering.push_back(message);
    }

    pub fn push_follow_up(&mut self, message: Message) {
        self.follow_up.push_back(message);
    }

    pub fn push_next_turn(&mut self, message: Message) {
        self.next_turn.push_back(message);
    }

    pub fn steering_len(&self) -> usize {
        self.steering.len()
    }

    pub fn follow_up_len(&self) -> usize {
        self.follow_up.len()
    }

    pub fn pending_len(&self) -> usize {
        self.steering.len() + self.follow_up.len() + self.next_turn.len()
    }

    pub fn drain_next_turn(&mut self) -> Vec<Message> {
        self.next_turn.drain(..).collect()
    }

    fn pop(queue: &mut VecDeque<Message>, mode: QueueMode) -> Vec<Message> {
        match mode {
            QueueMode::All => queue.drain(..).collect(),
            QueueMode::OneAtATime => queue.pop_front().into_iter().collect(),
        }
    }

    pub fn pop_steering(&mut self) -> Vec<Message> {
        Self::pop(&mut self.steering, self.steering_mode)
    }

    pub fn pop_follow_up(&mut self) -> Vec<Message> {
        Self::pop(&mut self.follow_up, self.follow_up_mode)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events emitted by the scheduler during execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    AgentStart { session_id: String },
    #[serde(rename_all = "camelCase")]
    AgentEnd {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
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
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageStart { message: Message },
    #[serde(rename_all = "camelCase")]
    MessageUpdate { delta: AssistantDelta },
    #[serde(rename_all = "camelCase")]
    MessageEnd { message: Message },
    #[serde(rename_all = "camelCase")]
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial: ToolUpdate,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolOutput,
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    AutoCompactionStart { reason: String },
    #[serde(rename_all = "camelCase")]
    AutoCompactionEnd {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    AutoRetryEnd { success: bool, attempt: u32 },
    ExtensionError(ExtensionErrorReport),
}

/// Observer callback for scheduler events.
pub type EventFn = Arc<dyn Fn(AgentEvent) + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^(attempt-1)`, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let multiplier = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub max_tool_iterations: usize,
    pub retry: RetryPolicy,
    pub compaction: CompactionSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tool_iterations: 50,
            retry: RetryPolicy::default(),
            compaction: CompactionSettings::default(),
        }
    }
}

/// Scheduler flags shared with the control plane.
#[derive(Debug, Default)]
pub struct SchedulerFlags {
    streaming: AtomicBool,
    compacting: AtomicBool,
    retry_abort: AtomicBool,
    pub auto_compaction: AtomicBool,
    pub auto_retry: AtomicBool,
}

impl SchedulerFlags {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    /// Claim the single turn slot. Fails if a turn is already active.
    fn try_begin_turn(&self) -> bool {
        self.streaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_turn(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub fn abort_retry(&self) {
        self.retry_abort.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Agent
// ============================================================================

/// The per-session scheduler: provider + tools + extension bus + log.
pub struct Agent {
    session: Arc<TokioMutex<Session>>,
    provider: StdMutex<Arc<dyn Provider>>,
    tools: ToolRegistry,
    bus: Arc<ExtensionBus>,
    config: StdMutex<AgentConfig>,
    stream_options: StdMutex<StreamOptions>,
    queue: Arc<StdMutex<MessageQueue>>,
    flags: Arc<SchedulerFlags>,
    abort_slot: Arc<StdMutex<Option<AbortHandle>>>,
    /// When set, only these tool names are offered to the model.
    active_tools: StdMutex<Option<HashSet<String>>>,
}

impl Agent {
    pub fn new(
        session: Session,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        bus: Arc<ExtensionBus>,
        config: AgentConfig,
        stream_options: StreamOptions,
    ) -> Self {
        Self {
            session: Arc::new(TokioMutex::new(session)),
            provider: StdMutex::new(provider),
            tools,
            bus,
            config: StdMutex::new(config),
            stream_options: StdMutex::new(stream_options),
            queue: Arc::new(StdMutex::new(MessageQueue::new(
                QueueMode::OneAtATime,
                QueueMode::OneAtATime,
            ))),
            flags: Arc::new(SchedulerFlags::default_with_auto()),
            abort_slot: Arc::new(StdMutex::new(None)),
            active_tools: StdMutex::new(None),
        }
    }

    /// Shared session handle for observers (read via short-lived locks).
    pub fn session(&self) -> Arc<TokioMutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Replace the session (e.g. `new_session` / `switch_session`).
    pub async fn replace_session(&self, session: Session) {
        *self.session.lock().await = session;
    }

    pub fn flags(&self) -> Arc<SchedulerFlags> {
        Arc::clone(&self.flags)
    }

    pub fn queue(&self) -> Arc<StdMutex<MessageQueue>> {
        Arc::clone(&self.queue)
    }

    pub fn bus(&self) -> Arc<ExtensionBus> {
        Arc::clone(&self.bus)
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.provider.lock().expect("provider lock"))
    }

    pub fn set_provider(&self, provider: Arc<dyn Provider>) {
        *self.provider.lock().expect("provider lock") = provider;
    }

    pub fn config(&self) -> AgentConfig {
        self.config.lock().expect("config lock").clone()
    }

    pub fn stream_options(&self) -> StreamOptions {
        self.stream_options.lock().expect("options lock").clone()
    }

    pub fn set_thinking_level(&self, level: crate::model::ThinkingLevel) {
        self.stream_options.lock().expect("options lock").thinking_level = level;
    }

    pub fn set_active_tools(&self, names: Option<Vec<String>>) {
        *self.active_tools.lock().expect("active tools lock") =
            names.map(|list| list.into_iter().collect());
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Abort the in-flight turn, if any.
    pub fn abort(&self) {
        self.flags.abort_retry();
        if let Some(handle) = self.abort_slot.lock().expect("abort lock").as_ref() {
            handle.abort();
        }
    }

    /// Queue a steer message; the in-flight tool is cancelled, remaining
    /// tool calls are dropped, and the stream restarts with this message
    /// as user input.
    pub fn queue_steering(&self, message: Message) {
        self.queue.lock().expect("queue lock").push_steering(message);
    }

    /// Queue a follow-up message, delivered when the turn runs to completion.
    pub fn queue_follow_up(&self, message: Message) {
        self.queue.lock().expect("queue lock").push_follow_up(message);
    }

    /// Queue a message held until the next manual prompt.
    pub fn queue_next_turn(&self, message: Message) {
        self.queue.lock().expect("queue lock").push_next_turn(message);
    }

    fn drain_steering(&self) -> Vec<Message> {
        self.queue.lock().expect("queue lock").pop_steering()
    }

    fn drain_follow_up(&self) -> Vec<Message> {
        self.queue.lock().expect("queue lock").pop_follow_up()
    }

    fn steering_pending(&self) -> bool {
        self.queue.lock().expect("queue lock").steering_len() > 0
    }

    fn tool_definitions(&self) -> Vec<crate::provider::ToolDef> {
        let filter = self.active_tools.lock().expect("active tools lock");
        self.tools
            .definitions()
            .into_iter()
            .filter(|def| filter.as_ref().is_none_or(|set| set.contains(&def.name)))
            .collect()
    }

    // ========================================================================
    // The prompt loop
    // ========================================================================

    /// Drive one prompt through the full turn cycle.
    ///
    /// Returns an error only for failures that cannot be represented as a
    /// turn-level event (e.g. session storage I/O); provider errors are
    /// reported through `turn_end`/`agent_end` payloads.
    pub async fn run_prompt(
        &self,
        prompt: Option<Message>,
        on_event: EventFn,
    ) -> Result<()> {
        if !self.flags.try_begin_turn() {
            return Err(Error::session("a turn is already active for this session"));
        }
        self.flags.retry_abort.store(false, Ordering::SeqCst);

        let (abort_handle, abort) = AbortHandle::new();
        *self.abort_slot.lock().expect("abort lock") = Some(abort_handle);

        let result = self.run_prompt_inner(prompt, &on_event, &abort).await;

        *self.abort_slot.lock().expect("abort lock") = None;
        self.flags.end_turn();
        result
    }

    async fn run_prompt_inner(
        &self,
        prompt: Option<Message>,
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> Result<()> {
        let session_id = self.session.lock().await.header.id.clone();

        // before_agent_start: injected messages + chained system prompt.
        let merged = self.bus.dispatch_before_agent_start().await;
        let system_prompt = merged
            .system_prompt
            .or_else(|| self.config().system_prompt);

        self.bus
            .dispatch_lifecycle(&LifecycleEvent::AgentStart {
                session_id: session_id.clone(),
            })
            .await;
        on_event(AgentEvent::AgentStart {
            session_id: session_id.clone(),
        });

        let mut first_messages: Vec<Message> = merged
            .messages
            .into_iter()
            .map(Message::user_text)
            .collect();
        // Messages parked with `nextTurn` ride along with this prompt.
        first_messages.extend(self.queue.lock().expect("queue lock").drain_next_turn());
        first_messages.extend(prompt);

        let mut agent_error: Option<String> = None;
        let mut turn_index = 0usize;
        let mut iterations = 0usize;
        // Delivery boundary: steer messages queued while idle.
        let mut pending = self.drain_steering();
        pending.splice(0..0, first_messages);

        'agent: loop {
            self.bus
                .dispatch_lifecycle(&LifecycleEvent::TurnStart {
                    session_id: session_id.clone(),
                    turn_index,
                })
                .await;
            on_event(AgentEvent::TurnStart {
                session_id: session_id.clone(),
                turn_index,
            });

            for message in std::mem::take(&mut pending) {
                self.append_and_emit(message, on_event).await?;
            }

            if abort.is_aborted() {
                self.finish_turn(&session_id, turn_index, Some("Aborted".to_string()), on_event)
                    .await;
                agent_error = Some("Aborted".to_string());
                break 'agent;
            }

            // Stream the assistant response, with overflow compaction and
            // transient-error retry wrapped around the call.
            let assistant = match self
                .stream_with_recovery(system_prompt.as_deref(), on_event, abort)
                .await
            {
                Ok(message) => message,
                Err(err) => {
                    let text = err.to_string();
                    self.finish_turn(&session_id, turn_index, Some(text.clone()), on_event)
                        .await;
                    agent_error = Some(text);
                    break 'agent;
                }
            };

            let tool_calls: Vec<ToolCall> =
                assistant.tool_calls().into_iter().cloned().collect();
            let assistant_failed = matches!(
                assistant.stop_reason,
                StopReason::Error | StopReason::Aborted
            );
            let assistant_error = assistant.error_message.clone();
            // Stream events already covered this message; append silently.
            self.session
                .lock()
                .await
                .append_message(Message::Assistant(assistant))?;

            if assistant_failed {
                self.finish_turn(&session_id, turn_index, assistant_error.clone(), on_event)
                    .await;
                agent_error = assistant_error;
                break 'agent;
            }

            let mut ran_tools = false;
            if !tool_calls.is_empty() {
                iterations += 1;
                let max_iterations = self.config().max_tool_iterations;
                if iterations > max_iterations {
                    let text = format!("Maximum tool iterations ({max_iterations}) exceeded");
                    self.finish_turn(&session_id, turn_index, Some(text.clone()), on_event)
                        .await;
                    agent_error = Some(text);
                    break 'agent;
                }

                ran_tools = true;
                let outcome = self
                    .execute_tool_calls(&tool_calls, on_event, abort)
                    .await?;

                if abort.is_aborted() {
                    self.finish_turn(
                        &session_id,
                        turn_index,
                        Some("Aborted".to_string()),
                        on_event,
                    )
                    .await;
                    agent_error = Some("Aborted".to_string());
                    break 'agent;
                }

                if let Some(steer) = outcome.steering {
                    // Steering: drop remaining work, restart with the steer
                    // messages as user input.
                    self.finish_turn(&session_id, turn_index, None, on_event).await;
                    turn_index += 1;
                    pending = steer;
                    continue 'agent;
                }
            }

            self.finish_turn(&session_id, turn_index, None, on_event).await;
            turn_index += 1;

            if ran_tools {
                // Tool results exist: continue the turn cycle.
                pending = self.drain_steering();
                continue 'agent;
            }

            // Natural completion: threshold compaction runs before any
            // queued follow-up turn starts.
            self.maybe_threshold_compact(on_event).await;

            let follow_up = self.drain_follow_up();
            if follow_up.is_empty() {
                break 'agent;
            }
            pending = follow_up;
        }

        self.bus
            .dispatch_lifecycle(&LifecycleEvent::AgentEnd {
                session_id: session_id.clone(),
                error: agent_error.clone(),
            })
            .await;
        on_event(AgentEvent::AgentEnd {
            session_id,
            error: agent_error,
        });
        Ok(())
    }

    async fn finish_turn(
        &self,
        session_id: &str,
        turn_index: usize,
        error: Option<String>,
        on_event: &EventFn,
    ) {
        self.bus
            .dispatch_lifecycle(&LifecycleEvent::TurnEnd {
                session_id: session_id.to_string(),
                turn_index,
                tool_results: Vec::new(),
            })
            .await;
        on_event(AgentEvent::TurnEnd {
            session_id: session_id.to_string(),
            turn_index,
            error,
        });
    }

    async fn append_and_emit(&self, message: Message, on_event: &EventFn) -> Result<()> {
        self.session.lock().await.append_message(message.clone())?;
        on_event(AgentEvent::MessageStart {
            message: message.clone(),
        });
        on_event(AgentEvent::MessageEnd { message });
        Ok(())
    }

    // ========================================================================
    // Streaming with recovery
    // ========================================================================

    async fn stream_with_recovery(
        &self,
        system_prompt: Option<&str>,
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> Result<AssistantMessage> {
        let mut compacted_for_overflow = false;
        let mut attempt = 0u32;
        let retry = self.config().retry;

        loop {
            match self.stream_once(system_prompt, on_event, abort).await {
                Ok(message) => {
                    if attempt > 0 {
                        on_event(AgentEvent::AutoRetryEnd {
                            success: true,
                            attempt,
                        });
                    }
                    return Ok(message);
                }
                Err(err) if err.is_context_overflow() && !compacted_for_overflow => {
                    compacted_for_overflow = true;
                    on_event(AgentEvent::AutoCompactionStart {
                        reason: "context overflow".to_string(),
                    });
                    let outcome = self.run_compaction(None).await;
                    match outcome {
                        Ok(Some(_)) => {
                            on_event(AgentEvent::AutoCompactionEnd {
                                success: true,
                                error: None,
                            });
                            // Retry the same turn once with the compacted branch.
                        }
                        Ok(None) => {
                            on_event(AgentEvent::AutoCompactionEnd {
                                success: false,
                                error: Some("nothing to compact".to_string()),
                            });
                            return Err(err);
                        }
                        Err(compact_err) => {
                            on_event(AgentEvent::AutoCompactionEnd {
                                success: false,
                                error: Some(compact_err.to_string()),
                            });
                            return Err(err);
                        }
                    }
                }
                Err(err)
                    if err.is_transient()
                        && self.flags.auto_retry.load(Ordering::SeqCst)
                        && attempt < retry.max_retries =>
                {
                    attempt += 1;
                    let delay_ms = retry.delay_ms(attempt);
                    on_event(AgentEvent::AutoRetryStart {
                        attempt,
                        max_attempts: retry.max_retries,
                        delay_ms,
                        error: err.to_string(),
                    });

                    let slept = tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
                        () = abort.wait() => false,
                        () = wait_retry_abort(&self.flags) => false,
                    };
                    if !slept {
                        on_event(AgentEvent::AutoRetryEnd {
                            success: false,
                            attempt,
                        });
                        return Err(Error::Aborted);
                    }
                }
                Err(err) => {
                    if attempt > 0 {
                        on_event(AgentEvent::AutoRetryEnd {
                            success: false,
                            attempt,
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Issue one streaming request and assemble the assistant message.
    ///
    /// An abort mid-stream yields an `Aborted` message carrying the partial
    /// content; the caller persists it.
    async fn stream_once(
        &self,
        system_prompt: Option<&str>,
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> Result<AssistantMessage> {
        let provider = self.provider();
        let options = self.stream_options();

        let messages = self.session.lock().await.materialize();
        // context hook: handlers see a deep copy and may replace the list.
        let messages = self
            .bus
            .dispatch_context(messages, system_prompt.map(str::to_string))
            .await;

        let request = Request {
            system_prompt: system_prompt.map(str::to_string),
            messages,
            tools: self.tool_definitions(),
        };

        let mut stream = provider.stream(&request, &options).await?;

        let mut partial = AssistantMessage {
            content: Vec::new(),
            provider: provider.name().to_string(),
            model: provider.model_id().to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let mut started = false;

        loop {
            let next = tokio::select! {
                event = stream.next() => event,
                () = abort.wait() => {
                    partial.stop_reason = StopReason::Aborted;
                    partial.error_message = Some("Aborted".to_string());
                    return Ok(partial);
                }
            };

            let Some(event) = next else {
                // Stream ended without Done; keep the partial as an error
                // result instead of dropping it.
                partial.stop_reason = StopReason::Error;
                partial.error_message = Some("stream ended without completion".to_string());
                return Ok(partial);
            };

            match event? {
                StreamEvent::Start { partial: start } => {
                    partial = start;
                    if !started {
                        started = true;
                        on_event(AgentEvent::MessageStart {
                            message: Message::Assistant(partial.clone()),
                        });
                        on_event(AgentEvent::MessageUpdate {
                            delta: AssistantDelta::Start,
                        });
                    }
                }
                StreamEvent::TextDelta {
                    content_index,
                    delta,
                } => {
                    if content_index == partial.content.len() {
                        partial.content.push(ContentBlock::Text(TextContent::new("")));
                    }
                    if let Some(ContentBlock::Text(text)) = partial.content.get_mut(content_index) {
                        text.text.push_str(&delta);
                    }
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::TextDelta {
                            content_index,
                            delta,
                        },
                    });
                }
                StreamEvent::ReasoningDelta {
                    content_index,
                    delta,
                } => {
                    if content_index == partial.content.len() {
                        partial.content.push(ContentBlock::Reasoning(ReasoningContent {
                            reasoning: String::new(),
                            signature: None,
                        }));
                    }
                    if let Some(ContentBlock::Reasoning(reasoning)) =
                        partial.content.get_mut(content_index)
                    {
                        reasoning.reasoning.push_str(&delta);
                    }
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::ReasoningDelta {
                            content_index,
                            delta,
                        },
                    });
                }
                StreamEvent::ToolCallStart { content_index } => {
                    if content_index == partial.content.len() {
                        partial.content.push(ContentBlock::ToolCall(ToolCall {
                            id: String::new(),
                            name: String::new(),
                            arguments: serde_json::Value::Null,
                        }));
                    }
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::ToolCallStart { content_index },
                    });
                }
                StreamEvent::ToolCallEnd {
                    content_index,
                    tool_call,
                } => {
                    if content_index == partial.content.len() {
                        partial
                            .content
                            .push(ContentBlock::ToolCall(tool_call.clone()));
                    } else if let Some(ContentBlock::ToolCall(slot)) =
                        partial.content.get_mut(content_index)
                    {
                        *slot = tool_call.clone();
                    }
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::ToolCallEnd {
                            content_index,
                            tool_call,
                        },
                    });
                }
                StreamEvent::UsageUpdate { usage } => {
                    partial.usage = usage.clone();
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::UsageUpdate { usage },
                    });
                }
                StreamEvent::Done { message } => {
                    on_event(AgentEvent::MessageUpdate {
                        delta: AssistantDelta::Done {
                            reason: message.stop_reason,
                        },
                    });
                    on_event(AgentEvent::MessageEnd {
                        message: Message::Assistant(message.clone()),
                    });
                    return Ok(message);
                }
                StreamEvent::Error { error } => {
                    on_event(AgentEvent::MessageEnd {
                        message: Message::Assistant(error.clone()),
                    });
                    return Ok(error);
                }
            }
        }
    }

    // ========================================================================
    // Tool execution
    // ========================================================================

    async fn execute_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> Result<ToolBatchOutcome> {
        let mut steering: Option<Vec<Message>> = None;

        for tool_call in tool_calls {
            on_event(AgentEvent::ToolExecutionStart {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_call.name.clone(),
                args: tool_call.arguments.clone(),
            });
        }

        for (index, tool_call) in tool_calls.iter().enumerate() {
            if abort.is_aborted() {
                // Abort: completed pairs are already persisted; remaining
                // calls get no results.
                return Ok(ToolBatchOutcome { steering: None });
            }

            if self.steering_pending() {
                steering = Some(self.drain_steering());
                self.skip_remaining(&tool_calls[index..], on_event).await?;
                return Ok(ToolBatchOutcome { steering });
            }

            // Tool-scoped cancellation: fires on turn abort or when a steer
            // message arrives mid-execution. The tool is still awaited; its
            // cancellation-marked result is persisted below.
            let (tool_cancel, cancel_signal) = AbortHandle::new();
            let watcher = {
                let tool_cancel = tool_cancel.clone();
                let abort = abort.clone();
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move {
                    loop {
                        let steer_pending =
                            queue.lock().expect("queue lock").steering_len() > 0;
                        if abort.is_aborted() || steer_pending {
                            tool_cancel.abort();
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                })
            };

            let (output, is_error) = self.execute_one(tool_call, on_event, &cancel_signal).await;
            watcher.abort();

            self.append_tool_result(tool_call, &output, is_error, on_event)
                .await?;

            if abort.is_aborted() {
                // Turn abort: stop without starting more tools; remaining
                // calls get no results.
                return Ok(ToolBatchOutcome { steering: None });
            }
        }

        // Catch steer messages that arrived during the last tool.
        if self.steering_pending() {
            steering = Some(self.drain_steering());
        }
        Ok(ToolBatchOutcome { steering })
    }

    async fn execute_one(
        &self,
        tool_call: &ToolCall,
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> (ToolOutput, bool) {
        // tool_call hook: first blocking handler wins.
        let decision = self
            .bus
            .dispatch_tool_call(&ToolCallEvent {
                tool_name: tool_call.name.clone(),
                tool_call_id: tool_call.id.clone(),
                input: tool_call.arguments.clone(),
            })
            .await;

        let (mut output, mut is_error) = if decision.block {
            let reason = decision
                .reason
                .filter(|r| !r.trim().is_empty())
                .map_or_else(
                    || "Tool execution was blocked by an extension".to_string(),
                    |reason| format!("Tool execution blocked: {reason}"),
                );
            (ToolOutput::error(reason), true)
        } else {
            self.execute_without_hooks(tool_call, on_event, abort).await
        };

        // tool_result hook: chained replacement supersedes the original.
        if !self.bus.is_empty() {
            let transformed = self
                .bus
                .dispatch_tool_result(ToolResultEvent {
                    tool_name: tool_call.name.clone(),
                    tool_call_id: tool_call.id.clone(),
                    input: tool_call.arguments.clone(),
                    content: output.content.clone(),
                    details: output.details.clone(),
                    is_error,
                })
                .await;
            output.content = transformed.content;
            output.details = transformed.details;
            is_error = transformed.is_error;
            output.is_error = is_error;
        }

        (output, is_error)
    }

    async fn execute_without_hooks(
        &self,
        tool_call: &ToolCall,
        on_event: &EventFn,
        abort: &AbortSignal,
    ) -> (ToolOutput, bool) {
        let Some(tool) = self.tools.get(&tool_call.name) else {
            return (
                ToolOutput::error(format!("Error: Tool '{}' not found", tool_call.name)),
                true,
            );
        };

        let update_events = Arc::clone(on_event);
        let call_id = tool_call.id.clone();
        let tool_name = tool_call.name.clone();
        let on_update: crate::tools::UpdateFn = Box::new(move |update: ToolUpdate| {
            update_events(AgentEvent::ToolExecutionUpdate {
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                partial: update,
            });
        });

        match tool
            .execute(
                &tool_call.id,
                tool_call.arguments.clone(),
                Some(on_update),
                abort,
            )
            .await
        {
            Ok(output) => {
                let is_error = output.is_error;
                (output, is_error)
            }
            Err(err) => (ToolOutput::error(format!("Error: {err}")), true),
        }
    }

    async fn append_tool_result(
        &self,
        tool_call: &ToolCall,
        output: &ToolOutput,
        is_error: bool,
        on_event: &EventFn,
    ) -> Result<()> {
        on_event(AgentEvent::ToolExecutionEnd {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            result: output.clone(),
            is_error,
        });
        let message = Message::ToolResult(ToolResultMessage {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            content: output.content.clone(),
            details: output.details.clone(),
            is_error,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        self.append_and_emit(message, on_event).await
    }

    async fn skip_remaining(
        &self,
        remaining: &[ToolCall],
        on_event: &EventFn,
    ) -> Result<()> {
        for tool_call in remaining {
            let output = ToolOutput::error("Skipped due to queued user message.");
            self.append_tool_result(tool_call, &output, true, on_event)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    async fn run_compaction(
        &self,
        custom_instructions: Option<&str>,
    ) -> Result<Option<compaction::CompactionOutcome>> {
        self.flags.compacting.store(true, Ordering::SeqCst);
        let provider = self.provider();
        let options = self.stream_options();
        let settings = self.config().compaction;
        // Dispatch the hook before taking the session lock; handlers may
        // use host actions that need it.
        let decision = self.bus.dispatch_before_compact().await;
        let mut session = self.session.lock().await;
        let result = compaction::compact(
            &mut session,
            provider,
            &options,
            settings,
            custom_instructions,
            decision,
        )
        .await;
        self.flags.compacting.store(false, Ordering::SeqCst);
        result
    }

    /// User-requested compaction.
    pub async fn compact_now(
        &self,
        custom_instructions: Option<&str>,
    ) -> Result<Option<compaction::CompactionOutcome>> {
        self.run_compaction(custom_instructions).await
    }

    /// Threshold maintenance at the end of a successful turn.
    async fn maybe_threshold_compact(&self, on_event: &EventFn) {
        if !self.flags.auto_compaction.load(Ordering::SeqCst) {
            return;
        }
        let settings = self.config().compaction;
        let window = u64::from(self.provider().context_window());
        let reserve = u64::from(settings.reserve_tokens);

        let used = {
            let session = self.session.lock().await;
            session
                .branch()
                .iter()
                .rev()
                .find_map(|entry| match entry {
                    crate::session::SessionEntry::Message(message) => match &message.message {
                        Message::Assistant(assistant) => {
                            Some(assistant.usage.context_tokens())
                        }
                        _ => None,
                    },
                    _ => None,
                })
                .unwrap_or(0)
        };

        if used <= window.saturating_sub(reserve) {
            return;
        }

        on_event(AgentEvent::AutoCompactionStart {
            reason: "context threshold".to_string(),
        });
        match self.run_compaction(None).await {
            Ok(outcome) => on_event(AgentEvent::AutoCompactionEnd {
                success: outcome.is_some(),
                error: None,
            }),
            Err(err) => on_event(AgentEvent::AutoCompactionEnd {
                success: false,
                error: Some(err.to_string()),
            }),
        }
    }

    /// Deliver `session_shutdown` to extensions and drop pending UI work.
    pub async fn shutdown(&self) {
        self.abort();
        self.bus.dispatch_shutdown().await;
    }
}

impl SchedulerFlags {
    fn default_with_auto() -> Self {
        let flags = Self::default();
        flags.auto_compaction.store(true, Ordering::SeqCst);
        flags.auto_retry.store(true, Ordering::SeqCst);
        flags
    }
}

/// Host action capabilities backed by the scheduler itself.
///
/// Holds a weak reference so the bus -> actions -> agent chain never forms
/// a cycle; actions become no-ops once the agent is gone.
pub struct AgentHostActions {
    agent: std::sync::Weak<Agent>,
}

impl AgentHostActions {
    pub fn new(agent: &Arc<Agent>) -> Self {
        Self {
            agent: Arc::downgrade(agent),
        }
    }
}

#[async_trait::async_trait]
impl crate::extensions::HostActions for AgentHostActions {
    async fn send_user_message(&self, text: String) {
        let Some(agent) = self.agent.upgrade() else {
            return;
        };
        let message = Message::user_text(text);
        if agent.flags.is_streaming() {
            agent.queue_follow_up(message);
        } else if let Err(err) = agent.session.lock().await.append_message(message) {
            tracing::warn!(%err, "extension send_user_message failed");
        }
    }

    async fn append_custom_entry(
        &self,
        custom_type: String,
        data: Option<serde_json::Value>,
    ) -> Result<String> {
        let Some(agent) = self.agent.upgrade() else {
            return Err(Error::session("session is shut down"));
        };
        let result = agent.session.lock().await.append_custom(custom_type, data);
        result
    }

    async fn set_model(&self, provider: String, model_id: String) -> Result<()> {
        let Some(agent) = self.agent.upgrade() else {
            return Err(Error::session("session is shut down"));
        };
        let spec = crate::provider::find_model(&provider, &model_id).ok_or_else(|| {
            Error::validation(format!("model not found: {provider}/{model_id}"))
        })?;
        agent.set_provider(crate::providers::create_provider(spec)?);
        Ok(())
    }

    async fn set_active_tools(&self, names: Option<Vec<String>>) {
        if let Some(agent) = self.agent.upgrade() {
            agent.set_active_tools(names);
        }
    }
}

async fn wait_retry_abort(flags: &SchedulerFlags) {
    loop {
        if flags.retry_abort.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

struct ToolBatchOutcome {
    steering: Option<Vec<Message>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
        assert_eq!(policy.delay_ms(4), 500);
        assert_eq!(policy.delay_ms(30), 500);
    }

    #[test]
    fn queue_modes() {
        let mut queue = MessageQueue::new(QueueMode::All, QueueMode::OneAtATime);
        queue.push_steering(Message::user_text("a"));
        queue.push_steering(Message::user_text("b"));
        assert_eq!(queue.pop_steering().len(), 2);
        assert_eq!(queue.pop_steering().len(), 0);

        queue.push_follow_up(Message::user_text("a"));
        queue.push_follow_up(Message::user_text("b"));
        assert_eq!(queue.pop_follow_up().len(), 1);
        assert_eq!(queue.pop_follow_up().len(), 1);
        assert_eq!(queue.pop_follow_up().len(), 0);
    }

    #[tokio::test]
    async fn abort_signal_wakes_waiters() {
        let (handle, signal) = AbortHandle::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.wait().await;
                true
            })
        };
        handle.abort();
        assert!(waiter.await.unwrap());
        assert!(signal.is_aborted());
    }

    #[test]
    fn single_turn_slot() {
        let flags = SchedulerFlags::default_with_auto();
        assert!(flags.try_begin_turn());
        assert!(!flags.try_begin_turn());
        flags.end_turn();
        assert!(flags.try_begin_turn());
    }
}
