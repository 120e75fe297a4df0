//! Anthropic Messages API adapter.
//!
//! Maps the Messages streaming dialect (SSE over HTTP) into the scheduler's
//! [`StreamEvent`] sequence. Content block indexes from the wire are used
//! directly as content indexes on the assembled assistant message.

use crate::error::{Error, Result};
use crate::model::{
    AssistantMessage, ContentBlock, Message, ReasoningContent, StopReason, StreamEvent,
    TextContent, ToolCall, Usage, UserContent,
};
use crate::provider::{EventStream, ModelSpec, Provider, Request, StreamOptions};
use crate::sse::SseParser;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    model_id: String,
    context_window: u32,
    max_output_tokens: u32,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(spec: &ModelSpec) -> Self {
        Self {
            client: reqwest::Client::new(),
            model_id: spec.id.to_string(),
            context_window: spec.context_window,
            max_output_tokens: spec.max_output_tokens,
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| API_URL.to_string()),
        }
    }

    fn build_body(&self, request: &Request, options: &StreamOptions) -> Value {
        let mut body = json!({
            "model": self.model_id,
            "max_tokens": options.max_tokens.unwrap_or(self.max_output_tokens),
            "stream": true,
            "messages": convert_messages(&request.messages),
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect(),
            );
        }
        let budget = options.thinking_level.default_budget();
        if budget > 0 {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn stream(&self, request: &Request, options: &StreamOptions) -> Result<EventStream> {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| Error::auth("no API key for anthropic (set ANTHROPIC_API_KEY)"))?;

        let body = self.build_body(request, options);
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or(text);
            return Err(Error::api(status.as_u16(), message));
        }

        let provider = self.name().to_string();
        let model = self.model_id.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut assembler = MessageAssembler::new(provider, model);

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(Error::Http(err))).await;
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk).into_owned();
                for sse_event in parser.feed(&text) {
                    for event in assembler.ingest(&sse_event.event, &sse_event.data) {
                        let done = matches!(event, Ok(StreamEvent::Done { .. }));
                        if tx.send(event).await.is_err() || done {
                            break 'read;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ============================================================================
// Wire conversion
// ============================================================================

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for message in messages {
        match message {
            Message::User(user) => {
                let content = match &user.content {
                    UserContent::Text(text) => json!(text),
                    UserContent::Blocks(blocks) => json!(blocks
                        .iter()
                        .filter_map(convert_block)
                        .collect::<Vec<_>>()),
                };
                out.push(json!({ "role": "user", "content": content }));
            }
            Message::System(system) => {
                // The Messages API has no system role mid-conversation;
                // synthetic context rides as a user message.
                out.push(json!({ "role": "user", "content": system.content }));
            }
            Message::Assistant(assistant) => {
                let blocks: Vec<Value> = assistant
                    .content
                    .iter()
                    .filter_map(convert_block)
                    .collect();
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Message::ToolResult(result) => {
                let mut text = String::new();
                for block in &result.content {
                    if let ContentBlock::Text(t) = block {
                        text.push_str(&t.text);
                    }
                }
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": result.tool_call_id,
                        "content": text,
                        "is_error": result.is_error,
                    }],
                }));
            }
        }
    }
    out
}

fn convert_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text(text) => Some(json!({ "type": "text", "text": text.text })),
        ContentBlock::Reasoning(reasoning) => Some(json!({
            "type": "thinking",
            "thinking": reasoning.reasoning,
            "signature": reasoning.signature.clone().unwrap_or_default(),
        })),
        ContentBlock::Image(image) => Some(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            },
        })),
        ContentBlock::ToolCall(call) => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        })),
    }
}

// ============================================================================
// Stream assembly
// ============================================================================

/// Assembles wire events into [`StreamEvent`]s and the final message.
struct MessageAssembler {
    message: AssistantMessage,
    /// Accumulated tool_use JSON fragments per content index.
    tool_json: std::collections::HashMap<usize, String>,
    stop_reason: Option<String>,
}

impl MessageAssembler {
    fn new(provider: String, model: String) -> Self {
        Self {
            message: AssistantMessage {
                content: Vec::new(),
                provider,
                model,
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            tool_json: std::collections::HashMap::new(),
            stop_reason: None,
        }
    }

    fn ingest(&mut self, event: &str, data: &str) -> Vec<Result<StreamEvent>> {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return Vec::new(), // ping payloads etc.
        };

        match event {
            "message_start" => {
                if let Some(usage) = parsed.pointer("/message/usage") {
                    self.merge_usage(usage);
                }
                vec![Ok(StreamEvent::Start {
                    partial: self.message.clone(),
                })]
            }
            "content_block_start" => {
                let index = index_of(&parsed);
                let block = &parsed["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        self.ensure_block(index, ContentBlock::Text(TextContent::new("")));
                        Vec::new()
                    }
                    Some("thinking") => {
                        self.ensure_block(
                            index,
                            ContentBlock::Reasoning(ReasoningContent {
                                reasoning: String::new(),
                                signature: None,
                            }),
                        );
                        Vec::new()
                    }
                    Some("tool_use") => {
                        self.ensure_block(
                            index,
                            ContentBlock::ToolCall(ToolCall {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                arguments: Value::Null,
                            }),
                        );
                        self.tool_json.insert(index, String::new());
                        vec![Ok(StreamEvent::ToolCallStart {
                            content_index: index,
                        })]
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let index = index_of(&parsed);
                let delta = &parsed["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        if let Some(ContentBlock::Text(block)) = self.message.content.get_mut(index)
                        {
                            block.text.push_str(&text);
                        }
                        vec![Ok(StreamEvent::TextDelta {
                            content_index: index,
                            delta: text,
                        })]
                    }
                    Some("thinking_delta") => {
                        let text = delta["thinking"].as_str().unwrap_or_default().to_string();
                        if let Some(ContentBlock::Reasoning(block)) =
                            self.message.content.get_mut(index)
                        {
                            block.reasoning.push_str(&text);
                        }
                        vec![Ok(StreamEvent::ReasoningDelta {
                            content_index: index,
                            delta: text,
                        })]
                    }
                    Some("input_json_delta") => {
                        if let Some(buf) = self.tool_json.get_mut(&index) {
                            buf.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        Vec::new()
                    }
                    Some("signature_delta") => {
                        if let Some(ContentBlock::Reasoning(block)) =
                            self.message.content.get_mut(index)
                        {
                            let signature = block.signature.get_or_insert_with(String::new);
                            signature.push_str(delta["signature"].as_str().unwrap_or_default());
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = index_of(&parsed);
                if let Some(fragment) = self.tool_json.remove(&index) {
                    let arguments = if fragment.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&fragment).unwrap_or(json!({}))
                    };
                    if let Some(ContentBlock::ToolCall(call)) = self.message.content.get_mut(index)
                    {
                        call.arguments = arguments;
                        return vec![Ok(StreamEvent::ToolCallEnd {
                            content_index: index,
                            tool_call: call.clone(),
                        })];
                    }
                }
                Vec::new()
            }
            "message_delta" => {
                if let Some(reason) = parsed.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = parsed.get("usage") {
                    self.merge_usage(usage);
                }
                vec![Ok(StreamEvent::UsageUpdate {
                    usage: self.message.usage.clone(),
                })]
            }
            "message_stop" => {
                self.message.stop_reason = match self.stop_reason.as_deref() {
                    Some("tool_use") => StopReason::ToolUse,
                    Some("max_tokens") => StopReason::Length,
                    _ => StopReason::Stop,
                };
                vec![Ok(StreamEvent::Done {
                    message: self.message.clone(),
                })]
            }
            "error" => {
                let message = parsed
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("provider stream error")
                    .to_string();
                let mut error = self.message.clone();
                error.stop_reason = StopReason::Error;
                error.error_message = Some(message);
                vec![Ok(StreamEvent::Error { error })]
            }
            _ => Vec::new(),
        }
    }

    fn ensure_block(&mut self, index: usize, block: ContentBlock) {
        if index == self.message.content.len() {
            self.message.content.push(block);
        }
    }

    fn merge_usage(&mut self, usage: &Value) {
        let read = |key: &str| usage.get(key).and_then(Value::as_u64);
        if let Some(input) = read("input_tokens") {
            self.message.usage.input = input;
        }
        if let Some(output) = read("output_tokens") {
            self.message.usage.output = output;
        }
        if let Some(cache_read) = read("cache_read_input_tokens") {
            self.message.usage.cache_read = cache_read;
        }
        if let Some(cache_write) = read("cache_creation_input_tokens") {
            self.message.usage.cache_write = cache_write;
        }
        let u = &mut self.message.usage;
        u.total_tokens = u.input + u.output + u.cache_read + u.cache_write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(assembler: &mut MessageAssembler, event: &str, data: &str) -> Vec<StreamEvent> {
        assembler
            .ingest(event, data)
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn assembles_text_message() {
        let mut assembler = MessageAssembler::new("anthropic".into(), "test".into());
        drain(
            &mut assembler,
            "message_start",
            r#"{"message":{"usage":{"input_tokens":10}}}"#,
        );
        drain(
            &mut assembler,
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"text","text":""}}"#,
        );
        drain(
            &mut assembler,
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
        );
        drain(
            &mut assembler,
            "message_delta",
            r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
        );
        let done = drain(&mut assembler, "message_stop", "{}");
        match &done[0] {
            StreamEvent::Done { message } => {
                assert_eq!(message.text(), "hello");
                assert_eq!(message.usage.input, 10);
                assert_eq!(message.usage.output, 5);
                assert_eq!(message.stop_reason, StopReason::Stop);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn assembles_tool_call_from_json_fragments() {
        let mut assembler = MessageAssembler::new("anthropic".into(), "test".into());
        drain(&mut assembler, "message_start", r#"{"message":{}}"#);
        drain(
            &mut assembler,
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"tool_use","id":"t1","name":"bash"}}"#,
        );
        drain(
            &mut assembler,
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"comm"}}"#,
        );
        drain(
            &mut assembler,
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"and\":\"ls\"}"}}"#,
        );
        let end = drain(&mut assembler, "content_block_stop", r#"{"index":0}"#);
        match &end[0] {
            StreamEvent::ToolCallEnd { tool_call, .. } => {
                assert_eq!(tool_call.id, "t1");
                assert_eq!(tool_call.name, "bash");
                assert_eq!(tool_call.arguments["command"], "ls");
            }
            _ => panic!("expected ToolCallEnd"),
        }

        drain(
            &mut assembler,
            "message_delta",
            r#"{"delta":{"stop_reason":"tool_use"}}"#,
        );
        let done = drain(&mut assembler, "message_stop", "{}");
        match &done[0] {
            StreamEvent::Done { message } => {
                assert_eq!(message.stop_reason, StopReason::ToolUse);
                assert_eq!(message.tool_calls().len(), 1);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn error_event_surfaces_message() {
        let mut assembler = MessageAssembler::new("anthropic".into(), "test".into());
        let events = drain(
            &mut assembler,
            "error",
            r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        match &events[0] {
            StreamEvent::Error { error } => {
                assert_eq!(error.error_message.as_deref(), Some("Overloaded"));
                assert_eq!(error.stop_reason, StopReason::Error);
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn tool_results_ride_as_user_messages() {
        let messages = vec![Message::ToolResult(crate::model::ToolResultMessage {
            tool_call_id: "t1".to_string(),
            tool_name: "read".to_string(),
            content: vec![ContentBlock::Text(TextContent::new("file contents"))],
            details: None,
            is_error: false,
            timestamp: 0,
        })];
        let wire = convert_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "t1");
    }
}

fn index_of(parsed: &Value) -> usize {
    parsed["index"].as_u64().unwrap_or(0) as usize
}
