//! LLM provider abstraction layer.
//!
//! The scheduler only depends on the trait and types here; concrete wire
//! dialects live in [`crate::providers`].

use crate::model::{Message, StreamEvent, ThinkingLevel};
use async_trait::async_trait;
use serde::Serialize;
use std::pin::Pin;

/// A boxed stream of provider events.
pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = crate::error::Result<StreamEvent>> + Send>>;

/// A provider for streaming LLM completions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g. `anthropic`).
    fn name(&self) -> &str;

    /// Model identifier used by this provider.
    fn model_id(&self) -> &str;

    /// Context window in tokens for the configured model.
    fn context_window(&self) -> u32;

    /// Stream a completion for the given request.
    async fn stream(&self, request: &Request, options: &StreamOptions)
        -> crate::error::Result<EventStream>;
}

/// A completion request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

/// A tool definition handed to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: serde_json::Value,
}

/// Options for a streaming completion.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub thinking_level: ThinkingLevel,
    pub session_id: Option<String>,
}

/// A catalog entry describing a known model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// Dollars per million input tokens.
    pub input_cost: f64,
    /// Dollars per million output tokens.
    pub output_cost: f64,
}

impl ModelSpec {
    /// Cost in dollars for a token count breakdown.
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, input: u64, output: u64) -> f64 {
        (self.input_cost / 1_000_000.0) * input as f64
            + (self.output_cost / 1_000_000.0) * output as f64
    }
}

/// Known models, in cycling order.
pub const MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-sonnet-4-20250514",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 64_000,
        input_cost: 3.0,
        output_cost: 15.0,
    },
    ModelSpec {
        id: "claude-opus-4-20250514",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 32_000,
        input_cost: 15.0,
        output_cost: 75.0,
    },
    ModelSpec {
        id: "claude-haiku-3-5-20241022",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 8_192,
        input_cost: 0.8,
        output_cost: 4.0,
    },
];

/// Look up a catalog entry.
pub fn find_model(provider: &str, model_id: &str) -> Option<&'static ModelSpec> {
    MODEL_CATALOG
        .iter()
        .find(|spec| spec.provider == provider && spec.id == model_id)
}

/// The catalog entry after the given model, wrapping around.
pub fn next_model(current_id: &str) -> &'static ModelSpec {
    let idx = MODEL_CATALOG
        .iter()
        .position(|spec| spec.id == current_id)
        .map_or(0, |i| (i + 1) % MODEL_CATALOG.len());
    &MODEL_CATALOG[idx]
}
