//! Compaction engine: summarize a branch prefix to reclaim context budget.
//!
//! The cut point is found by scanning from the leaf backwards, accumulating
//! estimated token counts until `keep_recent_tokens` is retained, then
//! aligning to a user-turn boundary so a tool call is never separated from
//! its result. The prefix is summarized with a dedicated LLM call (or a
//! summary supplied by an extension) and recorded as a compaction entry.

use crate::error::{Error, Result};
use crate::model::{ContentBlock, Message, StreamEvent, UserContent};
use crate::provider::{Provider, Request, StreamOptions};
use crate::session::{Session, SessionEntry};
use futures::StreamExt;
use std::fmt::Write as _;
use std::sync::Arc;

/// Rough token estimate: ~3 characters per token.
const CHARS_PER_TOKEN_ESTIMATE: u64 = 3;

/// Fixed token estimate per image block.
const IMAGE_TOKEN_ESTIMATE: u64 = 1200;

/// Compaction tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CompactionSettings {
    /// Tokens of recent conversation to keep verbatim.
    pub keep_recent_tokens: u64,
    /// Tokens reserved for the summarization response.
    pub reserve_tokens: u32,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            keep_recent_tokens: 30_000,
            reserve_tokens: 16_384,
        }
    }
}

/// Result of a completed compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub entry_id: String,
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    /// Supplied directly by an extension instead of an LLM call.
    pub from_extension: bool,
}

// ============================================================================
// Token estimation
// ============================================================================

fn estimate_blocks(blocks: &[ContentBlock]) -> u64 {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => text.text.len() as u64 / CHARS_PER_TOKEN_ESTIMATE,
            ContentBlock::Reasoning(reasoning) => {
                reasoning.reasoning.len() as u64 / CHARS_PER_TOKEN_ESTIMATE
            }
            ContentBlock::Image(_) => IMAGE_TOKEN_ESTIMATE,
            ContentBlock::ToolCall(call) => {
                call.arguments.to_string().len() as u64 / CHARS_PER_TOKEN_ESTIMATE
            }
        })
        .sum()
}

/// Estimate the token footprint of one message.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    match message {
        Message::User(user) => match &user.content {
            UserContent::Text(text) => text.len() as u64 / CHARS_PER_TOKEN_ESTIMATE,
            UserContent::Blocks(blocks) => estimate_blocks(blocks),
        },
        Message::Assistant(assistant) => estimate_blocks(&assistant.content),
        Message::ToolResult(result) => estimate_blocks(&result.content),
        Message::System(system) => system.content.len() as u64 / CHARS_PER_TOKEN_ESTIMATE,
    }
}

fn entry_tokens(entry: &SessionEntry) -> u64 {
    match entry {
        SessionEntry::Message(message) => estimate_message_tokens(&message.message),
        SessionEntry::Compaction(compaction) => {
            compaction.summary.len() as u64 / CHARS_PER_TOKEN_ESTIMATE
        }
        _ => 0,
    }
}

/// Estimate the token footprint of a whole branch.
pub fn estimate_branch_tokens(branch: &[&SessionEntry]) -> u64 {
    branch.iter().map(|e| entry_tokens(e)).sum()
}

// ============================================================================
// Cut point
// ============================================================================

fn is_user_turn_start(entry: &SessionEntry) -> bool {
    matches!(
        entry,
        SessionEntry::Message(message) if matches!(message.message, Message::User(_))
    )
}

/// Pick `first_kept_entry_id` for the active branch.
///
/// Returns `None` when there is no prefix worth compacting (everything fits
/// in the keep budget, or the kept region would start at the root anyway).
pub fn find_cut_point(branch: &[&SessionEntry], keep_recent_tokens: u64) -> Option<String> {
    if branch.len() < 2 {
        return None;
    }

    // Accumulate from the leaf backwards until the keep budget is spent.
    let mut kept_tokens = 0u64;
    let mut cut_index = branch.len();
    for (idx, entry) in branch.iter().enumerate().rev() {
        let tokens = entry_tokens(entry);
        if kept_tokens + tokens > keep_recent_tokens {
            break;
        }
        kept_tokens += tokens;
        cut_index = idx;
    }

    if cut_index == 0 {
        return None; // whole branch fits
    }
    if cut_index >= branch.len() {
        // Even the leaf alone exceeds the budget; keep just the leaf.
        cut_index = branch.len() - 1;
    }

    // Align backwards to the user turn that started the kept region, so an
    // assistant message is never separated from its tool results.
    while cut_index > 0 && !is_user_turn_start(branch[cut_index]) {
        cut_index -= 1;
    }
    if cut_index == 0 {
        return None;
    }

    Some(branch[cut_index].id().to_string())
}

// ============================================================================
// Summarization
// ============================================================================

const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. Read the conversation between a user and an AI coding assistant, then produce a structured summary following the exact format specified. Do NOT continue the conversation. ONLY output the structured summary.";

const SUMMARIZATION_PROMPT: &str = "The messages above are a conversation to summarize. Create a structured context checkpoint summary that another LLM will use to continue the work.\n\nUse this EXACT format:\n\n## Goal\n[What is the user trying to accomplish?]\n\n## Progress\n### Done\n- [x] [Completed work]\n\n### In Progress\n- [ ] [Current work]\n\n## Key Decisions\n- **[Decision]**: [Brief rationale]\n\n## Next Steps\n1. [What should happen next]\n\n## Critical Context\n- [Data, paths, or references needed to continue]\n\nKeep each section concise. Preserve exact file paths, function names, and error messages.";

fn serialize_conversation(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        match message {
            Message::User(user) => {
                let _ = write!(out, "[User]\n{}", user.content.to_text());
            }
            Message::Assistant(assistant) => {
                let _ = write!(out, "[Assistant]\n{}", assistant.text());
                for call in assistant.tool_calls() {
                    let _ = write!(out, "\n[Tool call: {} {}]", call.name, call.arguments);
                }
            }
            Message::ToolResult(result) => {
                let mut text = String::new();
                for block in &result.content {
                    if let ContentBlock::Text(t) = block {
                        text.push_str(&t.text);
                    }
                }
                let _ = write!(out, "[Tool result: {}]\n{}", result.tool_name, text);
            }
            Message::System(system) => {
                let _ = write!(out, "[System]\n{}", system.content);
            }
        }
    }
    out
}

async fn generate_summary(
    provider: Arc<dyn Provider>,
    options: &StreamOptions,
    prefix: &[Message],
    custom_instructions: Option<&str>,
    settings: CompactionSettings,
) -> Result<String> {
    let conversation = serialize_conversation(prefix);
    let mut prompt_text = format!("<conversation>\n{conversation}\n</conversation>\n\n");
    prompt_text.push_str(SUMMARIZATION_PROMPT);
    if let Some(custom) = custom_instructions.filter(|s| !s.trim().is_empty()) {
        let _ = write!(prompt_text, "\n\nAdditional focus: {custom}");
    }

    let request = Request {
        system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user_text(prompt_text)],
        tools: Vec::new(),
    };
    let options = StreamOptions {
        max_tokens: Some(settings.reserve_tokens),
        ..options.clone()
    };

    let mut stream = provider.stream(&request, &options).await?;
    let mut final_message = None;
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Done { message } => final_message = Some(message),
            StreamEvent::Error { error } => {
                return Err(Error::provider(
                    provider.name(),
                    error
                        .error_message
                        .unwrap_or_else(|| "summarization error".to_string()),
                ));
            }
            _ => {}
        }
    }

    let message =
        final_message.ok_or_else(|| Error::provider(provider.name(), "stream ended early"))?;
    let text = message.text();
    if text.trim().is_empty() {
        return Err(Error::provider(
            provider.name(),
            "summarization returned empty text",
        ));
    }
    Ok(text)
}

// ============================================================================
// Public API
// ============================================================================

/// Run compaction on the session's active branch.
///
/// The `session_before_compact` decision is dispatched by the caller
/// (without holding the session) and passed in; pass the default decision
/// when no extension bus is attached. Returns `Ok(None)` when there is
/// nothing to compact or the decision cancelled the operation.
pub async fn compact(
    session: &mut Session,
    provider: Arc<dyn Provider>,
    options: &StreamOptions,
    settings: CompactionSettings,
    custom_instructions: Option<&str>,
    decision: crate::extension_events::CompactDecision,
) -> Result<Option<CompactionOutcome>> {
    if decision.cancel {
        tracing::debug!("compaction cancelled by extension");
        return Ok(None);
    }

    let tokens_before = estimate_branch_tokens(&session.branch());

    if let Some(supplied) = decision.compaction {
        if supplied.summary.trim().is_empty() {
            return Err(Error::validation(
                "extension-supplied compaction summary is empty",
            ));
        }
        let on_branch = session
            .branch()
            .iter()
            .any(|entry| entry.id() == supplied.first_kept_entry_id);
        if !on_branch {
            return Err(Error::validation(format!(
                "extension-supplied firstKeptEntryId '{}' is not on the active branch",
                supplied.first_kept_entry_id
            )));
        }
        let tokens_after = supplied.summary.len() as u64 / CHARS_PER_TOKEN_ESTIMATE;
        let entry_id = session.append_compaction(
            supplied.summary.clone(),
            supplied.first_kept_entry_id.clone(),
            tokens_before,
            tokens_after,
        )?;
        return Ok(Some(CompactionOutcome {
            entry_id,
            summary: supplied.summary,
            first_kept_entry_id: supplied.first_kept_entry_id,
            tokens_before,
            tokens_after,
            from_extension: true,
        }));
    }

    let branch = session.branch();
    let Some(first_kept_entry_id) = find_cut_point(&branch, settings.keep_recent_tokens) else {
        return Ok(None);
    };

    // Materialize the prefix (everything before the first kept entry).
    let mut prefix = Vec::new();
    for entry in &branch {
        if entry.id() == first_kept_entry_id {
            break;
        }
        if let SessionEntry::Message(message) = entry {
            prefix.push(message.message.clone());
        }
    }
    drop(branch);
    if prefix.is_empty() {
        return Ok(None);
    }

    let summary =
        generate_summary(provider, options, &prefix, custom_instructions, settings).await?;

    let kept_tokens: u64 = session
        .branch()
        .iter()
        .skip_while(|entry| entry.id() != first_kept_entry_id)
        .map(|e| entry_tokens(e))
        .sum();
    let tokens_after = kept_tokens + summary.len() as u64 / CHARS_PER_TOKEN_ESTIMATE;

    let entry_id = session.append_compaction(
        summary.clone(),
        first_kept_entry_id.clone(),
        tokens_before,
        tokens_after,
    )?;
    tracing::info!(tokens_before, tokens_after, "compacted session branch");

    Ok(Some(CompactionOutcome {
        entry_id,
        summary,
        first_kept_entry_id,
        tokens_before,
        tokens_after,
        from_extension: false,
    }))
}
