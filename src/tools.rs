//! Built-in tool implementations.
//!
//! Plover ships 7 built-in tools: read, bash, edit, write, grep, find, ls.
//! Tools are exposed to the model via JSON Schema (see
//! [`crate::provider::ToolDef`]) and executed locally by the turn scheduler.
//!
//! Every tool truncates the content returned to the model at
//! [`DEFAULT_MAX_LINES`] lines or [`DEFAULT_MAX_BYTES`] bytes, whichever is
//! hit first; past that, tools return the head/tail plus a path to the full
//! output on disk.

use crate::agent::AbortSignal;
use crate::error::{Error, Result};
use crate::model::{ContentBlock, ImageContent, TextContent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Tool Trait
// ============================================================================

/// Callback for streaming incremental tool output.
pub type UpdateFn = Box<dyn Fn(ToolUpdate) + Send + Sync>;

/// A tool that can be executed by the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model.
    fn name(&self) -> &str;

    /// Tool description for the model.
    fn description(&self) -> &str;

    /// Tool parameters as JSON Schema.
    fn parameters(&self) -> serde_json::Value;

    /// Execute the tool.
    ///
    /// `on_update` streams incremental results (e.g. while a long-running
    /// `bash` command is still producing output). `cancel` is observable
    /// cancellation; a tool that ignores it is still awaited.
    async fn execute(
        &self,
        tool_call_id: &str,
        args: serde_json::Value,
        on_update: Option<UpdateFn>,
        cancel: &AbortSignal,
    ) -> Result<ToolOutput>;
}

/// Tool execution output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolOutput {
    /// Plain-text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: None,
            is_error: false,
        }
    }

    /// Plain-text error output.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: None,
            is_error: true,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde requires `fn(&bool) -> bool`
const fn is_false(value: &bool) -> bool {
    !*value
}

/// Incremental snapshot during tool execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUpdate {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ============================================================================
// Truncation
// ============================================================================

/// Default maximum lines returned to the model.
pub const DEFAULT_MAX_LINES: usize = 2000;

/// Default maximum bytes returned to the model (50 KB).
pub const DEFAULT_MAX_BYTES: usize = 50 * 1024;

/// Default timeout (in seconds) for bash tool execution.
pub const DEFAULT_BASH_TIMEOUT_SECS: u64 = 120;

/// Result of a truncation pass.
#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub content: String,
    pub truncated: bool,
    pub total_lines: usize,
    pub total_bytes: usize,
}

/// Truncate from the beginning (keep the first lines within both limits).
pub fn truncate_head(content: &str, max_lines: usize, max_bytes: usize) -> TruncationResult {
    let total_bytes = content.len();
    let total_lines = memchr::memchr_iter(b'\n', content.as_bytes()).count() + 1;

    if total_lines <= max_lines && total_bytes <= max_bytes {
        return TruncationResult {
            content: content.to_string(),
            truncated: false,
            total_lines,
            total_bytes,
        };
    }

    let mut byte_count = 0usize;
    for (i, line) in content.split('\n').enumerate() {
        if i >= max_lines {
            break;
        }
        let line_bytes = line.len() + usize::from(i > 0);
        if byte_count + line_bytes > max_bytes {
            break;
        }
        byte_count += line_bytes;
    }

    TruncationResult {
        content: content.get(..byte_count).unwrap_or_default().to_string(),
        truncated: true,
        total_lines,
        total_bytes,
    }
}

/// Truncate from the end (keep the last lines within both limits).
pub fn truncate_tail(content: &str, max_lines: usize, max_bytes: usize) -> TruncationResult {
    let total_bytes = content.len();
    let bytes = content.as_bytes();
    let total_lines = memchr::memchr_iter(b'\n', bytes).count() + 1;

    if total_lines <= max_lines && total_bytes <= max_bytes {
        return TruncationResult {
            content: content.to_string(),
            truncated: false,
            total_lines,
            total_bytes,
        };
    }

    let mut line_count = 0usize;
    let mut byte_count = 0usize;
    let mut start_idx = content.len();
    let mut search_end = content.len();

    loop {
        if line_count >= max_lines {
            break;
        }
        let prev_newline = memchr::memrchr(b'\n', &bytes[..search_end]);
        let line_start = prev_newline.map_or(0, |idx| idx + 1);
        let added = (search_end - line_start) + usize::from(line_count > 0);
        if byte_count + added > max_bytes {
            break;
        }
        line_count += 1;
        byte_count += added;
        start_idx = line_start;
        if line_start == 0 {
            break;
        }
        search_end = line_start - 1;
    }

    TruncationResult {
        content: content[start_idx..].to_string(),
        truncated: true,
        total_lines,
        total_bytes,
    }
}

/// Spill full output to a temp file so truncated results can point at it.
fn spill_full_output(prefix: &str, content: &str) -> Option<PathBuf> {
    let dir = std::env::temp_dir().join("plover-tool-output");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join(format!("{prefix}-{}.txt", uuid::Uuid::new_v4().simple()));
    let mut file = std::fs::File::create(&path).ok()?;
    file.write_all(content.as_bytes()).ok()?;
    Some(path)
}

/// Apply the shared output contract: truncate and annotate with a pointer to
/// the full output when needed.
pub fn apply_output_contract(tool: &str, content: &str, keep_tail: bool) -> (String, bool) {
    let result = if keep_tail {
        truncate_tail(content, DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    } else {
        truncate_head(content, DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    };
    if !result.truncated {
        return (result.content, false);
    }
    let mut out = result.content;
    if let Some(path) = spill_full_output(tool, content) {
        let _ = write!(
            out,
            "\n\n[Output truncated ({} lines / {} bytes). Full output: {}]",
            result.total_lines,
            result.total_bytes,
            path.display()
        );
    } else {
        let _ = write!(
            out,
            "\n\n[Output truncated ({} lines / {} bytes)]",
            result.total_lines, result.total_bytes
        );
    }
    (out, true)
}

fn resolve_path(file_path: &str, cwd: &Path) -> PathBuf {
    let expanded = if let Some(rest) = file_path.strip_prefix("~/") {
        std::env::var("HOME").map_or_else(|_| PathBuf::from(file_path), |home| Path::new(&home).join(rest))
    } else {
        PathBuf::from(file_path)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::tool(tool, format!("invalid arguments: {e}")))
}

// ============================================================================
// Registry
// ============================================================================

/// Names of the built-in tools.
pub const BUILTIN_TOOLS: &[&str] = &["read", "write", "edit", "bash", "grep", "find", "ls"];

/// Tool registry holding built-in and extension-contributed tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a registry with the named built-in tools enabled.
    pub fn builtin(enabled: &[&str], cwd: &Path) -> Self {
        let mut tools: Vec<Box<dyn Tool>> = Vec::new();
        for name in enabled {
            match *name {
                "read" => tools.push(Box::new(ReadTool::new(cwd))),
                "write" => tools.push(Box::new(WriteTool::new(cwd))),
                "edit" => tools.push(Box::new(EditTool::new(cwd))),
                "bash" => tools.push(Box::new(BashTool::new(cwd))),
                "grep" => tools.push(Box::new(GrepTool::new(cwd))),
                "find" => tools.push(Box::new(FindTool::new(cwd))),
                "ls" => tools.push(Box::new(LsTool::new(cwd))),
                _ => {}
            }
        }
        Self { tools }
    }

    /// Construct a registry from a pre-built tool list.
    pub fn from_tools(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// Register an additional tool. Overriding an existing name replaces it
    /// and returns a warning for the UI channel.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Option<String> {
        let name = tool.name().to_string();
        if let Some(pos) = self.tools.iter().position(|t| t.name() == name) {
            self.tools[pos] = tool;
            let warning = format!("extension tool '{name}' overrides an existing tool");
            tracing::warn!("{warning}");
            return Some(warning);
        }
        self.tools.push(tool);
        None
    }

    /// All tools.
    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Find a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(AsRef::as_ref)
    }

    /// Snapshot the tool schemas for a provider request.
    pub fn definitions(&self) -> Vec<crate::provider::ToolDef> {
        self.tools
            .iter()
            .map(|t| crate::provider::ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }
}

// ============================================================================
// read
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadArgs {
    path: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

pub struct ReadTool {
    cwd: PathBuf,
}

impl ReadTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Supports text files and images (png, jpg, gif, webp). Text output is truncated to 2000 lines or 50KB, whichever is hit first; use offset/limit to page through large files."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" },
                "offset": { "type": "integer", "description": "1-based line to start from" },
                "limit": { "type": "integer", "description": "Maximum lines to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: ReadArgs = parse_args("read", args)?;
        let path = resolve_path(&args.path, &self.cwd);

        if !path.exists() {
            return Ok(ToolOutput::error(format!(
                "File not found: {}",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if let Some(mime) = extension
            .as_deref()
            .and_then(|ext| IMAGE_EXTENSIONS.iter().find(|(e, _)| *e == ext))
            .map(|(_, mime)| *mime)
        {
            use base64::Engine as _;
            let bytes = tokio::fs::read(&path).await?;
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            return Ok(ToolOutput {
                content: vec![ContentBlock::Image(ImageContent {
                    data,
                    mime_type: mime.to_string(),
                })],
                details: Some(json!({ "path": path.display().to_string(), "mimeType": mime })),
                is_error: false,
            });
        }

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::tool("read", format!("{}: {e}", path.display())))?;

        let selected: String = match (args.offset, args.limit) {
            (None, None) => contents,
            (offset, limit) => {
                let start = offset.unwrap_or(1).saturating_sub(1);
                let take = limit.unwrap_or(usize::MAX);
                contents
                    .lines()
                    .skip(start)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        let (text, truncated) = apply_output_contract("read", &selected, false);
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: Some(json!({
                "path": path.display().to_string(),
                "truncated": truncated,
            })),
            is_error: false,
        })
    }
}

// ============================================================================
// write
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteArgs {
    path: String,
    content: String,
}

pub struct WriteTool {
    cwd: PathBuf,
}

impl WriteTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to write" },
                "content": { "type": "string", "description": "File content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: WriteArgs = parse_args("write", args)?;
        let path = resolve_path(&args.path, &self.cwd);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &args.content).await?;
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(format!(
                "Wrote {} bytes to {}",
                args.content.len(),
                path.display()
            )))],
            details: Some(json!({
                "path": path.display().to_string(),
                "bytes": args.content.len(),
            })),
            is_error: false,
        })
    }
}

// ============================================================================
// edit
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditArgs {
    path: String,
    old_text: String,
    new_text: String,
    #[serde(default)]
    replace_all: bool,
}

pub struct EditTool {
    cwd: PathBuf,
}

impl EditTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact text snippet in a file. The old text must match exactly once unless replaceAll is set."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" },
                "oldText": { "type": "string", "description": "Exact text to replace" },
                "newText": { "type": "string", "description": "Replacement text" },
                "replaceAll": { "type": "boolean", "description": "Replace every occurrence" }
            },
            "required": ["path", "oldText", "newText"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: EditArgs = parse_args("edit", args)?;
        let path = resolve_path(&args.path, &self.cwd);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::tool("edit", format!("{}: {e}", path.display())))?;

        let occurrences = contents.matches(&args.old_text).count();
        if occurrences == 0 {
            return Ok(ToolOutput::error(format!(
                "Text not found in {}",
                path.display()
            )));
        }
        if occurrences > 1 && !args.replace_all {
            return Ok(ToolOutput::error(format!(
                "Text matches {occurrences} times in {}; pass replaceAll or provide a longer snippet",
                path.display()
            )));
        }

        let updated = if args.replace_all {
            contents.replace(&args.old_text, &args.new_text)
        } else {
            contents.replacen(&args.old_text, &args.new_text, 1)
        };
        tokio::fs::write(&path, &updated).await?;

        let replaced = if args.replace_all { occurrences } else { 1 };
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(format!(
                "Replaced {replaced} occurrence(s) in {}",
                path.display()
            )))],
            details: Some(json!({
                "path": path.display().to_string(),
                "replacements": replaced,
            })),
            is_error: false,
        })
    }
}

// ============================================================================
// bash
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BashArgs {
    command: String,
    timeout: Option<u64>,
}

pub struct BashTool {
    cwd: PathBuf,
}

impl BashTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

/// Outcome of a shell run, shared with the RPC `bash` command.
#[derive(Debug)]
pub struct ShellRun {
    pub output: String,
    pub exit_code: i32,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Run a shell command, streaming combined output, honoring cancellation
/// (the process is killed) and a timeout.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: &AbortSignal,
    mut on_chunk: impl FnMut(&str),
) -> Result<ShellRun> {
    use tokio::io::AsyncReadExt;

    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::tool("bash", format!("failed to spawn shell: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let mut output = String::new();
    let mut stdout_buf = [0u8; 8192];
    let mut stderr_buf = [0u8; 8192];
    let mut stdout_done = false;
    let mut stderr_done = false;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut cancelled = false;
    let mut timed_out = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            read = stdout.read(&mut stdout_buf), if !stdout_done => {
                match read {
                    Ok(0) => stdout_done = true,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&stdout_buf[..n]).into_owned();
                        output.push_str(&chunk);
                        on_chunk(&output);
                    }
                    Err(_) => stdout_done = true,
                }
            }
            read = stderr.read(&mut stderr_buf), if !stderr_done => {
                match read {
                    Ok(0) => stderr_done = true,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&stderr_buf[..n]).into_owned();
                        output.push_str(&chunk);
                        on_chunk(&output);
                    }
                    Err(_) => stderr_done = true,
                }
            }
            () = cancel.wait() => {
                cancelled = true;
                let _ = child.start_kill();
                break;
            }
            () = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                let _ = child.start_kill();
                break;
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };

    Ok(ShellRun {
        output,
        exit_code,
        cancelled,
        timed_out,
    })
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory. Output streams as it is produced and is truncated to the last 2000 lines or 50KB; a path to the full output is returned when truncated."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to run" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 120)" }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        on_update: Option<UpdateFn>,
        cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: BashArgs = parse_args("bash", args)?;
        let timeout = Duration::from_secs(args.timeout.unwrap_or(DEFAULT_BASH_TIMEOUT_SECS));

        let run = run_shell(&args.command, &self.cwd, timeout, cancel, |combined| {
            if let Some(update) = &on_update {
                let tail = truncate_tail(combined, DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES);
                update(ToolUpdate {
                    content: vec![ContentBlock::Text(TextContent::new(tail.content))],
                    details: None,
                });
            }
        })
        .await?;

        let (mut text, truncated) = apply_output_contract("bash", &run.output, true);
        if run.cancelled {
            text.push_str("\n\n(command cancelled)");
        } else if run.timed_out {
            let _ = write!(text, "\n\n(command timed out after {}s)", timeout.as_secs());
        } else if run.exit_code != 0 {
            let _ = write!(text, "\n\nCommand exited with code {}", run.exit_code);
        }

        let is_error = run.cancelled || run.timed_out || run.exit_code != 0;
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: Some(json!({
                "exitCode": run.exit_code,
                "cancelled": run.cancelled,
                "timedOut": run.timed_out,
                "truncated": truncated,
            })),
            is_error,
        })
    }
}

// ============================================================================
// grep
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrepArgs {
    pattern: String,
    path: Option<String>,
    #[serde(default)]
    ignore_case: bool,
    limit: Option<usize>,
}

pub struct GrepTool {
    cwd: PathBuf,
}

impl GrepTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

const DEFAULT_GREP_LIMIT: usize = 100;
const GREP_MAX_LINE_LENGTH: usize = 500;

fn walk_files(root: &Path, out: &mut Vec<PathBuf>, budget: &mut usize) {
    if *budget == 0 {
        return;
    }
    let Ok(dirents) = std::fs::read_dir(root) else {
        return;
    };
    let mut entries: Vec<_> = dirents.flatten().collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for dirent in entries {
        if *budget == 0 {
            return;
        }
        let path = dirent.path();
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            walk_files(&path, out, budget);
        } else {
            out.push(path);
            *budget -= 1;
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines as path:line:text, capped at 100 matches by default."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "Directory or file to search (default cwd)" },
                "ignoreCase": { "type": "boolean", "description": "Case-insensitive match" },
                "limit": { "type": "integer", "description": "Maximum matches" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: GrepArgs = parse_args("grep", args)?;
        let root = args
            .path
            .as_deref()
            .map_or_else(|| self.cwd.clone(), |p| resolve_path(p, &self.cwd));
        let limit = args.limit.unwrap_or(DEFAULT_GREP_LIMIT);

        let regex = regex::RegexBuilder::new(&args.pattern)
            .case_insensitive(args.ignore_case)
            .build()
            .map_err(|e| Error::tool("grep", format!("invalid pattern: {e}")))?;

        let mut files = Vec::new();
        if root.is_file() {
            files.push(root.clone());
        } else {
            let mut budget = 20_000;
            walk_files(&root, &mut files, &mut budget);
        }

        let mut matches = Vec::new();
        'outer: for file in files {
            let Ok(contents) = std::fs::read_to_string(&file) else {
                continue; // binary or unreadable
            };
            for (line_no, line) in contents.lines().enumerate() {
                if regex.is_match(line) {
                    let shown: String = line.chars().take(GREP_MAX_LINE_LENGTH).collect();
                    matches.push(format!("{}:{}:{}", file.display(), line_no + 1, shown));
                    if matches.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }

        let text = if matches.is_empty() {
            "No matches found".to_string()
        } else {
            matches.join("\n")
        };
        let (text, _) = apply_output_contract("grep", &text, false);
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: Some(json!({ "matchCount": matches.len() })),
            is_error: false,
        })
    }
}

// ============================================================================
// find
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindArgs {
    pattern: String,
    path: Option<String>,
    limit: Option<usize>,
}

pub struct FindTool {
    cwd: PathBuf,
}

impl FindTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

const DEFAULT_FIND_LIMIT: usize = 1000;

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        "find"
    }

    fn description(&self) -> &str {
        "Find files whose path contains the given substring (case-insensitive)."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Substring to match in file paths" },
                "path": { "type": "string", "description": "Directory to search (default cwd)" },
                "limit": { "type": "integer", "description": "Maximum results" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: FindArgs = parse_args("find", args)?;
        let root = args
            .path
            .as_deref()
            .map_or_else(|| self.cwd.clone(), |p| resolve_path(p, &self.cwd));
        let limit = args.limit.unwrap_or(DEFAULT_FIND_LIMIT);
        let needle = args.pattern.to_ascii_lowercase();

        let mut files = Vec::new();
        let mut budget = 20_000;
        walk_files(&root, &mut files, &mut budget);

        let matched: Vec<String> = files
            .iter()
            .filter(|path| {
                path.display()
                    .to_string()
                    .to_ascii_lowercase()
                    .contains(&needle)
            })
            .take(limit)
            .map(|path| path.display().to_string())
            .collect();

        let text = if matched.is_empty() {
            "No files found".to_string()
        } else {
            matched.join("\n")
        };
        let (text, _) = apply_output_contract("find", &text, false);
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: Some(json!({ "matchCount": matched.len() })),
            is_error: false,
        })
    }
}

// ============================================================================
// ls
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LsArgs {
    path: Option<String>,
}

pub struct LsTool {
    cwd: PathBuf,
}

impl LsTool {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List directory contents. Directories are suffixed with '/'."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default cwd)" }
            }
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        args: serde_json::Value,
        _on_update: Option<UpdateFn>,
        _cancel: &AbortSignal,
    ) -> Result<ToolOutput> {
        let args: LsArgs = parse_args("ls", args)?;
        let root = args
            .path
            .as_deref()
            .map_or_else(|| self.cwd.clone(), |p| resolve_path(p, &self.cwd));

        let mut names = Vec::new();
        for dirent in std::fs::read_dir(&root)
            .map_err(|e| Error::tool("ls", format!("{}: {e}", root.display())))?
        {
            let dirent = dirent?;
            let mut name = dirent.file_name().to_string_lossy().into_owned();
            if dirent.path().is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let text = if names.is_empty() {
            "(empty directory)".to_string()
        } else {
            names.join("\n")
        };
        let (text, _) = apply_output_contract("ls", &text, false);
        Ok(ToolOutput {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            details: Some(json!({ "path": root.display().to_string() })),
            is_error: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AbortHandle;
    use proptest::prelude::*;

    fn never_cancelled() -> AbortSignal {
        AbortHandle::new().1
    }

    #[test]
    fn truncate_head_within_limits_is_noop() {
        let result = truncate_head("a\nb\nc", 10, 1024);
        assert!(!result.truncated);
        assert_eq!(result.content, "a\nb\nc");
        assert_eq!(result.total_lines, 3);
    }

    #[test]
    fn truncate_head_by_lines() {
        let content = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let result = truncate_head(&content, 3, 1024);
        assert!(result.truncated);
        assert_eq!(result.content, "0\n1\n2");
    }

    #[test]
    fn truncate_tail_by_lines_keeps_suffix() {
        let content = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let result = truncate_tail(&content, 3, 1024);
        assert!(result.truncated);
        assert_eq!(result.content, "7\n8\n9");
        assert!(content.ends_with(&result.content));
    }

    proptest! {
        #[test]
        fn truncate_head_is_prefix(content in ".{0,2000}", max_lines in 1usize..50, max_bytes in 1usize..500) {
            let result = truncate_head(&content, max_lines, max_bytes);
            prop_assert!(content.starts_with(&result.content));
            if result.truncated {
                prop_assert!(result.content.len() <= max_bytes);
            } else {
                prop_assert_eq!(result.content.len(), content.len());
            }
        }

        #[test]
        fn truncate_tail_is_suffix(content in "[a-z\n]{0,2000}", max_lines in 1usize..50, max_bytes in 1usize..500) {
            let result = truncate_tail(&content, max_lines, max_bytes);
            prop_assert!(content.ends_with(&result.content));
        }
    }

    #[tokio::test]
    async fn read_write_edit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = never_cancelled();

        let write = WriteTool::new(dir.path());
        let out = write
            .execute(
                "c1",
                json!({ "path": "notes.txt", "content": "hello world" }),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert!(!out.is_error);

        let edit = EditTool::new(dir.path());
        let out = edit
            .execute(
                "c2",
                json!({ "path": "notes.txt", "oldText": "world", "newText": "plover" }),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert!(!out.is_error);

        let read = ReadTool::new(dir.path());
        let out = read
            .execute("c3", json!({ "path": "notes.txt" }), None, &cancel)
            .await
            .unwrap();
        match &out.content[0] {
            ContentBlock::Text(text) => assert_eq!(text.text, "hello plover"),
            _ => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn edit_rejects_ambiguous_match() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = never_cancelled();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();

        let edit = EditTool::new(dir.path());
        let out = edit
            .execute(
                "c1",
                json!({ "path": "f.txt", "oldText": "aaa", "newText": "x" }),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert!(out.is_error);

        let out = edit
            .execute(
                "c2",
                json!({ "path": "f.txt", "oldText": "aaa", "newText": "x", "replaceAll": true }),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "x bbb x"
        );
    }

    #[tokio::test]
    async fn bash_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = never_cancelled();
        let bash = BashTool::new(dir.path());

        let out = bash
            .execute("c1", json!({ "command": "echo hi && exit 3" }), None, &cancel)
            .await
            .unwrap();
        assert!(out.is_error);
        let details = out.details.unwrap();
        assert_eq!(details["exitCode"], 3);
        match &out.content[0] {
            ContentBlock::Text(text) => {
                assert!(text.text.contains("hi"));
                assert!(text.text.contains("exited with code 3"));
            }
            _ => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn bash_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, signal) = AbortHandle::new();
        let bash = BashTool::new(dir.path());

        let task = tokio::spawn(async move {
            bash.execute("c1", json!({ "command": "sleep 30" }), None, &signal)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let out = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel should resolve promptly")
            .unwrap()
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.details.unwrap()["cancelled"], true);
    }

    #[tokio::test]
    async fn grep_finds_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\ngamma").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta again").unwrap();
        let cancel = never_cancelled();

        let grep = GrepTool::new(dir.path());
        let out = grep
            .execute("c1", json!({ "pattern": "beta" }), None, &cancel)
            .await
            .unwrap();
        match &out.content[0] {
            ContentBlock::Text(text) => {
                assert!(text.text.contains("a.txt:2:beta"));
                assert!(text.text.contains("b.txt:1:beta again"));
            }
            _ => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn registry_override_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::builtin(&["read", "bash"], dir.path());
        assert_eq!(registry.tools().len(), 2);

        let warning = registry.register(Box::new(ReadTool::new(dir.path())));
        assert!(warning.is_some());
        assert_eq!(registry.tools().len(), 2);

        let warning = registry.register(Box::new(LsTool::new(dir.path())));
        assert!(warning.is_none());
        assert_eq!(registry.tools().len(), 3);
    }
}
