//! Session log: append-only, tree-structured persistence.
//!
//! A session is a JSONL file: one header line followed by one line per
//! entry. Entries form a tree through `parentId`; the active branch is the
//! path from the root to the current leaf. The leaf id lives in a small
//! sidecar file next to the session so navigation never rewrites history.

use crate::error::{Error, Result};
use crate::model::{ContentBlock, Message, UserContent, UserMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Current session file format version.
pub const SESSION_VERSION: u8 = 1;

const COMPACTION_SUMMARY_PREFIX: &str = "The conversation history before this point was compacted into the following summary:\n\n<summary>\n";
const COMPACTION_SUMMARY_SUFFIX: &str = "\n</summary>";

// ============================================================================
// Header
// ============================================================================

/// Session file header (the first line of the file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub r#type: String,
    pub version: u8,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
}

impl SessionHeader {
    pub fn new() -> Self {
        Self {
            r#type: "session".to_string(),
            version: SESSION_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            provider: None,
            model_id: None,
            thinking_level: None,
            forked_from: None,
        }
    }
}

impl Default for SessionHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Base fields present on every entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBase {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub timestamp: String,
}

impl EntryBase {
    fn new(parent_id: Option<String>, id: String) -> Self {
        Self {
            id,
            parent_id,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// A session entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEntry {
    #[serde(rename = "message")]
    Message(MessageEntry),
    #[serde(rename = "compaction")]
    Compaction(CompactionEntry),
    #[serde(rename = "branchSummary")]
    BranchSummary(BranchSummaryEntry),
    #[serde(rename = "label-change")]
    Label(LabelEntry),
    #[serde(rename = "session-info")]
    SessionInfo(SessionInfoEntry),
    #[serde(rename = "custom")]
    Custom(CustomEntry),
}

impl SessionEntry {
    pub const fn base(&self) -> &EntryBase {
        match self {
            Self::Message(e) => &e.base,
            Self::Compaction(e) => &e.base,
            Self::BranchSummary(e) => &e.base,
            Self::Label(e) => &e.base,
            Self::SessionInfo(e) => &e.base,
            Self::Custom(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.base().parent_id.as_deref()
    }
}

/// Message entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub message: Message,
}

/// Compaction entry: a lossy summary of the branch prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

/// Branch summary entry, written when navigating away from a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummaryEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub summary: String,
    pub from_leaf_id: String,
    pub to_leaf_id: String,
}

/// Label entry: attaches or clears a user-supplied name on an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub target_entry_id: String,
    pub label: Option<String>,
}

/// Session info entry: a human-chosen name for the whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub name: Option<String>,
}

/// Custom entry owned by an extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub custom_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// Load diagnostics
// ============================================================================

/// Diagnostics captured while opening a session file.
#[derive(Debug, Clone, Default)]
pub struct OpenDiagnostics {
    pub skipped_lines: Vec<SkippedLine>,
    pub orphaned_parent_links: Vec<OrphanedParentLink>,
    /// A torn trailing line (crash mid-append) was discarded.
    pub discarded_tail: bool,
}

#[derive(Debug, Clone)]
pub struct SkippedLine {
    /// 1-based line number in the session file.
    pub line_number: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct OrphanedParentLink {
    pub entry_id: String,
    pub missing_parent_id: String,
}

// ============================================================================
// Session
// ============================================================================

/// A session log with its in-memory index.
#[derive(Debug)]
pub struct Session {
    pub header: SessionHeader,
    entries: Vec<SessionEntry>,
    /// id -> position in `entries`
    index: HashMap<String, usize>,
    /// parent id (None = root) -> child ids in append order
    children: HashMap<Option<String>, Vec<String>>,
    /// Path to the session file; None for in-memory sessions.
    pub path: Option<PathBuf>,
    /// Current leaf entry id (None before the first append).
    pub leaf_id: Option<String>,
}

impl Session {
    /// Create an in-memory (ephemeral) session.
    pub fn in_memory() -> Self {
        Self {
            header: SessionHeader::new(),
            entries: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
            path: None,
            leaf_id: None,
        }
    }

    /// Create a new session file in `dir`, writing the header immediately.
    pub fn create_in_dir(dir: &Path) -> Result<Self> {
        let mut session = Self::in_memory();
        std::fs::create_dir_all(dir)?;
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let short_id: String = session.header.id.chars().take(8).collect();
        let path = dir.join(format!("{timestamp}_{short_id}.jsonl"));
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        serde_json::to_writer(&mut file, &session.header)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        session.path = Some(path);
        Ok(session)
    }

    /// Open an existing session, logging any recovered corruption.
    pub fn open(path: &Path) -> Result<Self> {
        let (session, diagnostics) = Self::open_with_diagnostics(path)?;
        for skipped in &diagnostics.skipped_lines {
            tracing::warn!(
                line = skipped.line_number,
                error = %skipped.error,
                "skipping corrupted session entry"
            );
        }
        for orphan in &diagnostics.orphaned_parent_links {
            tracing::warn!(
                entry = %orphan.entry_id,
                missing_parent = %orphan.missing_parent_id,
                "entry references missing parent"
            );
        }
        if diagnostics.discarded_tail {
            tracing::warn!("discarded torn trailing line from session file");
        }
        Ok(session)
    }

    /// Open an existing session and report what had to be recovered.
    pub fn open_with_diagnostics(path: &Path) -> Result<(Self, OpenDiagnostics)> {
        if !path.exists() {
            return Err(Error::SessionNotFound {
                path: path.display().to_string(),
            });
        }

        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| Error::session("Empty session file"))?
            .map_err(|e| Error::session(format!("Failed to read header: {e}")))?;
        let header: SessionHeader = serde_json::from_str(&header_line)
            .map_err(|e| Error::session(format!("Invalid session header: {e}")))?;

        let mut diagnostics = OpenDiagnostics::default();
        let mut raw_lines: Vec<(usize, String)> = Vec::new();
        for (line_num, line_res) in lines.enumerate() {
            let line =
                line_res.map_err(|e| Error::session(format!("Failed to read line: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            raw_lines.push((line_num + 2, line));
        }

        let mut entries = Vec::new();
        let last_index = raw_lines.len().saturating_sub(1);
        for (i, (line_number, line)) in raw_lines.into_iter().enumerate() {
            match serde_json::from_str::<SessionEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // A torn final line means a crash mid-append; anything
                    // else is corruption worth reporting per line.
                    if i == last_index {
                        diagnostics.discarded_tail = true;
                    } else {
                        diagnostics.skipped_lines.push(SkippedLine {
                            line_number,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        let known_ids: HashSet<&str> = entries.iter().map(SessionEntry::id).collect();
        for entry in &entries {
            if let Some(parent_id) = entry.parent_id() {
                if !known_ids.contains(parent_id) {
                    diagnostics.orphaned_parent_links.push(OrphanedParentLink {
                        entry_id: entry.id().to_string(),
                        missing_parent_id: parent_id.to_string(),
                    });
                }
            }
        }

        let mut session = Self {
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
            path: Some(path.to_path_buf()),
            leaf_id: None,
        };
        for entry in entries {
            session.index_entry(&entry);
            session.entries.push(entry);
        }

        session.leaf_id = Self::read_leaf_sidecar(path)
            .filter(|id| session.index.contains_key(id))
            .or_else(|| session.entries.last().map(|e| e.id().to_string()));

        Ok((session, diagnostics))
    }

    fn leaf_sidecar_path(path: &Path) -> PathBuf {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".leaf");
        PathBuf::from(sidecar)
    }

    fn read_leaf_sidecar(path: &Path) -> Option<String> {
        let sidecar = Self::leaf_sidecar_path(path);
        let contents = std::fs::read_to_string(sidecar).ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn persist_leaf(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let sidecar = Self::leaf_sidecar_path(path);
        let parent = sidecar.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(self.leaf_id.as_deref().unwrap_or("").as_bytes())?;
        temp.persist(&sidecar)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    // ========================================================================
    // Appends
    // ========================================================================

    fn index_entry(&mut self, entry: &SessionEntry) {
        self.index
            .insert(entry.id().to_string(), self.entries.len());
        self.children
            .entry(entry.parent_id().map(str::to_string))
            .or_default()
            .push(entry.id().to_string());
    }

    /// Append an entry as a child of the current leaf and advance the leaf.
    fn push_entry(&mut self, build: impl FnOnce(EntryBase) -> SessionEntry) -> Result<String> {
        let parent_id = self.leaf_id.clone();
        if let Some(parent) = &parent_id {
            if !self.index.contains_key(parent) {
                return Err(Error::DetachedParent {
                    parent_id: parent.clone(),
                });
            }
        }
        // Entry ids are random 128-bit, unique across sessions and forks.
        let id = uuid::Uuid::new_v4().to_string();
        let entry = build(EntryBase::new(parent_id, id.clone()));
        self.write_entry_line(&entry)?;
        self.index_entry(&entry);
        self.entries.push(entry);
        self.leaf_id = Some(id.clone());
        self.persist_leaf()?;
        Ok(id)
    }

    fn write_entry_line(&self, entry: &SessionEntry) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().append(true).open(path)?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Append a message entry.
    pub fn append_message(&mut self, message: Message) -> Result<String> {
        self.push_entry(|base| SessionEntry::Message(MessageEntry { base, message }))
    }

    /// Append a compaction entry.
    pub fn append_compaction(
        &mut self,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        tokens_after: u64,
    ) -> Result<String> {
        self.push_entry(|base| {
            SessionEntry::Compaction(CompactionEntry {
                base,
                summary,
                first_kept_entry_id,
                tokens_before,
                tokens_after,
            })
        })
    }

    /// Append a branch summary entry.
    pub fn append_branch_summary(
        &mut self,
        summary: String,
        from_leaf_id: String,
        to_leaf_id: String,
    ) -> Result<String> {
        self.push_entry(|base| {
            SessionEntry::BranchSummary(BranchSummaryEntry {
                base,
                summary,
                from_leaf_id,
                to_leaf_id,
            })
        })
    }

    /// Attach (or clear, with `None`) a label on an existing entry.
    pub fn append_label(&mut self, target_entry_id: &str, label: Option<String>) -> Result<String> {
        if !self.index.contains_key(target_entry_id) {
            return Err(Error::validation(format!(
                "label target '{target_entry_id}' not found in session"
            )));
        }
        let target = target_entry_id.to_string();
        self.push_entry(|base| {
            SessionEntry::Label(LabelEntry {
                base,
                target_entry_id: target,
                label,
            })
        })
    }

    /// Set the session name by appending a session-info entry.
    pub fn set_name(&mut self, name: Option<String>) -> Result<String> {
        self.push_entry(|base| SessionEntry::SessionInfo(SessionInfoEntry { base, name }))
    }

    /// Append a custom entry owned by an extension.
    pub fn append_custom(&mut self, custom_type: String, data: Option<Value>) -> Result<String> {
        if custom_type.trim().is_empty() {
            return Err(Error::validation("customType must not be empty"));
        }
        self.push_entry(|base| SessionEntry::Custom(CustomEntry { base, custom_type, data }))
    }

    // ========================================================================
    // Tree navigation
    // ========================================================================

    /// Get an entry by id.
    pub fn get_entry(&self, entry_id: &str) -> Option<&SessionEntry> {
        self.index.get(entry_id).map(|&i| &self.entries[i])
    }

    /// All entries in file order.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Direct children of an entry (`None` = roots), in append order.
    pub fn children_of(&self, entry_id: Option<&str>) -> &[String] {
        self.children
            .get(&entry_id.map(str::to_string))
            .map_or(&[], Vec::as_slice)
    }

    /// Ids of entries with no children.
    pub fn leaves(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(SessionEntry::id)
            .filter(|id| self.children_of(Some(id)).is_empty())
            .collect()
    }

    /// Path of entry ids from root to `entry_id`, inclusive.
    pub fn path_to(&self, entry_id: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(entry_id.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break; // cycle guard
            }
            let Some(entry) = self.get_entry(&id) else {
                break;
            };
            current = entry.parent_id().map(str::to_string);
            path.push(id);
        }
        path.reverse();
        path
    }

    /// Make `entry_id` the active branch terminator. No file mutation.
    pub fn set_leaf(&mut self, entry_id: &str) -> Result<()> {
        if !self.index.contains_key(entry_id) {
            return Err(Error::validation(format!(
                "entry '{entry_id}' not found in session"
            )));
        }
        self.leaf_id = Some(entry_id.to_string());
        self.persist_leaf()
    }

    /// Entries along the active branch, root first.
    pub fn branch(&self) -> Vec<&SessionEntry> {
        let Some(leaf_id) = &self.leaf_id else {
            return Vec::new();
        };
        self.path_to(leaf_id)
            .iter()
            .filter_map(|id| self.get_entry(id))
            .collect()
    }

    /// The effective session name: the last session-info entry on the
    /// active branch.
    pub fn name(&self) -> Option<String> {
        self.branch().iter().rev().find_map(|entry| match entry {
            SessionEntry::SessionInfo(info) => info.name.clone(),
            _ => None,
        })
    }

    /// The effective label for an entry: the last label entry on the active
    /// branch targeting it.
    pub fn label_for(&self, entry_id: &str) -> Option<String> {
        self.branch()
            .iter()
            .rev()
            .find_map(|entry| match entry {
                SessionEntry::Label(label) if label.target_entry_id == entry_id => {
                    Some(label.label.clone())
                }
                _ => None,
            })
            .flatten()
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Materialize the active branch into provider messages.
    ///
    /// When the branch carries a compaction entry, the prefix before
    /// `firstKeptEntryId` collapses into a synthetic summary message.
    pub fn materialize(&self) -> Vec<Message> {
        let branch = self.branch();

        let last_compaction = branch.iter().rev().find_map(|entry| match entry {
            SessionEntry::Compaction(compaction) => Some(compaction),
            _ => None,
        });

        let Some(compaction) = last_compaction else {
            return branch
                .iter()
                .filter_map(|entry| match entry {
                    SessionEntry::Message(message) => Some(message.message.clone()),
                    _ => None,
                })
                .collect();
        };

        let mut messages = vec![Message::User(UserMessage {
            content: UserContent::Blocks(vec![ContentBlock::Text(
                crate::model::TextContent::new(format!(
                    "{COMPACTION_SUMMARY_PREFIX}{}{COMPACTION_SUMMARY_SUFFIX}",
                    compaction.summary
                )),
            )]),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })];

        let has_kept_entry = branch
            .iter()
            .any(|entry| entry.id() == compaction.first_kept_entry_id);
        let compaction_id = compaction.base.id.clone();

        let mut keep = false;
        let mut past_compaction = false;
        for entry in &branch {
            if entry.id() == compaction_id {
                past_compaction = true;
                continue;
            }
            if !keep {
                if has_kept_entry {
                    if entry.id() == compaction.first_kept_entry_id {
                        keep = true;
                    } else {
                        continue;
                    }
                } else if past_compaction {
                    // firstKeptEntryId is orphaned (session corruption);
                    // keep everything after the compaction entry instead of
                    // dropping it.
                    tracing::warn!(
                        first_kept_entry_id = %compaction.first_kept_entry_id,
                        "compaction references missing entry; keeping all post-compaction entries"
                    );
                    keep = true;
                } else {
                    continue;
                }
            }
            if let SessionEntry::Message(message) = entry {
                messages.push(message.message.clone());
            }
        }

        messages
    }

    /// The newest assistant message text on the active branch.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.branch().iter().rev().find_map(|entry| match entry {
            SessionEntry::Message(MessageEntry {
                message: Message::Assistant(assistant),
                ..
            }) => Some(assistant.text()),
            _ => None,
        })
    }

    /// Record a shell execution on the branch as a user-visible message.
    pub fn append_shell_execution(
        &mut self,
        command: &str,
        output: &str,
        exit_code: i32,
        cancelled: bool,
    ) -> Result<String> {
        let mut text = format!("Ran `{command}`\n");
        if output.is_empty() {
            text.push_str("(no output)");
        } else {
            text.push_str("```\n");
            text.push_str(output);
            if !output.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("```");
        }
        if cancelled {
            text.push_str("\n\n(command cancelled)");
        } else if exit_code != 0 {
            let _ = write!(text, "\n\nCommand exited with code {exit_code}");
        }
        self.append_message(Message::User(UserMessage {
            content: UserContent::Text(text),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }))
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Create a new session file whose branch is the prefix of this session
    /// up to `at_entry_id`. Entry ids are preserved; the source session is
    /// untouched.
    pub fn fork(&self, at_entry_id: &str, new_path: &Path) -> Result<Session> {
        if !self.index.contains_key(at_entry_id) {
            return Err(Error::validation(format!(
                "fork target '{at_entry_id}' not found in session"
            )));
        }

        let mut header = SessionHeader::new();
        header.provider = self.header.provider.clone();
        header.model_id = self.header.model_id.clone();
        header.thinking_level = self.header.thinking_level.clone();
        header.forked_from = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| Some(self.header.id.clone()));

        let path_ids = self.path_to(at_entry_id);
        let copied: Vec<SessionEntry> = path_ids
            .iter()
            .filter_map(|id| self.get_entry(id).cloned())
            .collect();

        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(new_path)?;
        serde_json::to_writer(&mut file, &header)?;
        file.write_all(b"\n")?;
        for entry in &copied {
            serde_json::to_writer(&mut file, entry)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;

        let mut forked = Session {
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
            path: Some(new_path.to_path_buf()),
            leaf_id: None,
        };
        for entry in copied {
            forked.index_entry(&entry);
            forked.entries.push(entry);
        }
        forked.leaf_id = Some(at_entry_id.to_string());
        forked.persist_leaf()?;
        Ok(forked)
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Render the active branch as a standalone HTML document.
    pub fn to_html(&self) -> String {
        let mut html = String::new();
        html.push_str("<!doctype html><html><head><meta charset=\"utf-8\">");
        html.push_str("<title>Plover Session</title><style>");
        html.push_str(
            "body{font-family:system-ui,sans-serif;margin:24px;background:#0b0c10;color:#e6e6e6;}
            .msg{padding:16px 18px;margin:12px 0;border-radius:8px;background:#14161b;}
            .msg.user{border-left:4px solid #4fc3f7;}
            .msg.assistant{border-left:4px solid #81c784;}
            .msg.tool{border-left:4px solid #ffb74d;}
            .msg.system{border-left:4px solid #ef9a9a;}
            .role{font-weight:600;margin-bottom:8px;}
            pre{white-space:pre-wrap;background:#0f1115;padding:12px;border-radius:6px;overflow:auto;}
            details summary{cursor:pointer;}
            img{max-width:100%;border-radius:6px;margin-top:8px;}",
        );
        html.push_str("</style></head><body>");

        let _ = write!(
            html,
            "<h1>{}</h1><div class=\"meta\">Session {} · {}</div>",
            escape_html(&self.name().unwrap_or_else(|| "Plover Session".to_string())),
            escape_html(&self.header.id),
            escape_html(&self.header.timestamp)
        );

        for entry in self.branch() {
            match entry {
                SessionEntry::Message(message) => html.push_str(&render_message(&message.message)),
                SessionEntry::Compaction(compaction) => {
                    let _ = write!(
                        html,
                        "<div class=\"msg system\"><div class=\"role\">Compaction</div><pre>{}</pre></div>",
                        escape_html(&compaction.summary)
                    );
                }
                SessionEntry::BranchSummary(summary) => {
                    let _ = write!(
                        html,
                        "<div class=\"msg system\"><div class=\"role\">Branch Summary</div><pre>{}</pre></div>",
                        escape_html(&summary.summary)
                    );
                }
                SessionEntry::SessionInfo(_) | SessionEntry::Label(_) => {}
                SessionEntry::Custom(custom) => {
                    let _ = write!(
                        html,
                        "<div class=\"msg system\"><div class=\"role\">{}</div></div>",
                        escape_html(&custom.custom_type)
                    );
                }
            }
        }

        html.push_str("</body></html>");
        html
    }
}

fn render_message(message: &Message) -> String {
    let mut html = String::new();
    match message {
        Message::User(user) => {
            html.push_str("<div class=\"msg user\"><div class=\"role\">User</div>");
            match &user.content {
                UserContent::Text(text) => {
                    let _ = write!(html, "<pre>{}</pre>", escape_html(text));
                }
                UserContent::Blocks(blocks) => html.push_str(&render_blocks(blocks)),
            }
            html.push_str("</div>");
        }
        Message::Assistant(assistant) => {
            html.push_str("<div class=\"msg assistant\"><div class=\"role\">Assistant</div>");
            html.push_str(&render_blocks(&assistant.content));
            html.push_str("</div>");
        }
        Message::ToolResult(result) => {
            let role = if result.is_error { "Tool Error" } else { "Tool" };
            let _ = write!(
                html,
                "<div class=\"msg tool\"><div class=\"role\">{role}: {}</div>",
                escape_html(&result.tool_name)
            );
            html.push_str(&render_blocks(&result.content));
            html.push_str("</div>");
        }
        Message::System(system) => {
            let _ = write!(
                html,
                "<div class=\"msg system\"><div class=\"role\">System</div><pre>{}</pre></div>",
                escape_html(&system.content)
            );
        }
    }
    html
}

fn render_blocks(blocks: &[ContentBlock]) -> String {
    let mut html = String::new();
    for block in blocks {
        match block {
            ContentBlock::Text(text) => {
                let _ = write!(html, "<pre>{}</pre>", escape_html(&text.text));
            }
            ContentBlock::Reasoning(reasoning) => {
                let _ = write!(
                    html,
                    "<details><summary>Reasoning</summary><pre>{}</pre></details>",
                    escape_html(&reasoning.reasoning)
                );
            }
            ContentBlock::Image(image) => {
                let _ = write!(
                    html,
                    "<img src=\"data:{};base64,{}\" alt=\"image\"/>",
                    escape_html(&image.mime_type),
                    escape_html(&image.data)
                );
            }
            ContentBlock::ToolCall(call) => {
                let args = serde_json::to_string_pretty(&call.arguments)
                    .unwrap_or_else(|_| call.arguments.to_string());
                let _ = write!(
                    html,
                    "<div class=\"role\">Tool call: {}</div><pre>{}</pre>",
                    escape_html(&call.name),
                    escape_html(&args)
                );
            }
        }
    }
    html
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

// ============================================================================
// Directory scanning
// ============================================================================

/// A scanned session file summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    pub name: Option<String>,
    pub message_count: usize,
    pub modified_ms: i64,
}

/// Scan a directory for session files, newest first.
pub fn list_sessions(dir: &Path) -> Result<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    if !dir.exists() {
        return Ok(summaries);
    }
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if path.extension().is_none_or(|ext| ext != "jsonl") {
            continue;
        }
        let Ok((session, _)) = Session::open_with_diagnostics(&path) else {
            continue;
        };
        let modified_ms = dirent
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64);
        let message_count = session
            .entries()
            .iter()
            .filter(|e| matches!(e, SessionEntry::Message(_)))
            .count();
        summaries.push(SessionSummary {
            id: session.header.id.clone(),
            path,
            name: session.name(),
            message_count,
            modified_ms,
        });
    }
    summaries.sort_by_key(|s| std::cmp::Reverse(s.modified_ms));
    Ok(summaries)
}
