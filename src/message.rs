//! Conversation messages and their on-disk JSON form.
//!
//! A [`Message`] is an immutable record of one entry in a conversation:
//! who said it, what was said, when, and a handful of flags controlling how
//! the entry is displayed and assembled into prompts. Messages serialize to
//! single-line JSON objects for the `conversation.jsonl` format; unknown
//! fields found on disk are preserved across rewrites.

use crate::tooluse::ToolFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Who sent a message.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...) to match the
/// conversation file format and chat-completion APIs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions, tool output framing, and runtime notices.
    System,
    /// Input from the human or the calling application.
    User,
    /// The model's reply, possibly containing tool-use blocks.
    Assistant,
    /// Output of an executed tool, tied to a call via `call_id`.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// A single message in a conversation.
///
/// Equality compares role, content, and timestamp only; flags and attached
/// files do not affect identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role/sender of this message.
    pub role: Role,

    /// The message text. Tool invocations are embedded here as fenced
    /// codeblocks (or XML / native-call lines, depending on format).
    pub content: String,

    /// Creation time, ISO-8601 on disk.
    pub timestamp: DateTime<Utc>,

    /// Paths attached to this message; contents are inlined at prompt
    /// assembly time, not stored in `content`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PathBuf>,

    /// Pinned messages are never truncated or dropped by reduction.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pinned: bool,

    /// Hidden from UI output but still sent to the model.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hide: bool,

    /// Not printed to the console on append. Runtime-only, never persisted.
    #[serde(skip)]
    pub quiet: bool,

    /// Ties a tool-result message to the assistant tool-call that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    /// The tool-use syntax this message was produced under, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_format: Option<ToolFormat>,

    /// Fields we do not understand are carried through rewrites untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.timestamp == other.timestamp
    }
}

impl Eq for Message {}

impl Message {
    /// Creates a message with the given role and content, timestamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into().trim().to_string(),
            timestamp: Utc::now(),
            files: Vec::new(),
            pinned: false,
            hide: false,
            quiet: false,
            call_id: None,
            tool_format: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A system message (instructions, notices, tool framing).
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool-result message tied to an earlier call.
    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.call_id = Some(call_id.into());
        msg
    }

    /// Marks the message as pinned (never reduced away).
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Hides the message from console output while keeping it in context.
    pub fn hidden(mut self) -> Self {
        self.hide = true;
        self
    }

    /// Suppresses the console print on append.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Attaches file paths whose contents are inlined at assembly time.
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    /// Returns a copy with replaced content, keeping all other fields.
    pub fn replace_content(&self, content: impl Into<String>) -> Self {
        let mut msg = self.clone();
        msg.content = content.into();
        msg
    }

    /// Extracts all outermost fenced codeblocks from the content.
    pub fn codeblocks(&self) -> Vec<crate::codeblock::Codeblock> {
        crate::codeblock::extract_codeblocks(&self.content)
    }

    /// Serializes to one line of `conversation.jsonl`.
    pub fn to_json_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
