//! Normalized message records produced by the parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Start sentinel for an expandable-quote region.
///
/// Single private-use code points: impossible to produce from normal content,
/// so the delivery layer can split on them without escaping concerns.
pub const EXPANDABLE_QUOTE_START: char = '\u{E000}';
/// End sentinel for an expandable-quote region.
pub const EXPANDABLE_QUOTE_END: char = '\u{E001}';

/// Wrap text in the sentinel pair. The delivery layer later renders the
/// region as the platform's collapsed blockquote.
pub fn wrap_expandable(text: &str) -> String {
    format!("{EXPANDABLE_QUOTE_START}{text}{EXPANDABLE_QUOTE_END}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    LocalCommand,
}

/// An inline image block from a user entry (pasted screenshots and the like).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64 payload as found in the transcript.
    pub data_base64: String,
}

/// A single display-ready message extracted from the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub role: Role,
    /// Formatted text, raw Markdown. Conversion happens at the send edge.
    pub text: String,
    pub content_type: ContentType,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    /// ISO-8601 timestamp from the transcript entry, when present.
    pub timestamp: Option<String>,
    /// Image blocks attached to a user entry, if any.
    pub image_data: Option<Vec<ImageAttachment>>,
}

/// A tool_use waiting for its tool_result, keyed by tool_use_id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTool {
    /// Formatted summary line, e.g. `**Read**(src/main.rs)`.
    pub summary: String,
    pub tool_name: String,
    /// Tool input, kept only for Edit/NotebookEdit to build the diff when the
    /// result arrives.
    pub input: Option<Value>,
}
