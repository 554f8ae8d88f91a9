//! Entry-batch parsing with tool-call pairing.
//!
//! Entry structure (one JSON object per transcript line):
//! - `type`: "user" | "assistant" | "summary" | ...
//! - `message.content`: string OR list of blocks (text, thinking, tool_use,
//!   tool_result, image)
//! - `sessionId`, `cwd`, `timestamp`, `uuid`: metadata
//!
//! Tool pairing model: tool_use blocks appear in assistant entries; the
//! matching tool_result arrives in a later user entry, keyed by tool_use_id.

use std::collections::HashMap;

use serde_json::Value;

use crate::diff;
use crate::record::{
    wrap_expandable, ContentType, MessageRecord, PendingTool, Role, EXPANDABLE_QUOTE_START,
};

const NO_CONTENT_PLACEHOLDER: &str = "(no content)";
const INTERRUPTED_TEXT: &str = "[Request interrupted by user for tool use]";
const MAX_SUMMARY_LEN: usize = 200;

/// Tags injected by the CLI into user entries that must never reach the chat.
const SYSTEM_TAGS: [&str; 5] = [
    "<bash-input",
    "<bash-stdout",
    "<bash-stderr",
    "<local-command-caveat",
    "<system-reminder",
];

/// Parse a single transcript line. Returns `None` for blank lines, malformed
/// JSON, or non-object values (a torn write mid-line parses as neither).
pub fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

fn message_type(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(Value::as_str)
}

fn timestamp(entry: &Value) -> Option<String> {
    entry
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Extract only text-block content (used for user entries and plain strings).
pub fn extract_text_only(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut texts: Vec<&str> = Vec::new();
            for item in items {
                match item {
                    Value::String(s) => texts.push(s),
                    Value::Object(_) => {
                        if item.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(t) = item.get("text").and_then(Value::as_str) {
                                if !t.is_empty() {
                                    texts.push(t);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            texts.join("\n")
        }
        _ => String::new(),
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)?;
    Some(&text[start..start + end])
}

/// Local-command sub-pattern found inside a user entry's text.
#[derive(Debug, PartialEq)]
enum LocalCommand {
    /// `<command-name>` only — remember the name for the next entry's stdout.
    Invoke(String),
    /// `<local-command-stdout>` present, command name optional.
    Output {
        command: Option<String>,
        stdout: String,
    },
}

fn detect_local_command(text: &str) -> Option<LocalCommand> {
    if let Some(stdout) = between(text, "<local-command-stdout>", "</local-command-stdout>") {
        let command = between(text, "<command-name>", "</command-name>").map(str::to_string);
        return Some(LocalCommand::Output {
            command,
            stdout: stdout.trim().to_string(),
        });
    }
    between(text, "<command-name>", "</command-name>")
        .map(|cmd| LocalCommand::Invoke(cmd.to_string()))
}

fn contains_command_markup(text: &str) -> bool {
    text.contains("<local-command-stdout>") || text.contains("<command-name>")
}

fn truncate_summary(s: &str) -> String {
    if s.chars().count() > MAX_SUMMARY_LEN {
        let cut: String = s.chars().take(MAX_SUMMARY_LEN).collect();
        format!("{cut}…")
    } else {
        s.to_string()
    }
}

fn str_field<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Format a tool_use block into a one-line summary like `**Read**(file.py)`.
pub fn format_tool_use_summary(name: &str, input: &Value) -> String {
    if !input.is_object() {
        return format!("**{name}**");
    }

    let summary: String = match name {
        "Read" | "Glob" => str_field(input, "file_path")
            .or_else(|| str_field(input, "pattern"))
            .unwrap_or("")
            .to_string(),
        "Write" => str_field(input, "file_path").unwrap_or("").to_string(),
        "Edit" | "NotebookEdit" => str_field(input, "file_path")
            .or_else(|| str_field(input, "notebook_path"))
            .unwrap_or("")
            .to_string(),
        "Bash" => str_field(input, "command").unwrap_or("").to_string(),
        "Grep" => str_field(input, "pattern").unwrap_or("").to_string(),
        "Task" => str_field(input, "description").unwrap_or("").to_string(),
        "WebFetch" => str_field(input, "url").unwrap_or("").to_string(),
        "WebSearch" => str_field(input, "query").unwrap_or("").to_string(),
        "TodoWrite" => match input.get("todos").and_then(Value::as_array) {
            Some(todos) => format!("{} item(s)", todos.len()),
            None => String::new(),
        },
        "TodoRead" | "ExitPlanMode" => String::new(),
        "AskUserQuestion" => input
            .get("questions")
            .and_then(Value::as_array)
            .and_then(|qs| qs.first())
            .and_then(|q| q.get("question"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        "Skill" => str_field(input, "skill").unwrap_or("").to_string(),
        _ => input
            .as_object()
            .and_then(|map| {
                map.values()
                    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            })
            .unwrap_or("")
            .to_string(),
    };

    if summary.is_empty() {
        format!("**{name}**")
    } else {
        format!("**{name}**({})", truncate_summary(&summary))
    }
}

/// Extract text from a tool_result content field (string or block list).
pub fn extract_tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut parts: Vec<&str> = Vec::new();
            for item in items {
                match item {
                    Value::String(s) => parts.push(s),
                    Value::Object(_) => {
                        if item.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(t) = item.get("text").and_then(Value::as_str) {
                                if !t.is_empty() {
                                    parts.push(t);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn non_empty_lines(text: &str) -> usize {
    text.lines().filter(|l| !l.trim().is_empty()).count()
}

/// Format a tool result with a per-tool statistics line and, where the result
/// is non-trivial, the full output inside an expandable quote.
///
/// No truncation here: length limits are the send layer's concern.
pub fn format_tool_result_text(text: &str, tool_name: Option<&str>) -> String {
    if text.is_empty() {
        return String::new();
    }
    let line_count = text.matches('\n').count() + 1;

    match tool_name {
        Some("Read") => format!("  ⎿  Read {line_count} lines"),
        Some("Write") => format!("  ⎿  Wrote {line_count} lines"),
        Some("Bash") => format!(
            "  ⎿  Output {line_count} lines\n{}",
            wrap_expandable(text)
        ),
        Some("Grep") => format!(
            "  ⎿  Found {} matches\n{}",
            non_empty_lines(text),
            wrap_expandable(text)
        ),
        Some("Glob") => format!(
            "  ⎿  Found {} files\n{}",
            non_empty_lines(text),
            wrap_expandable(text)
        ),
        Some("Task") => format!(
            "  ⎿  Agent output {line_count} lines\n{}",
            wrap_expandable(text)
        ),
        Some("WebFetch") => format!(
            "  ⎿  Fetched {} characters\n{}",
            text.chars().count(),
            wrap_expandable(text)
        ),
        Some("WebSearch") => {
            let results = text.split("\n\n").count();
            format!("  ⎿  {results} search results\n{}", wrap_expandable(text))
        }
        _ => wrap_expandable(text),
    }
}

fn push_record(
    out: &mut Vec<MessageRecord>,
    role: Role,
    text: String,
    content_type: ContentType,
    tool_use_id: Option<String>,
    tool_name: Option<String>,
    timestamp: Option<String>,
) {
    out.push(MessageRecord {
        role,
        text,
        content_type,
        tool_use_id,
        tool_name,
        timestamp,
        image_data: None,
    });
}

/// Parse a batch of decoded entries into display-ready records.
///
/// `pending` carries unmatched tool_use state from a previous call (monitor
/// mode). When `pending` is `None` (one-shot history mode), tool_uses still
/// unmatched at the end are flushed as records instead of being returned.
///
/// Never fails: malformed entries are skipped.
pub fn parse_entries(
    entries: &[Value],
    pending: Option<HashMap<String, PendingTool>>,
) -> (Vec<MessageRecord>, HashMap<String, PendingTool>) {
    let carry_over = pending.is_some();
    let mut pending: HashMap<String, PendingTool> = pending.unwrap_or_default();
    let mut out: Vec<MessageRecord> = Vec::new();
    let mut last_cmd_name: Option<String> = None;

    for entry in entries {
        let Some(kind) = message_type(entry) else {
            continue;
        };
        if kind != "user" && kind != "assistant" {
            continue;
        }
        let ts = timestamp(entry);

        let Some(message) = entry.get("message").filter(|m| m.is_object()) else {
            continue;
        };
        let raw_content = message.get("content").cloned().unwrap_or(Value::Null);
        let blocks: Vec<Value> = match raw_content {
            Value::Array(items) => items,
            Value::String(s) if !s.is_empty() => {
                vec![serde_json::json!({"type": "text", "text": s})]
            }
            _ => Vec::new(),
        };

        // Local-command sub-pattern takes precedence in user entries.
        if kind == "user" {
            let flat = extract_text_only(&Value::Array(blocks.clone()));
            match detect_local_command(&flat) {
                Some(LocalCommand::Invoke(cmd)) => {
                    last_cmd_name = Some(cmd);
                    continue;
                }
                Some(LocalCommand::Output { command, stdout }) => {
                    let cmd = command.or(last_cmd_name.take()).unwrap_or_default();
                    let formatted = match (cmd.is_empty(), stdout.contains('\n')) {
                        (false, true) => format!("❯ `{cmd}`\n```\n{stdout}\n```"),
                        (false, false) => format!("❯ `{cmd}`\n`{stdout}`"),
                        (true, true) => format!("```\n{stdout}\n```"),
                        (true, false) => format!("`{stdout}`"),
                    };
                    push_record(
                        &mut out,
                        Role::Assistant,
                        formatted,
                        ContentType::LocalCommand,
                        None,
                        None,
                        ts,
                    );
                    last_cmd_name = None;
                    continue;
                }
                None => {}
            }
        }
        last_cmd_name = None;

        if kind == "assistant" {
            let mut has_text = false;
            for block in &blocks {
                let Some(btype) = block.get("type").and_then(Value::as_str) else {
                    continue;
                };
                match btype {
                    "text" => {
                        let t = block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim();
                        if !t.is_empty() && t != NO_CONTENT_PLACEHOLDER {
                            push_record(
                                &mut out,
                                Role::Assistant,
                                t.to_string(),
                                ContentType::Text,
                                None,
                                None,
                                ts.clone(),
                            );
                            has_text = true;
                        }
                    }
                    "tool_use" => {
                        let tool_id = block.get("id").and_then(Value::as_str).unwrap_or("");
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        let summary = format_tool_use_summary(name, &input);

                        // ExitPlanMode: surface the plan text before the tool line.
                        if name == "ExitPlanMode" {
                            if let Some(plan) =
                                input.get("plan").and_then(Value::as_str).filter(|p| !p.is_empty())
                            {
                                push_record(
                                    &mut out,
                                    Role::Assistant,
                                    plan.to_string(),
                                    ContentType::Text,
                                    None,
                                    None,
                                    ts.clone(),
                                );
                            }
                        }

                        if !tool_id.is_empty() {
                            let kept_input = if name == "Edit" || name == "NotebookEdit" {
                                Some(input)
                            } else {
                                None
                            };
                            pending.insert(
                                tool_id.to_string(),
                                PendingTool {
                                    summary: summary.clone(),
                                    tool_name: name.to_string(),
                                    input: kept_input,
                                },
                            );
                        }
                        push_record(
                            &mut out,
                            Role::Assistant,
                            summary,
                            ContentType::ToolUse,
                            (!tool_id.is_empty()).then(|| tool_id.to_string()),
                            Some(name.to_string()),
                            ts.clone(),
                        );
                    }
                    "thinking" => {
                        let thinking = block
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if !thinking.is_empty() {
                            push_record(
                                &mut out,
                                Role::Assistant,
                                wrap_expandable(thinking),
                                ContentType::Thinking,
                                None,
                                None,
                                ts.clone(),
                            );
                        } else if !has_text {
                            push_record(
                                &mut out,
                                Role::Assistant,
                                "(thinking)".to_string(),
                                ContentType::Thinking,
                                None,
                                None,
                                ts.clone(),
                            );
                        }
                    }
                    _ => {}
                }
            }
        } else {
            // user entry: tool_results pair with pending tool_uses; plain
            // text becomes a user record unless it is system markup.
            let mut user_text_parts: Vec<String> = Vec::new();
            let mut images: Vec<crate::record::ImageAttachment> = Vec::new();

            for block in &blocks {
                let Some(btype) = block.get("type").and_then(Value::as_str) else {
                    if let Some(s) = block.as_str() {
                        let s = s.trim();
                        if !s.is_empty() {
                            user_text_parts.push(s.to_string());
                        }
                    }
                    continue;
                };
                match btype {
                    "tool_result" => {
                        let tool_use_id = block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let result_text = extract_tool_result_text(
                            block.get("content").unwrap_or(&Value::Null),
                        );
                        let is_error = block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let is_interrupted = result_text == INTERRUPTED_TEXT;
                        let info = pending.remove(tool_use_id);
                        let tuid = (!tool_use_id.is_empty()).then(|| tool_use_id.to_string());

                        let entry_text = if is_interrupted {
                            match info.as_ref().map(|i| i.summary.as_str()) {
                                Some(s) if !s.is_empty() => format!("{s}\n⏹ Interrupted"),
                                _ => "⏹ Interrupted".to_string(),
                            }
                        } else if is_error {
                            let mut text = info
                                .as_ref()
                                .map(|i| i.summary.clone())
                                .unwrap_or_else(|| "**Error**".to_string());
                            if result_text.is_empty() {
                                text.push_str("\n  ⎿  Error");
                            } else {
                                let first = result_text.lines().next().unwrap_or("");
                                let short = if first.chars().count() > 100 {
                                    format!("{}…", first.chars().take(100).collect::<String>())
                                } else {
                                    first.to_string()
                                };
                                text.push_str(&format!("\n  ⎿  Error: {short}"));
                                if result_text.contains('\n') {
                                    text.push('\n');
                                    text.push_str(&wrap_expandable(&result_text));
                                }
                            }
                            text
                        } else if let Some(info) = &info {
                            let mut text = info.summary.clone();
                            let diff_built = (info.tool_name == "Edit"
                                || info.tool_name == "NotebookEdit")
                                && !result_text.is_empty()
                                && append_edit_diff(&mut text, info);
                            if !diff_built
                                && !result_text.is_empty()
                                && !info.summary.contains(EXPANDABLE_QUOTE_START)
                            {
                                text.push('\n');
                                text.push_str(&format_tool_result_text(
                                    &result_text,
                                    Some(&info.tool_name),
                                ));
                            }
                            text
                        } else if !result_text.is_empty() {
                            format_tool_result_text(&result_text, None)
                        } else {
                            continue;
                        };

                        push_record(
                            &mut out,
                            Role::Assistant,
                            entry_text,
                            ContentType::ToolResult,
                            tuid,
                            None,
                            ts.clone(),
                        );
                    }
                    "text" => {
                        let t = block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim();
                        if !t.is_empty() && !SYSTEM_TAGS.iter().any(|tag| t.contains(tag)) {
                            user_text_parts.push(t.to_string());
                        }
                    }
                    "image" => {
                        let source = block.get("source");
                        let media_type = source
                            .and_then(|s| s.get("media_type"))
                            .and_then(Value::as_str)
                            .unwrap_or("image/png");
                        if let Some(data) = source
                            .and_then(|s| s.get("data"))
                            .and_then(Value::as_str)
                            .filter(|d| !d.is_empty())
                        {
                            images.push(crate::record::ImageAttachment {
                                media_type: media_type.to_string(),
                                data_base64: data.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }

            if !user_text_parts.is_empty() || !images.is_empty() {
                let combined = user_text_parts.join("\n");
                if !contains_command_markup(&combined) {
                    out.push(MessageRecord {
                        role: Role::User,
                        text: combined,
                        content_type: ContentType::Text,
                        tool_use_id: None,
                        tool_name: None,
                        timestamp: ts,
                        image_data: (!images.is_empty()).then_some(images),
                    });
                }
            }
        }
    }

    // Unmatched tool_uses: kept pending in carry-over mode, flushed as
    // records in one-shot mode.
    if !carry_over {
        let mut flushed: Vec<(String, PendingTool)> = pending.drain().collect();
        flushed.sort_by(|a, b| a.0.cmp(&b.0));
        for (tool_id, info) in flushed {
            push_record(
                &mut out,
                Role::Assistant,
                info.summary,
                ContentType::ToolUse,
                Some(tool_id),
                Some(info.tool_name),
                None,
            );
        }
    }

    for record in &mut out {
        record.text = record.text.trim().to_string();
    }

    (out, pending)
}

/// For Edit results: append diff stats + expandable diff body to `text`.
/// Returns `false` when the input lacks usable old/new strings.
fn append_edit_diff(text: &mut String, info: &PendingTool) -> bool {
    let Some(input) = &info.input else {
        return false;
    };
    let old_s = input.get("old_string").and_then(Value::as_str).unwrap_or("");
    let new_s = input.get("new_string").and_then(Value::as_str).unwrap_or("");
    if old_s.is_empty() || new_s.is_empty() {
        return false;
    }
    let diff_text = diff::unified_diff(old_s, new_s);
    if diff_text.is_empty() {
        return false;
    }
    let (added, removed) = diff::count_changes(&diff_text);
    text.push_str(&format!(
        "\n  ⎿  Added {added} lines, removed {removed} lines\n{}",
        wrap_expandable(&diff_text)
    ));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(kind: &str, content: Value) -> Value {
        json!({
            "type": kind,
            "timestamp": "2026-01-01T00:00:00Z",
            "message": {"content": content},
        })
    }

    #[test]
    fn parse_line_accepts_objects_only() {
        assert!(parse_line("{\"type\": \"user\"}").is_some());
        assert!(parse_line("not-json").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   \t  ").is_none());
        assert!(parse_line("42").is_none());
    }

    #[test]
    fn extract_text_only_variants() {
        assert_eq!(extract_text_only(&json!("plain")), "plain");
        assert_eq!(
            extract_text_only(&json!([
                {"type": "text", "text": "hello"},
                {"type": "text", "text": "world"},
            ])),
            "hello\nworld"
        );
        assert_eq!(
            extract_text_only(&json!([
                {"type": "text", "text": "keep"},
                {"type": "tool_use", "name": "Read"},
            ])),
            "keep"
        );
        assert_eq!(extract_text_only(&json!([])), "");
        assert_eq!(extract_text_only(&json!(42)), "");
    }

    #[test]
    fn tool_summaries_per_kind() {
        let cases: Vec<(&str, Value, &str)> = vec![
            ("Read", json!({"file_path": "src/main.rs"}), "**Read**(src/main.rs)"),
            ("Write", json!({"file_path": "out.txt"}), "**Write**(out.txt)"),
            ("Bash", json!({"command": "ls -la"}), "**Bash**(ls -la)"),
            ("Grep", json!({"pattern": "TODO"}), "**Grep**(TODO)"),
            ("Glob", json!({"pattern": "*.rs"}), "**Glob**(*.rs)"),
            ("Task", json!({"description": "analyze"}), "**Task**(analyze)"),
            ("WebFetch", json!({"url": "https://example.com"}), "**WebFetch**(https://example.com)"),
            ("WebSearch", json!({"query": "rust async"}), "**WebSearch**(rust async)"),
            ("TodoWrite", json!({"todos": [1, 2, 3]}), "**TodoWrite**(3 item(s))"),
            ("TodoRead", json!({}), "**TodoRead**"),
            (
                "AskUserQuestion",
                json!({"questions": [{"question": "Continue?"}]}),
                "**AskUserQuestion**(Continue?)",
            ),
            ("ExitPlanMode", json!({}), "**ExitPlanMode**"),
            ("Skill", json!({"skill": "code-review"}), "**Skill**(code-review)"),
            ("CustomTool", json!({"first_key": "value1"}), "**CustomTool**(value1)"),
        ];
        for (name, input, expected) in cases {
            assert_eq!(format_tool_use_summary(name, &input), expected, "tool {name}");
        }
    }

    #[test]
    fn tool_summary_non_object_input() {
        assert_eq!(format_tool_use_summary("Read", &json!("nope")), "**Read**");
    }

    #[test]
    fn tool_summary_truncates_at_200() {
        let long = "x".repeat(250);
        let s = format_tool_use_summary("Bash", &json!({"command": long}));
        assert!(s.ends_with("…)"));
        // **Bash**( + 200 chars + … + )
        assert_eq!(s.chars().count(), 9 + 200 + 2);
    }

    #[test]
    fn assistant_text_record() {
        let (records, _) = parse_entries(
            &[entry("assistant", json!([{"type": "text", "text": "Hello"}]))],
            None,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::Assistant);
        assert_eq!(records[0].content_type, ContentType::Text);
        assert_eq!(records[0].text, "Hello");
        assert_eq!(records[0].timestamp.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn user_text_record() {
        let (records, _) = parse_entries(&[entry("user", json!("what now?"))], None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[0].text, "what now?");
    }

    #[test]
    fn tool_use_and_result_pair_within_batch() {
        let entries = vec![
            entry(
                "assistant",
                json!([{"type": "tool_use", "id": "T1", "name": "Read",
                        "input": {"file_path": "a.rs"}}]),
            ),
            entry(
                "user",
                json!([{"type": "tool_result", "tool_use_id": "T1", "content": "x\ny\nz"}]),
            ),
        ];
        let (records, pending) = parse_entries(&entries, Some(HashMap::new()));
        assert!(pending.is_empty());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content_type, ContentType::ToolUse);
        assert_eq!(records[0].text, "**Read**(a.rs)");
        assert_eq!(records[1].content_type, ContentType::ToolResult);
        assert!(records[1].text.starts_with("**Read**(a.rs)\n  ⎿  Read 3 lines"));
        assert_eq!(records[1].tool_use_id.as_deref(), Some("T1"));
    }

    #[test]
    fn pending_tools_carry_over_between_calls() {
        let use_entry = entry(
            "assistant",
            json!([{"type": "tool_use", "id": "T9", "name": "Bash",
                    "input": {"command": "make"}}]),
        );
        let (records, pending) = parse_entries(&[use_entry], Some(HashMap::new()));
        assert_eq!(records.len(), 1);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["T9"].tool_name, "Bash");

        let result_entry = entry(
            "user",
            json!([{"type": "tool_result", "tool_use_id": "T9", "content": "ok"}]),
        );
        let (records2, pending2) = parse_entries(&[result_entry], Some(pending));
        assert!(pending2.is_empty());
        assert_eq!(records2.len(), 1);
        assert!(records2[0].text.starts_with("**Bash**(make)"));
    }

    #[test]
    fn pending_tools_flushed_in_one_shot_mode() {
        let use_entry = entry(
            "assistant",
            json!([{"type": "tool_use", "id": "T2", "name": "Grep",
                    "input": {"pattern": "fn"}}]),
        );
        let (records, pending) = parse_entries(&[use_entry], None);
        assert!(pending.is_empty());
        // One-shot mode emits the tool_use record inline AND flushes the
        // still-unmatched pending entry at the end.
        assert_eq!(
            records
                .iter()
                .filter(|r| r.content_type == ContentType::ToolUse)
                .count(),
            2
        );
    }

    #[test]
    fn thinking_block_wrapped_in_sentinels() {
        let (records, _) = parse_entries(
            &[entry("assistant", json!([{"type": "thinking", "thinking": "hmm"}]))],
            None,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, ContentType::Thinking);
        assert!(records[0].text.starts_with(EXPANDABLE_QUOTE_START));
        assert!(records[0].text.contains("hmm"));
    }

    #[test]
    fn empty_thinking_without_text_emits_placeholder() {
        let (records, _) = parse_entries(
            &[entry("assistant", json!([{"type": "thinking", "thinking": ""}]))],
            None,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "(thinking)");
    }

    #[test]
    fn local_command_with_stdout() {
        let text = "<command-name>/status</command-name>\
                    <local-command-stdout>all good</local-command-stdout>";
        let (records, _) = parse_entries(&[entry("user", json!(text))], None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, ContentType::LocalCommand);
        assert_eq!(records[0].text, "❯ `/status`\n`all good`");
    }

    #[test]
    fn local_command_invoke_then_stdout_in_next_entry() {
        let entries = vec![
            entry("user", json!("<command-name>/compact</command-name>")),
            entry(
                "user",
                json!("<local-command-stdout>compacted\nok</local-command-stdout>"),
            ),
        ];
        let (records, _) = parse_entries(&entries, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "❯ `/compact`\n```\ncompacted\nok\n```");
    }

    #[test]
    fn exit_plan_mode_emits_plan_before_tool_use() {
        let (records, _) = parse_entries(
            &[entry(
                "assistant",
                json!([{"type": "tool_use", "id": "T3", "name": "ExitPlanMode",
                        "input": {"plan": "1. do it"}}]),
            )],
            Some(HashMap::new()),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content_type, ContentType::Text);
        assert_eq!(records[0].text, "1. do it");
        assert_eq!(records[1].content_type, ContentType::ToolUse);
        assert_eq!(records[1].tool_name.as_deref(), Some("ExitPlanMode"));
    }

    #[test]
    fn edit_result_gets_diff_stats() {
        let entries = vec![
            entry(
                "assistant",
                json!([{"type": "tool_use", "id": "T4", "name": "Edit",
                        "input": {"file_path": "m.rs",
                                  "old_string": "a\nb\nc",
                                  "new_string": "a\nX\nc"}}]),
            ),
            entry(
                "user",
                json!([{"type": "tool_result", "tool_use_id": "T4", "content": "done"}]),
            ),
        ];
        let (records, _) = parse_entries(&entries, Some(HashMap::new()));
        let result = &records[1];
        assert!(
            result.text.contains("  ⎿  Added 1 lines, removed 1 lines"),
            "text was: {}",
            result.text
        );
        assert!(result.text.contains(EXPANDABLE_QUOTE_START));
    }

    #[test]
    fn error_result_uses_first_line() {
        let entries = vec![
            entry(
                "assistant",
                json!([{"type": "tool_use", "id": "T5", "name": "Bash",
                        "input": {"command": "boom"}}]),
            ),
            entry(
                "user",
                json!([{"type": "tool_result", "tool_use_id": "T5",
                        "content": "exit 1: failed\ndetails here", "is_error": true}]),
            ),
        ];
        let (records, _) = parse_entries(&entries, Some(HashMap::new()));
        let text = &records[1].text;
        assert!(text.contains("  ⎿  Error: exit 1: failed"), "text: {text}");
        assert!(text.contains(EXPANDABLE_QUOTE_START), "multi-line error expands");
    }

    #[test]
    fn interrupted_result_is_inline() {
        let entries = vec![
            entry(
                "assistant",
                json!([{"type": "tool_use", "id": "T6", "name": "Bash",
                        "input": {"command": "sleep 100"}}]),
            ),
            entry(
                "user",
                json!([{"type": "tool_result", "tool_use_id": "T6",
                        "content": INTERRUPTED_TEXT}]),
            ),
        ];
        let (records, _) = parse_entries(&entries, Some(HashMap::new()));
        assert_eq!(records[1].text, "**Bash**(sleep 100)\n⏹ Interrupted");
    }

    #[test]
    fn system_tagged_user_text_is_dropped() {
        let (records, _) = parse_entries(
            &[entry(
                "user",
                json!([{"type": "text", "text": "<system-reminder>internal</system-reminder>"}]),
            )],
            None,
        );
        assert!(records.is_empty());
    }

    #[test]
    fn mixed_tool_use_and_text_in_declaration_order() {
        let (records, _) = parse_entries(
            &[entry(
                "assistant",
                json!([
                    {"type": "text", "text": "Looking now."},
                    {"type": "tool_use", "id": "T7", "name": "Read",
                     "input": {"file_path": "x"}},
                ]),
            )],
            Some(HashMap::new()),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content_type, ContentType::Text);
        assert_eq!(records[1].content_type, ContentType::ToolUse);
    }

    #[test]
    fn user_image_blocks_become_attachments() {
        let (records, _) = parse_entries(
            &[entry(
                "user",
                json!([
                    {"type": "text", "text": "look at this"},
                    {"type": "image",
                     "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}},
                ]),
            )],
            None,
        );
        assert_eq!(records.len(), 1);
        let images = records[0].image_data.as_ref().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].media_type, "image/png");
        assert_eq!(images[0].data_base64, "QUJD");
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let entries = vec![
            json!({"type": "assistant"}),
            json!({"type": "summary", "summary": "s"}),
            json!({"bogus": true}),
            entry("assistant", json!([{"type": "text", "text": "survives"}])),
        ];
        let (records, _) = parse_entries(&entries, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "survives");
    }

    #[test]
    fn incremental_matches_one_shot_for_chunked_batches() {
        // Incremental-read faithfulness: any partition of the entries across
        // calls (with carried pending state) yields the same records as one
        // full-batch parse.
        let entries: Vec<Value> = vec![
            entry("assistant", json!([{"type": "text", "text": "step 1"}])),
            entry(
                "assistant",
                json!([{"type": "tool_use", "id": "A", "name": "Read",
                        "input": {"file_path": "f"}}]),
            ),
            entry(
                "user",
                json!([{"type": "tool_result", "tool_use_id": "A", "content": "1\n2"}]),
            ),
            entry("user", json!("thanks")),
        ];

        let (full, _) = parse_entries(&entries, Some(HashMap::new()));

        for split in 1..entries.len() {
            let (mut a, pending) = parse_entries(&entries[..split], Some(HashMap::new()));
            let (b, _) = parse_entries(&entries[split..], Some(pending));
            a.extend(b);
            assert_eq!(a, full, "split at {split}");
        }
    }
}
