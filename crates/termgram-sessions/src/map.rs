//! SessionMap file parsing.
//!
//! The file is written by the installation hook running inside each CLI
//! process and is read-only for the bot. Keys are
//! `"{tmux_session}:{window_id}"`; old-format keys use the window name
//! instead of the id and are tolerated during the upgrade window.

use std::collections::BTreeMap;

use serde_json::Value;

/// One SessionMap entry projected onto a window key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowDetails {
    pub session_id: String,
    pub cwd: String,
    pub window_name: String,
    pub transcript_path: String,
}

/// Parse session_map JSON, keeping entries whose key starts with
/// `"{prefix}"` (the tmux session name plus `:`). Returns
/// `{window_key: details}` where window_key is whatever followed the prefix
/// (a window id in the current format, a window name in the old one).
/// Entries without a session_id are dropped.
pub fn parse_session_map(raw: &Value, prefix: &str) -> BTreeMap<String, WindowDetails> {
    let mut result = BTreeMap::new();
    let Some(map) = raw.as_object() else {
        return result;
    };
    for (key, info) in map {
        let Some(window_key) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some(info) = info.as_object() else {
            continue;
        };
        let field = |name: &str| {
            info.get(name)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let session_id = field("session_id");
        if session_id.is_empty() {
            continue;
        }
        result.insert(
            window_key.to_string(),
            WindowDetails {
                session_id,
                cwd: field("cwd"),
                window_name: field("window_name"),
                transcript_path: field("transcript_path"),
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_by_session_prefix() {
        let raw = json!({
            "termgram:@1": {"session_id": "s1", "cwd": "/a"},
            "other:@2": {"session_id": "s2", "cwd": "/b"},
        });
        let parsed = parse_session_map(&raw, "termgram:");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["@1"].session_id, "s1");
        assert_eq!(parsed["@1"].cwd, "/a");
    }

    #[test]
    fn drops_entries_without_session_id() {
        let raw = json!({
            "termgram:@1": {"cwd": "/a"},
            "termgram:@2": {"session_id": "", "cwd": "/b"},
        });
        assert!(parse_session_map(&raw, "termgram:").is_empty());
    }

    #[test]
    fn keeps_old_format_name_keys() {
        let raw = json!({
            "termgram:myproj": {"session_id": "s1", "cwd": "/a", "window_name": "myproj"},
        });
        let parsed = parse_session_map(&raw, "termgram:");
        assert_eq!(parsed["myproj"].window_name, "myproj");
    }

    #[test]
    fn tolerates_non_object_values() {
        let raw = json!({"termgram:@1": "garbage"});
        assert!(parse_session_map(&raw, "termgram:").is_empty());
        assert!(parse_session_map(&json!([1, 2]), "termgram:").is_empty());
    }
}
