//! Window → transcript resolution and history reading.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use termgram_transcript::{parse_entries, parse_line, parser::extract_text_only, MessageRecord};

use crate::store::SessionStore;

/// A re-export for callers that only render history.
pub type HistoryMessage = MessageRecord;

/// Resolved transcript info for a window's current session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeSession {
    pub session_id: String,
    /// Transcript summary entry, or the last user message, or "Untitled".
    pub summary: String,
    pub message_count: usize,
    pub file_path: String,
}

/// Direct transcript path: `<projects>/<encoded cwd>/<session_id>.jsonl`
/// where the cwd encoding replaces `/` with `-`.
pub fn build_session_file_path(
    projects_path: &Path,
    session_id: &str,
    cwd: &str,
) -> Option<PathBuf> {
    if session_id.is_empty() || cwd.is_empty() {
        return None;
    }
    let encoded = cwd.replace('/', "-");
    Some(projects_path.join(encoded).join(format!("{session_id}.jsonl")))
}

fn glob_session_file(projects_path: &Path, session_id: &str) -> Option<PathBuf> {
    let target = format!("{session_id}.jsonl");
    let entries = std::fs::read_dir(projects_path).ok()?;
    for entry in entries.flatten() {
        let candidate = entry.path().join(&target);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "found session via scan");
            return Some(candidate);
        }
    }
    None
}

/// Resolve a window to its current session's transcript.
///
/// Uses the persisted session_id + cwd to build the path directly, scanning
/// the projects tree as a fallback. When the file is gone, the stale
/// association is cleared from the store and `None` is returned.
pub async fn resolve_session_for_window(
    store: &SessionStore,
    window_id: &str,
) -> Option<ClaudeSession> {
    let ws = store.get_window_state(window_id);
    if ws.session_id.is_empty() || ws.cwd.is_empty() {
        return None;
    }

    let projects = store.projects_path();
    let direct = build_session_file_path(&projects, &ws.session_id, &ws.cwd);
    let file_path = match direct.filter(|p| p.exists()) {
        Some(p) => p,
        None => match glob_session_file(&projects, &ws.session_id) {
            Some(p) => p,
            None => {
                warn!(
                    window_id,
                    session_id = %ws.session_id,
                    cwd = %ws.cwd,
                    "transcript no longer exists, clearing association"
                );
                store.clear_window_association(window_id);
                return None;
            }
        },
    };

    // One pass: count entries, pick up the summary, remember the last user
    // message as a title fallback.
    let content = match tokio::fs::read_to_string(&file_path).await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let mut summary = String::new();
    let mut last_user_msg = String::new();
    let mut message_count = 0usize;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        message_count += 1;
        let Some(entry) = parse_line(line) else {
            continue;
        };
        match entry.get("type").and_then(Value::as_str) {
            Some("summary") => {
                if let Some(s) = entry.get("summary").and_then(Value::as_str) {
                    if !s.is_empty() {
                        summary = s.to_string();
                    }
                }
            }
            Some("user") => {
                if let Some(content) = entry.get("message").and_then(|m| m.get("content")) {
                    let text = extract_text_only(content);
                    let text = text.trim();
                    if !text.is_empty() && !text.starts_with('<') {
                        last_user_msg = text.to_string();
                    }
                }
            }
            _ => {}
        }
    }

    if summary.is_empty() {
        summary = if last_user_msg.is_empty() {
            "Untitled".to_string()
        } else {
            last_user_msg.chars().take(50).collect()
        };
    }

    Some(ClaudeSession {
        session_id: ws.session_id,
        summary,
        message_count,
        file_path: file_path.to_string_lossy().into_owned(),
    })
}

/// Read user/assistant messages for a window's session, optionally limited
/// to a byte range of the transcript. Returns (messages, total_count).
pub async fn get_recent_messages(
    store: &SessionStore,
    window_id: &str,
    start_byte: u64,
    end_byte: Option<u64>,
) -> (Vec<MessageRecord>, usize) {
    let Some(session) = resolve_session_for_window(store, window_id).await else {
        return (Vec::new(), 0);
    };

    let bytes = match tokio::fs::read(&session.file_path).await {
        Ok(b) => b,
        Err(_) => return (Vec::new(), 0),
    };
    let start = (start_byte as usize).min(bytes.len());
    let end = end_byte
        .map(|e| (e as usize).min(bytes.len()))
        .unwrap_or(bytes.len());
    if start >= end {
        return (Vec::new(), 0);
    }
    let slice = String::from_utf8_lossy(&bytes[start..end]);

    let entries: Vec<Value> = slice.lines().filter_map(parse_line).collect();
    let (records, _) = parse_entries(&entries, None);
    let count = records.len();
    (records, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_session(dir: &TempDir, session_id: &str, cwd: &str) -> SessionStore {
        let store = SessionStore::load(
            &dir.path().join("state.json"),
            &dir.path().join("session_map.json"),
            "termgram",
            &dir.path().join("projects"),
        );
        let map = serde_json::json!({
            "termgram:@1": {
                "session_id": session_id,
                "cwd": cwd,
            },
        });
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();
        store.load_session_map();
        store
    }

    fn write_transcript(dir: &TempDir, cwd: &str, session_id: &str, lines: &[&str]) -> PathBuf {
        let project = dir.path().join("projects").join(cwd.replace('/', "-"));
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join(format!("{session_id}.jsonl"));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn direct_path_encoding() {
        let p = build_session_file_path(Path::new("/p"), "sid", "/data/code/app").unwrap();
        assert_eq!(p, PathBuf::from("/p/-data-code-app/sid.jsonl"));
        assert!(build_session_file_path(Path::new("/p"), "", "/x").is_none());
    }

    #[tokio::test]
    async fn resolves_summary_and_count() {
        let dir = TempDir::new().unwrap();
        let store = store_with_session(&dir, "sid-1", "/data/app");
        write_transcript(
            &dir,
            "/data/app",
            "sid-1",
            &[
                r#"{"type":"summary","summary":"Fixing the parser"}"#,
                r#"{"type":"user","message":{"content":"hello"}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            ],
        );

        let session = resolve_session_for_window(&store, "@1").await.unwrap();
        assert_eq!(session.summary, "Fixing the parser");
        assert_eq!(session.message_count, 3);
    }

    #[tokio::test]
    async fn falls_back_to_last_user_message() {
        let dir = TempDir::new().unwrap();
        let store = store_with_session(&dir, "sid-2", "/data/app");
        write_transcript(
            &dir,
            "/data/app",
            "sid-2",
            &[r#"{"type":"user","message":{"content":"please fix the login bug"}}"#],
        );
        let session = resolve_session_for_window(&store, "@1").await.unwrap();
        assert_eq!(session.summary, "please fix the login bug");
    }

    #[tokio::test]
    async fn missing_file_clears_association() {
        let dir = TempDir::new().unwrap();
        let store = store_with_session(&dir, "sid-3", "/data/app");
        assert!(resolve_session_for_window(&store, "@1").await.is_none());
        assert!(store.get_window_state("@1").session_id.is_empty());
    }

    #[tokio::test]
    async fn recent_messages_respect_byte_range() {
        let dir = TempDir::new().unwrap();
        let store = store_with_session(&dir, "sid-4", "/data/app");
        let line1 = r#"{"type":"user","message":{"content":"first"}}"#;
        let line2 = r#"{"type":"user","message":{"content":"second"}}"#;
        write_transcript(&dir, "/data/app", "sid-4", &[line1, line2]);

        let (all, total) = get_recent_messages(&store, "@1", 0, None).await;
        assert_eq!(total, 2);
        assert_eq!(all[0].text, "first");

        let start = line1.len() as u64 + 1;
        let (tail, _) = get_recent_messages(&store, "@1", start, None).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].text, "second");
    }
}
