//! Hook payload validation and session-map merging.
//!
//! The payload arrives on stdin as JSON. Invalid payloads exit silently —
//! the hook must never break an agent session start.

use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use termgram_core::fsutil::atomic_write_json;

use crate::{HookError, Result};

/// SessionStart payload fields this hook consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub transcript_path: String,
    #[serde(default)]
    pub hook_event_name: String,
}

/// Value written into session_map.json for one window.
#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
pub struct SessionMapEntry {
    pub session_id: String,
    pub cwd: String,
    pub window_name: String,
    pub transcript_path: String,
}

/// Strict UUID check: canonical lowercase hyphenated form only.
fn is_valid_session_id(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok_and(|u| u.hyphenated().to_string() == s)
}

/// Validate a payload. Returns `None` (silent skip) for anything the hook
/// should ignore: wrong event, malformed session id, relative cwd.
pub fn validate_payload(raw: &str) -> Option<HookPayload> {
    let payload: HookPayload = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to parse hook stdin");
            return None;
        }
    };
    if payload.session_id.is_empty() || payload.hook_event_name.is_empty() {
        debug!("empty session_id or event, ignoring");
        return None;
    }
    if !is_valid_session_id(&payload.session_id) {
        warn!(session_id = %payload.session_id, "invalid session_id format");
        return None;
    }
    if !payload.cwd.is_empty() && !Path::new(&payload.cwd).is_absolute() {
        warn!(cwd = %payload.cwd, "cwd is not absolute");
        return None;
    }
    if payload.hook_event_name != "SessionStart" {
        debug!(event = %payload.hook_event_name, "ignoring non-SessionStart event");
        return None;
    }
    Some(payload)
}

/// Ask tmux which window the current pane belongs to.
///
/// Returns (session_name, window_id, window_name). `TMUX_PANE` is set by
/// tmux for every process inside a pane.
fn resolve_pane_window() -> Result<(String, String, String)> {
    let pane_id = std::env::var("TMUX_PANE")
        .map_err(|_| HookError::Tmux("TMUX_PANE not set".to_string()))?;
    let output = std::process::Command::new("tmux")
        .args([
            "display-message",
            "-t",
            &pane_id,
            "-p",
            "#{session_name}:#{window_id}:#{window_name}",
        ])
        .output()?;
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let mut parts = raw.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(session), Some(window_id), Some(window_name))
            if !session.is_empty() && !window_id.is_empty() =>
        {
            Ok((
                session.to_string(),
                window_id.to_string(),
                window_name.to_string(),
            ))
        }
        _ => Err(HookError::Tmux(format!(
            "cannot parse session:window_id:window_name from '{raw}' (pane {pane_id})"
        ))),
    }
}

/// Merge one entry into session_map.json under an exclusive advisory lock.
///
/// Concurrent hook invocations (several CLIs starting at once) serialize on
/// the sibling `.lock` file; the map itself is replaced atomically. Any
/// old-format key (`session:window_name`) for the same window is removed.
pub fn merge_session_map_entry(
    map_file: &Path,
    key: &str,
    entry: &SessionMapEntry,
    old_key: Option<&str>,
) -> Result<()> {
    let parent = map_file
        .parent()
        .ok_or_else(|| HookError::Lock("session map has no parent dir".to_string()))?;
    std::fs::create_dir_all(parent)?;

    let lock_path = map_file.with_extension("lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let _lock = Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| HookError::Lock(errno.to_string()))?;
    debug!(path = %lock_path.display(), "acquired session_map lock");

    let mut map: serde_json::Map<String, Value> = match std::fs::read_to_string(map_file) {
        Ok(content) => match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(m)) => m,
            _ => {
                warn!("existing session_map unreadable, starting fresh");
                serde_json::Map::new()
            }
        },
        Err(_) => serde_json::Map::new(),
    };

    map.insert(key.to_string(), serde_json::to_value(entry)?);

    if let Some(old) = old_key {
        if old != key && map.remove(old).is_some() {
            info!(key = old, "removed old-format session_map key");
        }
    }

    atomic_write_json(map_file, &Value::Object(map))
        .map_err(|e| HookError::Lock(e.to_string()))?;
    info!(key, session_id = %entry.session_id, cwd = %entry.cwd, "updated session_map");
    Ok(())
}

/// Full hook path: validate the stdin payload, resolve the pane's window,
/// and merge the entry. Silent on validation failures, `Err` only for
/// environmental problems worth logging at the caller.
pub fn process_hook_payload(map_file: &Path, raw_payload: &str) -> Result<()> {
    let Some(payload) = validate_payload(raw_payload) else {
        return Ok(());
    };

    let (session_name, window_id, window_name) = resolve_pane_window()?;
    let key = format!("{session_name}:{window_id}");
    let old_key = format!("{session_name}:{window_name}");

    merge_session_map_entry(
        map_file,
        &key,
        &SessionMapEntry {
            session_id: payload.session_id,
            cwd: payload.cwd,
            window_name,
            transcript_path: payload.transcript_path,
        },
        Some(&old_key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SID: &str = "0190c5a8-1234-7def-8abc-0123456789ab";

    fn payload_json(session_id: &str, cwd: &str, event: &str) -> String {
        serde_json::json!({
            "session_id": session_id,
            "cwd": cwd,
            "transcript_path": "/t/x.jsonl",
            "hook_event_name": event,
        })
        .to_string()
    }

    #[test]
    fn accepts_valid_payload() {
        let p = validate_payload(&payload_json(SID, "/home/u/proj", "SessionStart")).unwrap();
        assert_eq!(p.session_id, SID);
        assert_eq!(p.transcript_path, "/t/x.jsonl");
    }

    #[test]
    fn rejects_bad_session_ids() {
        assert!(validate_payload(&payload_json("not-a-uuid", "/a", "SessionStart")).is_none());
        let upper = SID.to_uppercase();
        assert!(validate_payload(&payload_json(&upper, "/a", "SessionStart")).is_none());
        assert!(validate_payload(&payload_json("", "/a", "SessionStart")).is_none());
    }

    #[test]
    fn rejects_relative_cwd() {
        assert!(validate_payload(&payload_json(SID, "relative/path", "SessionStart")).is_none());
    }

    #[test]
    fn ignores_other_events() {
        assert!(validate_payload(&payload_json(SID, "/a", "SessionEnd")).is_none());
    }

    #[test]
    fn ignores_garbage_stdin() {
        assert!(validate_payload("not json at all").is_none());
    }

    #[test]
    fn merge_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let map_file = dir.path().join("session_map.json");
        let entry = SessionMapEntry {
            session_id: SID.to_string(),
            cwd: "/a".to_string(),
            window_name: "proj".to_string(),
            transcript_path: "/t/x.jsonl".to_string(),
        };
        merge_session_map_entry(&map_file, "termgram:@5", &entry, None).unwrap();

        let map: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_file).unwrap()).unwrap();
        assert_eq!(map["termgram:@5"]["session_id"], SID);

        let updated = SessionMapEntry {
            cwd: "/b".to_string(),
            ..entry
        };
        merge_session_map_entry(&map_file, "termgram:@5", &updated, None).unwrap();
        let map: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_file).unwrap()).unwrap();
        assert_eq!(map["termgram:@5"]["cwd"], "/b");
    }

    #[test]
    fn merge_removes_old_format_key() {
        let dir = TempDir::new().unwrap();
        let map_file = dir.path().join("session_map.json");
        std::fs::write(
            &map_file,
            serde_json::json!({"termgram:proj": {"session_id": SID, "cwd": "/a"}}).to_string(),
        )
        .unwrap();

        let entry = SessionMapEntry {
            session_id: SID.to_string(),
            cwd: "/a".to_string(),
            window_name: "proj".to_string(),
            transcript_path: String::new(),
        };
        merge_session_map_entry(&map_file, "termgram:@5", &entry, Some("termgram:proj")).unwrap();

        let map: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_file).unwrap()).unwrap();
        assert!(map.get("termgram:proj").is_none());
        assert!(map.get("termgram:@5").is_some());
    }

    #[test]
    fn merge_survives_corrupt_map() {
        let dir = TempDir::new().unwrap();
        let map_file = dir.path().join("session_map.json");
        std::fs::write(&map_file, "{broken").unwrap();
        let entry = SessionMapEntry {
            session_id: SID.to_string(),
            cwd: "/a".to_string(),
            window_name: "p".to_string(),
            transcript_path: String::new(),
        };
        merge_session_map_entry(&map_file, "termgram:@1", &entry, None).unwrap();
        let map: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_file).unwrap()).unwrap();
        assert!(map.get("termgram:@1").is_some());
    }
}
