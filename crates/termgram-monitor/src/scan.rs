//! Fallback transcript discovery: scan the CLI's projects tree for session
//! files belonging to active window working directories.
//!
//! Used only for session-map entries without a `transcript_path` (older hook
//! versions). Runs on a blocking thread — it walks the filesystem.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

/// A discovered session file.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFile {
    pub session_id: String,
    pub file_path: PathBuf,
}

/// Read the `cwd` field from the first transcript entry that has one.
pub fn read_cwd_from_jsonl(path: &Path) -> String {
    let Ok(file) = std::fs::File::open(path) else {
        return String::new();
    };
    let reader = std::io::BufReader::new(file);
    for line in reader.lines().map_while(|l| l.ok()) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<Value>(line) {
            if let Some(cwd) = entry.get("cwd").and_then(Value::as_str) {
                if !cwd.is_empty() {
                    return cwd.to_string();
                }
            }
        }
    }
    String::new()
}

fn normalize(path: &str) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| path.to_string())
}

/// Scan the projects tree for session files whose project path matches one
/// of `active_cwds` (normalized). Indexed sessions come from
/// `sessions-index.json`; un-indexed `*.jsonl` files are matched through
/// their first-line `cwd` or the directory-name encoding.
pub fn scan_projects(projects_path: &Path, active_cwds: &HashSet<String>) -> Vec<SessionFile> {
    let mut sessions: Vec<SessionFile> = Vec::new();
    let Ok(entries) = std::fs::read_dir(projects_path) else {
        return sessions;
    };

    for project_dir in entries.flatten() {
        let dir_path = project_dir.path();
        if !dir_path.is_dir() {
            continue;
        }

        let index_file = dir_path.join("sessions-index.json");
        let mut original_path = String::new();
        let mut indexed_ids: HashSet<String> = HashSet::new();

        if let Ok(content) = std::fs::read_to_string(&index_file) {
            if let Ok(index) = serde_json::from_str::<Value>(&content) {
                original_path = index
                    .get("originalPath")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                for entry in index
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|a| a.as_slice())
                    .unwrap_or(&[])
                {
                    let session_id = entry
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let full_path = entry.get("fullPath").and_then(Value::as_str).unwrap_or("");
                    if session_id.is_empty() || full_path.is_empty() {
                        continue;
                    }
                    let project_path = entry
                        .get("projectPath")
                        .and_then(Value::as_str)
                        .unwrap_or(&original_path);
                    if !active_cwds.contains(&normalize(project_path)) {
                        continue;
                    }
                    indexed_ids.insert(session_id.to_string());
                    let file_path = PathBuf::from(full_path);
                    if file_path.exists() {
                        sessions.push(SessionFile {
                            session_id: session_id.to_string(),
                            file_path,
                        });
                    }
                }
            }
        }

        // Un-indexed .jsonl files.
        let Ok(files) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if indexed_ids.contains(session_id) {
                continue;
            }

            let mut project_path = original_path.clone();
            if project_path.is_empty() {
                project_path = read_cwd_from_jsonl(&path);
            }
            if project_path.is_empty() {
                // Directory-name encoding: "-data-code-app" → "/data/code/app"
                if let Some(name) = dir_path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with('-') {
                        project_path = name.replace('-', "/");
                    }
                }
            }

            if active_cwds.contains(&normalize(&project_path)) {
                debug!(session_id, path = %path.display(), "found un-indexed session");
                sessions.push(SessionFile {
                    session_id: session_id.to_string(),
                    file_path: path,
                });
            }
        }
    }

    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_cwd_from_first_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"summary\"}\n{\"type\":\"user\",\"cwd\":\"/data/app\"}\n",
        )
        .unwrap();
        assert_eq!(read_cwd_from_jsonl(&path), "/data/app");
        assert_eq!(read_cwd_from_jsonl(&dir.path().join("missing.jsonl")), "");
    }

    #[test]
    fn indexed_sessions_matched_by_project_path() {
        let dir = TempDir::new().unwrap();
        let cwd_dir = TempDir::new().unwrap();
        let cwd = cwd_dir.path().to_str().unwrap().to_string();

        let project = dir.path().join("proj");
        std::fs::create_dir_all(&project).unwrap();
        let transcript = project.join("sid-1.jsonl");
        std::fs::write(&transcript, "{}\n").unwrap();
        let index = serde_json::json!({
            "originalPath": cwd,
            "entries": [
                {"sessionId": "sid-1", "fullPath": transcript.to_str().unwrap(),
                 "projectPath": cwd},
                {"sessionId": "sid-2", "fullPath": "/nonexistent.jsonl",
                 "projectPath": "/elsewhere"},
            ],
        });
        std::fs::write(
            project.join("sessions-index.json"),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();

        let active: HashSet<String> = [normalize(&cwd)].into_iter().collect();
        let found = scan_projects(dir.path(), &active);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, "sid-1");
    }

    #[test]
    fn unindexed_files_matched_by_first_line_cwd() {
        let dir = TempDir::new().unwrap();
        let cwd_dir = TempDir::new().unwrap();
        let cwd = cwd_dir.path().to_str().unwrap().to_string();

        let project = dir.path().join("other");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("sid-9.jsonl"),
            format!("{{\"type\":\"user\",\"cwd\":\"{cwd}\"}}\n"),
        )
        .unwrap();

        let active: HashSet<String> = [normalize(&cwd)].into_iter().collect();
        let found = scan_projects(dir.path(), &active);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, "sid-9");
    }

    #[test]
    fn inactive_cwds_are_skipped() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("p");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join("sid.jsonl"),
            "{\"type\":\"user\",\"cwd\":\"/not/active\"}\n",
        )
        .unwrap();
        let active: HashSet<String> = HashSet::new();
        assert!(scan_projects(dir.path(), &active).is_empty());
    }
}
