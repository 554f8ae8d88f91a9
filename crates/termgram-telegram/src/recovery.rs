//! Dead-window recovery: Fresh / Continue / Resume / Cancel.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::{debug, info};

use crate::binding::{create_and_bind, forward_pending_text};
use crate::callback::encode;
use crate::context::{AppContext, PendingRecovery};
use crate::router::CbMeta;
use crate::sender;

pub const MAX_RESUME_SESSIONS: usize = 6;

pub fn build_recovery_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("🆕 Fresh", encode(&format!("rec:f:{window_id}"))),
            InlineKeyboardButton::callback("▶ Continue", encode(&format!("rec:c:{window_id}"))),
            InlineKeyboardButton::callback("📂 Resume", encode(&format!("rec:r:{window_id}"))),
        ],
        vec![InlineKeyboardButton::callback("✖ Cancel", encode("rec:x"))],
    ])
}

fn build_resume_picker(sessions: &[(String, String)], window_id: &str) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for (idx, (session_id, summary)) in sessions.iter().take(MAX_RESUME_SESSIONS).enumerate() {
        let label: String = if summary.is_empty() {
            session_id.chars().take(12).collect()
        } else {
            summary.chars().take(40).collect()
        };
        rows.push(vec![InlineKeyboardButton::callback(
            label,
            encode(&format!("rec:p:{idx}")),
        )]);
    }
    rows.push(vec![
        InlineKeyboardButton::callback("⬅ Back", encode(&format!("rec:b:{window_id}"))),
        InlineKeyboardButton::callback("✖ Cancel", encode("rec:x")),
    ]);
    InlineKeyboardMarkup::new(rows)
}

/// Scan sessions-index files for sessions whose project path matches `cwd`.
/// Most recent first, capped.
pub fn scan_sessions_for_cwd(projects_path: &Path, cwd: &str) -> Vec<(String, String)> {
    let resolved_cwd = std::fs::canonicalize(cwd)
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| cwd.to_string());

    let mut candidates: Vec<(f64, (String, String))> = Vec::new();
    let Ok(dirs) = std::fs::read_dir(projects_path) else {
        return Vec::new();
    };
    for project_dir in dirs.flatten() {
        let index_file = project_dir.path().join("sessions-index.json");
        let Ok(content) = std::fs::read_to_string(&index_file) else {
            continue;
        };
        let Ok(index) = serde_json::from_str::<Value>(&content) else {
            continue;
        };
        let original_path = index
            .get("originalPath")
            .and_then(Value::as_str)
            .unwrap_or("");
        for entry in index
            .get("entries")
            .and_then(Value::as_array)
            .map(|a| a.as_slice())
            .unwrap_or(&[])
        {
            let session_id = entry.get("sessionId").and_then(Value::as_str).unwrap_or("");
            let full_path = entry.get("fullPath").and_then(Value::as_str).unwrap_or("");
            if session_id.is_empty() || full_path.is_empty() {
                continue;
            }
            let project_path = entry
                .get("projectPath")
                .and_then(Value::as_str)
                .unwrap_or(original_path);
            let norm = std::fs::canonicalize(project_path)
                .ok()
                .and_then(|p| p.to_str().map(str::to_string))
                .unwrap_or_else(|| project_path.to_string());
            if norm != resolved_cwd {
                continue;
            }
            let file_path = Path::new(full_path);
            if !file_path.exists() {
                continue;
            }
            let mtime = std::fs::metadata(file_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let summary = entry
                .get("summary")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| session_id.chars().take(12).collect());
            candidates.push((mtime, (session_id.to_string(), summary)));
        }
    }

    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates
        .into_iter()
        .take(MAX_RESUME_SESSIONS)
        .map(|(_, entry)| entry)
        .collect()
}

/// Validate that a recovery callback belongs to the topic that owns the
/// state. Supports both the text-handler path (state already stashed) and
/// the proactive-notification path (state derived from the binding).
fn validate(ctx: &AppContext, cb: &CbMeta, window_id: &str) -> Option<(i32, String)> {
    let thread_id = cb.thread_id?;
    match ctx.recovery.get(&cb.user_id).map(|r| r.clone()) {
        Some(rec) => {
            if rec.thread_id != thread_id || rec.window_id != window_id {
                return None;
            }
        }
        None => {
            let bound = ctx.store.get_window_for_thread(cb.user_id, thread_id)?;
            if bound != window_id {
                return None;
            }
            ctx.recovery.insert(
                cb.user_id,
                PendingRecovery {
                    thread_id,
                    window_id: window_id.to_string(),
                    pending_text: None,
                    sessions: Vec::new(),
                },
            );
        }
    }
    let cwd = ctx.store.get_window_state(window_id).cwd;
    Some((thread_id, cwd))
}

fn clear_state(ctx: &AppContext, user_id: i64) {
    ctx.recovery.remove(&user_id);
}

async fn edit_cb(ctx: &AppContext, cb: &CbMeta, text: &str, kb: Option<InlineKeyboardMarkup>) {
    if let Some(message_id) = cb.message_id {
        let _ = sender::edit_md(&ctx.bot, cb.chat_id, message_id, text, kb).await;
    }
}

/// Shared tail of Fresh/Continue/Pick: unbind the dead window, create and
/// bind a replacement, forward the stashed text.
async fn recover_into_new_window(
    ctx: &Arc<AppContext>,
    cb: &CbMeta,
    thread_id: i32,
    cwd: &str,
    extra_args: &str,
    success_label: &str,
) -> (String, bool) {
    ctx.store.unbind_thread(cb.user_id, thread_id);
    ctx.dead_notified
        .retain(|(u, t, _)| !(*u == cb.user_id && *t == thread_id));

    let pending_text = ctx
        .recovery
        .get(&cb.user_id)
        .and_then(|r| r.pending_text.clone());

    match create_and_bind(ctx, cb.user_id, thread_id, cwd, extra_args).await {
        Ok(created) => {
            edit_cb(
                ctx,
                cb,
                &format!("✅ {}\n\n{success_label}", created.message),
                None,
            )
            .await;
            clear_state(ctx, cb.user_id);
            forward_pending_text(ctx, cb.user_id, thread_id, &created.window_id, pending_text)
                .await;
            ("Created".to_string(), false)
        }
        Err(e) => {
            edit_cb(ctx, cb, &format!("❌ {e}"), None).await;
            clear_state(ctx, cb.user_id);
            ("Failed".to_string(), false)
        }
    }
}

pub async fn handle_fresh(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> (String, bool) {
    let Some((thread_id, cwd)) = validate(ctx, cb, window_id) else {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    };
    if cwd.is_empty() || !Path::new(&cwd).is_dir() {
        edit_cb(ctx, cb, "❌ Directory no longer exists.", None).await;
        clear_state(ctx, cb.user_id);
        return ("Failed".to_string(), false);
    }
    info!(user_id = cb.user_id, window_id, "recovery: fresh session");
    recover_into_new_window(ctx, cb, thread_id, &cwd, "", "Fresh session started.").await
}

pub async fn handle_continue(
    ctx: &Arc<AppContext>,
    cb: &CbMeta,
    window_id: &str,
) -> (String, bool) {
    let Some((thread_id, cwd)) = validate(ctx, cb, window_id) else {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    };
    if cwd.is_empty() || !Path::new(&cwd).is_dir() {
        edit_cb(ctx, cb, "❌ Directory no longer exists.", None).await;
        clear_state(ctx, cb.user_id);
        return ("Failed".to_string(), false);
    }
    info!(user_id = cb.user_id, window_id, "recovery: continue session");
    recover_into_new_window(
        ctx,
        cb,
        thread_id,
        &cwd,
        "--continue",
        "Continuing previous session.",
    )
    .await
}

pub async fn handle_resume(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> (String, bool) {
    let Some((_, cwd)) = validate(ctx, cb, window_id) else {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    };
    if cwd.is_empty() || !Path::new(&cwd).is_dir() {
        edit_cb(ctx, cb, "❌ Directory no longer exists.", None).await;
        clear_state(ctx, cb.user_id);
        return ("Failed".to_string(), false);
    }

    let projects = ctx.store.projects_path();
    let cwd2 = cwd.clone();
    let sessions = tokio::task::spawn_blocking(move || scan_sessions_for_cwd(&projects, &cwd2))
        .await
        .unwrap_or_default();
    if sessions.is_empty() {
        return ("No sessions found for this directory".to_string(), true);
    }

    if let Some(mut rec) = ctx.recovery.get_mut(&cb.user_id) {
        rec.sessions = sessions.clone();
    }
    let keyboard = build_resume_picker(&sessions, window_id);
    edit_cb(
        ctx,
        cb,
        &format!("📂 Select a session to resume:\n(`{cwd}`)"),
        Some(keyboard),
    )
    .await;
    (String::new(), false)
}

pub async fn handle_pick(ctx: &Arc<AppContext>, cb: &CbMeta, idx: usize) -> (String, bool) {
    let Some(thread_id) = cb.thread_id else {
        return ("Use in a topic".to_string(), true);
    };
    let Some(rec) = ctx.recovery.get(&cb.user_id).map(|r| r.clone()) else {
        return ("Stale recovery state".to_string(), true);
    };
    if rec.thread_id != thread_id {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    }
    let Some((session_id, summary)) = rec.sessions.get(idx).cloned() else {
        return ("Invalid session index".to_string(), true);
    };

    let cwd = ctx.store.get_window_state(&rec.window_id).cwd;
    if cwd.is_empty() || !Path::new(&cwd).is_dir() {
        edit_cb(ctx, cb, "❌ Directory no longer exists.", None).await;
        clear_state(ctx, cb.user_id);
        return ("Failed".to_string(), false);
    }

    debug!(session_id = %session_id, "recovery: resuming picked session");
    let label: String = summary.chars().take(40).collect();
    recover_into_new_window(
        ctx,
        cb,
        thread_id,
        &cwd,
        &format!("--resume {session_id}"),
        &format!("Resuming session: {label}"),
    )
    .await
}

pub async fn handle_back(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> (String, bool) {
    if validate(ctx, cb, window_id).is_none() {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    }
    edit_cb(
        ctx,
        cb,
        "⚠ Session ended. Choose an option:",
        Some(build_recovery_keyboard(window_id)),
    )
    .await;
    (String::new(), false)
}

pub async fn handle_cancel(ctx: &Arc<AppContext>, cb: &CbMeta) -> (String, bool) {
    let Some(thread_id) = cb.thread_id else {
        return ("Stale recovery (topic mismatch)".to_string(), true);
    };
    if let Some(rec) = ctx.recovery.get(&cb.user_id) {
        if rec.thread_id != thread_id {
            return ("Stale recovery (topic mismatch)".to_string(), true);
        }
    }
    clear_state(ctx, cb.user_id);
    edit_cb(ctx, cb, "Cancelled. Send a message to try again.", None).await;
    ("Cancelled".to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn recovery_keyboard_has_four_buttons() {
        let kb = build_recovery_keyboard("@9");
        let total: usize = kb.inline_keyboard.iter().map(|r| r.len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn resume_picker_caps_sessions() {
        let sessions: Vec<(String, String)> = (0..10)
            .map(|i| (format!("sid-{i}"), format!("summary {i}")))
            .collect();
        let kb = build_resume_picker(&sessions, "@1");
        // 6 session rows + back/cancel row
        assert_eq!(kb.inline_keyboard.len(), MAX_RESUME_SESSIONS + 1);
    }

    #[test]
    fn scan_matches_by_project_path_most_recent_first() {
        let projects = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let cwd_str = cwd.path().to_str().unwrap();

        let pdir = projects.path().join("p");
        std::fs::create_dir_all(&pdir).unwrap();
        let old = pdir.join("old.jsonl");
        let new = pdir.join("new.jsonl");
        std::fs::write(&old, "{}\n").unwrap();
        std::fs::write(&new, "{}\n").unwrap();
        let earlier = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::open(&old).unwrap().set_modified(earlier).unwrap();

        let index = serde_json::json!({
            "originalPath": cwd_str,
            "entries": [
                {"sessionId": "old", "fullPath": old.to_str().unwrap(),
                 "projectPath": cwd_str, "summary": "older work"},
                {"sessionId": "new", "fullPath": new.to_str().unwrap(),
                 "projectPath": cwd_str, "summary": "newer work"},
            ],
        });
        std::fs::write(
            pdir.join("sessions-index.json"),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();

        let found = scan_sessions_for_cwd(projects.path(), cwd_str);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "new");
        assert_eq!(found[1].1, "older work");
    }

    #[test]
    fn scan_skips_other_directories() {
        let projects = TempDir::new().unwrap();
        let pdir = projects.path().join("p");
        std::fs::create_dir_all(&pdir).unwrap();
        std::fs::write(
            pdir.join("sessions-index.json"),
            serde_json::json!({
                "originalPath": "/elsewhere",
                "entries": [{"sessionId": "s", "fullPath": "/nope.jsonl",
                             "projectPath": "/elsewhere"}],
            })
            .to_string(),
        )
        .unwrap();
        assert!(scan_sessions_for_cwd(projects.path(), "/different").is_empty());
    }
}
