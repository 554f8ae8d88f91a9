//! Slash command handlers. Unknown commands are forwarded to the agent CLI
//! running in the bound window.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::{debug, info};

use crate::binding::send_to_window;
use crate::callback::encode;
use crate::context::{AppContext, PendingResume};
use crate::dashboard::{build_dashboard, dashboard_data};
use crate::handler::MsgMeta;
use crate::history::send_history;
use crate::recovery::scan_sessions_for_cwd;
use crate::screenshot::send_screenshot;
use crate::sender;

/// Sessions per `/resume` browser page.
pub const RESUME_PAGE_SIZE: usize = 6;

async fn reply(ctx: &AppContext, meta: &MsgMeta, text: &str) {
    let _ = sender::send_md(&ctx.bot, meta.chat_id, meta.thread_id, text, None).await;
}

async fn reply_kb(
    ctx: &AppContext,
    meta: &MsgMeta,
    text: &str,
    keyboard: InlineKeyboardMarkup,
) {
    let _ = sender::send_md(&ctx.bot, meta.chat_id, meta.thread_id, text, Some(keyboard)).await;
}

/// Resolve the bound window or tell the user there is none.
async fn require_window(ctx: &AppContext, meta: &MsgMeta) -> Option<String> {
    match ctx
        .store
        .resolve_window_for_thread(meta.user_id, meta.thread_id)
    {
        Some(wid) => Some(wid),
        None => {
            reply(ctx, meta, "❌ No session bound to this topic.").await;
            None
        }
    }
}

/// Dispatch a `/command` message.
pub async fn handle_command(ctx: &Arc<AppContext>, meta: &MsgMeta, text: &str) {
    let command = text
        .split_whitespace()
        .next()
        .unwrap_or("")
        .split('@')
        .next()
        .unwrap_or("");
    match command {
        "/start" => start(ctx, meta).await,
        "/history" => history(ctx, meta).await,
        "/screenshot" => screenshot(ctx, meta).await,
        "/esc" => esc(ctx, meta).await,
        "/unbind" => unbind(ctx, meta).await,
        "/usage" => usage(ctx, meta).await,
        "/resume" => resume(ctx, meta).await,
        "/sessions" => sessions(ctx, meta).await,
        _ => forward_command(ctx, meta, text).await,
    }
}

async fn start(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    ctx.ui.remove(&meta.user_id);
    reply(
        ctx,
        meta,
        "🤖 **Terminal Bridge**\n\nEach topic is a session. Create a new topic to start.",
    )
    .await;
}

async fn history(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    let end = send_history(ctx, meta.chat_id, meta.thread_id, &window_id, 0, None, (0, 0)).await;
    // The initial view marks everything shown as read.
    if let Some(end) = end {
        ctx.store
            .update_user_window_offset(meta.user_id, &window_id, end);
    }
}

async fn screenshot(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    if let Err(e) = send_screenshot(ctx, meta.chat_id, meta.thread_id, &window_id).await {
        reply(ctx, meta, &format!("❌ {e}")).await;
    }
}

async fn esc(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    let Ok(Some(window)) = ctx.tmux.find_window_by_id(&window_id).await else {
        let display = ctx.store.get_display_name(&window_id);
        reply(ctx, meta, &format!("❌ Window '{display}' no longer exists.")).await;
        return;
    };
    ctx.tmux.send_keys(&window.window_id, "Escape", false, false).await;
    reply(ctx, meta, "⎋ Sent Escape").await;
}

async fn unbind(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(thread_id) = meta.thread_id else {
        reply(ctx, meta, "❌ This command only works in a topic.").await;
        return;
    };
    let Some(window_id) = ctx.store.get_window_for_thread(meta.user_id, thread_id) else {
        reply(ctx, meta, "❌ No session bound to this topic.").await;
        return;
    };
    let display = ctx.store.get_display_name(&window_id);
    ctx.store.unbind_thread(meta.user_id, thread_id);
    ctx.clear_topic_state(meta.user_id, thread_id).await;
    reply(
        ctx,
        meta,
        &format!(
            "✅ Topic unbound from window '{display}'.\n\
             The agent session is still running in tmux.\n\
             Send a message to bind to a new session."
        ),
    )
    .await;
}

/// Drive the CLI's usage panel: open it, capture, dismiss, parse.
async fn usage(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    let Ok(Some(window)) = ctx.tmux.find_window_by_id(&window_id).await else {
        reply(ctx, meta, &format!("❌ Window '{window_id}' no longer exists.")).await;
        return;
    };

    ctx.tmux.send_keys(&window.window_id, "/usage", true, true).await;
    // Give the modal time to render.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let pane_text = ctx.tmux.capture_pane(&window.window_id, false).await;
    ctx.tmux
        .send_keys(&window.window_id, "Escape", false, false)
        .await;

    let Some(pane_text) = pane_text else {
        reply(ctx, meta, "Failed to capture usage info.").await;
        return;
    };

    match termgram_terminal::parse_usage_output(&pane_text) {
        Some(usage) => {
            let body = usage.parsed_lines.join("\n");
            reply(ctx, meta, &format!("```\n{body}\n```")).await;
        }
        None => {
            let mut trimmed = pane_text.trim().to_string();
            if trimmed.chars().count() > 3000 {
                trimmed = trimmed.chars().take(3000).collect::<String>() + "\n... (truncated)";
            }
            reply(ctx, meta, &format!("```\n{trimmed}\n```")).await;
        }
    }
}

/// Build one `/resume` browser page over all sessions for the project.
pub fn build_resume_browser(
    sessions: &[(String, String)],
    page: usize,
) -> (String, InlineKeyboardMarkup) {
    let total_pages = sessions.len().div_ceil(RESUME_PAGE_SIZE).max(1);
    let page = page.min(total_pages - 1);
    let start = page * RESUME_PAGE_SIZE;

    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for (offset, (session_id, summary)) in
        sessions.iter().skip(start).take(RESUME_PAGE_SIZE).enumerate()
    {
        let idx = start + offset;
        let label: String = if summary.is_empty() {
            session_id.chars().take(12).collect()
        } else {
            summary.chars().take(40).collect()
        };
        rows.push(vec![InlineKeyboardButton::callback(
            label,
            encode(&format!("res:p:{idx}")),
        )]);
    }

    if total_pages > 1 {
        let mut nav = Vec::new();
        if page > 0 {
            nav.push(InlineKeyboardButton::callback(
                "◀",
                encode(&format!("res:pg:{}", page - 1)),
            ));
        }
        nav.push(InlineKeyboardButton::callback(
            format!("{}/{}", page + 1, total_pages),
            encode("noop"),
        ));
        if page + 1 < total_pages {
            nav.push(InlineKeyboardButton::callback(
                "▶",
                encode(&format!("res:pg:{}", page + 1)),
            ));
        }
        rows.push(nav);
    }
    rows.push(vec![InlineKeyboardButton::callback("✖ Cancel", encode("res:x"))]);

    let text = format!(
        "📂 {} session(s) for this project. Pick one to resume:",
        sessions.len()
    );
    (text, InlineKeyboardMarkup::new(rows))
}

async fn resume(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(thread_id) = meta.thread_id else {
        reply(ctx, meta, "❌ This command only works in a topic.").await;
        return;
    };
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    let cwd = ctx.store.get_window_state(&window_id).cwd;
    if cwd.is_empty() {
        reply(ctx, meta, "❌ No working directory known for this session yet.").await;
        return;
    }

    let projects = ctx.store.projects_path();
    let cwd2 = cwd.clone();
    let sessions = tokio::task::spawn_blocking(move || scan_sessions_for_cwd(&projects, &cwd2))
        .await
        .unwrap_or_default();
    if sessions.is_empty() {
        reply(ctx, meta, "No resumable sessions found for this directory.").await;
        return;
    }

    ctx.resume.insert(
        meta.user_id,
        PendingResume {
            thread_id,
            window_id,
            sessions: sessions.clone(),
            page: 0,
        },
    );
    let (text, keyboard) = build_resume_browser(&sessions, 0);
    reply_kb(ctx, meta, &text, keyboard).await;
}

async fn sessions(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let (windows, bound, modes) = dashboard_data(ctx).await;
    let (text, keyboard) = build_dashboard(&windows, &bound, &modes);
    reply_kb(ctx, meta, &text, keyboard).await;
}

/// Forward any other slash command to the agent CLI.
async fn forward_command(ctx: &Arc<AppContext>, meta: &MsgMeta, text: &str) {
    // Strip a trailing bot mention ("/clear@mybot args" → "/clear args").
    let forwarded = text.split('@').next().unwrap_or(text).to_string();
    let Some(window_id) = require_window(ctx, meta).await else {
        return;
    };
    let display_name = ctx.store.get_display_name(&window_id);
    info!(command = %forwarded, window = %display_name, "forwarding command");

    let mut typing = ctx
        .bot
        .send_chat_action(ChatId(meta.chat_id), teloxide::types::ChatAction::Typing);
    if let Some(t) = sender::as_thread(meta.thread_id) {
        typing = typing.message_thread_id(t);
    }
    let _ = typing.await;

    match send_to_window(ctx, &window_id, &forwarded).await {
        Ok(_) => {
            reply(ctx, meta, &format!("⚡ [{display_name}] Sent: {forwarded}")).await;
            // `/clear` starts a fresh session; forget the old association so
            // the new session id is picked up from the hook.
            if forwarded.trim().eq_ignore_ascii_case("/clear") {
                debug!(window_id = %window_id, "clearing session after /clear");
                ctx.store.clear_window_session(&window_id);
            }
        }
        Err(e) => reply(ctx, meta, &format!("❌ {e}")).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_browser_paginates() {
        let sessions: Vec<(String, String)> = (0..14)
            .map(|i| (format!("sid-{i}"), format!("work {i}")))
            .collect();
        let (text, kb) = build_resume_browser(&sessions, 1);
        assert!(text.contains("14 session(s)"));
        // 6 sessions + nav row + cancel row
        assert_eq!(kb.inline_keyboard.len(), RESUME_PAGE_SIZE + 2);
    }

    #[test]
    fn resume_browser_single_page_has_no_nav() {
        let sessions = vec![("sid".to_string(), "w".to_string())];
        let (_, kb) = build_resume_browser(&sessions, 0);
        assert_eq!(kb.inline_keyboard.len(), 2);
    }
}
