//! Callback-query dispatch.
//!
//! Callback data is parsed once into a `CallbackAction`; each arm validates
//! topic ownership where state is involved and always answers the query so
//! the client spinner clears.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{MaybeInaccessibleMessage, MessageId};
use tracing::{debug, info};

use crate::binding::{create_and_bind, forward_pending_text};
use crate::browser::{build_directory_browser, build_window_picker, resolve_selection};
use crate::callback::{AskKey, CallbackAction, ControlKey};
use crate::commands::build_resume_browser;
use crate::context::{AppContext, Bot, PendingUi, UiStage};
use crate::dashboard::{build_dashboard, build_kill_confirm, dashboard_data};
use crate::history::send_history;
use crate::interactive::handle_interactive_ui;
use crate::recovery;
use crate::screenshot::{refresh_screenshot, send_screenshot};
use crate::sender;

/// Where a callback came from: the user, the message it is attached to, and
/// the topic that owns it.
#[derive(Debug, Clone)]
pub struct CbMeta {
    pub user_id: i64,
    pub chat_id: i64,
    pub message_id: Option<MessageId>,
    pub thread_id: Option<i32>,
}

/// Toast shown when answering the query: (text, show_alert). Empty text is
/// a silent acknowledgement.
type Toast = (String, bool);

fn toast(text: &str) -> Toast {
    (text.to_string(), false)
}

fn alert(text: &str) -> Toast {
    (text.to_string(), true)
}

fn ok() -> Toast {
    (String::new(), false)
}

/// Entry point registered in the dispatcher.
pub async fn handle_callback(bot: Bot, q: CallbackQuery, ctx: Arc<AppContext>) -> ResponseResult<()> {
    let user_id = q.from.id.0 as i64;
    if !ctx.is_user_allowed(user_id) {
        let _ = bot
            .answer_callback_query(q.id.clone())
            .text("Not authorized")
            .await;
        return Ok(());
    }

    let Some(data) = q.data.clone() else {
        let _ = bot.answer_callback_query(q.id.clone()).await;
        return Ok(());
    };

    let (chat_id, message_id, thread_id, is_group) = match &q.message {
        Some(MaybeInaccessibleMessage::Regular(msg)) => (
            Some(msg.chat.id.0),
            Some(msg.id),
            normalize_thread(msg.thread_id.map(|t| t.0 .0)),
            msg.chat.is_group() || msg.chat.is_supergroup(),
        ),
        Some(MaybeInaccessibleMessage::Inaccessible(msg)) => {
            (Some(msg.chat.id.0), Some(msg.message_id), None, false)
        }
        None => (None, None, None, false),
    };

    // Forum routing needs the owning group chat id, not the user id.
    if is_group {
        if let Some(chat) = chat_id {
            ctx.store.set_group_chat_id(user_id, thread_id, chat);
        }
    }

    let meta = CbMeta {
        user_id,
        chat_id: chat_id.unwrap_or(user_id),
        message_id,
        thread_id,
    };

    let (text, show_alert) = match CallbackAction::parse(&data) {
        None => {
            debug!(data = %data, "malformed callback data");
            toast("Invalid data")
        }
        Some(action) => dispatch(&ctx, &meta, action).await,
    };

    let mut answer = bot.answer_callback_query(q.id.clone());
    if !text.is_empty() {
        answer = answer.text(text);
    }
    if show_alert {
        answer = answer.show_alert(true);
    }
    let _ = answer.await;
    Ok(())
}

/// Messages in the General topic arrive with thread 1; treat them as
/// topic-less so only named topics can bind.
fn normalize_thread(thread_id: Option<i32>) -> Option<i32> {
    thread_id.filter(|t| *t != 1)
}

async fn dispatch(ctx: &Arc<AppContext>, cb: &CbMeta, action: CallbackAction) -> Toast {
    match action {
        CallbackAction::HistoryPage {
            page,
            window_id,
            start,
            end,
            ..
        } => history_page(ctx, cb, page, &window_id, start, end).await,

        CallbackAction::DirSelect(idx) => dir_select(ctx, cb, idx).await,
        CallbackAction::DirUp => dir_up(ctx, cb).await,
        CallbackAction::DirPage(page) => dir_page(ctx, cb, page).await,
        CallbackAction::DirStar => dir_star(ctx, cb).await,
        CallbackAction::DirConfirm => dir_confirm(ctx, cb).await,
        CallbackAction::DirCancel => dir_cancel(ctx, cb).await,

        CallbackAction::WinBind(idx) => win_bind(ctx, cb, idx).await,
        CallbackAction::WinNew => win_new(ctx, cb).await,
        CallbackAction::WinCancel => dir_cancel(ctx, cb).await,

        CallbackAction::ScreenshotRefresh { window_id } => {
            let Some(message_id) = cb.message_id else {
                return ok();
            };
            match refresh_screenshot(ctx, cb.chat_id, message_id, &window_id).await {
                Ok(()) => toast("Refreshed"),
                Err(e) => alert(&e),
            }
        }

        CallbackAction::AskKey { key, window_id } => ask_key(ctx, cb, key, &window_id).await,
        CallbackAction::ControlKey { key, window_id } => {
            control_key(ctx, cb, key, &window_id).await
        }

        CallbackAction::SessionsRefresh => sessions_refresh(ctx, cb).await,
        CallbackAction::SessionsNew => {
            toast("Create a new topic and send a message to start a session")
        }
        CallbackAction::SessionsKill { window_id } => sessions_kill(ctx, cb, &window_id).await,
        CallbackAction::SessionsKillConfirm { window_id } => {
            sessions_kill_confirm(ctx, cb, &window_id).await
        }
        CallbackAction::SessionsMode { window_id } => sessions_mode(ctx, cb, &window_id).await,

        CallbackAction::StatusEsc { window_id } => status_esc(ctx, &window_id).await,
        CallbackAction::StatusScreenshot { window_id } => {
            match send_screenshot(ctx, cb.chat_id, cb.thread_id, &window_id).await {
                Ok(()) => ok(),
                Err(e) => alert(&e),
            }
        }

        CallbackAction::RecoveryFresh { window_id } => {
            recovery::handle_fresh(ctx, cb, &window_id).await
        }
        CallbackAction::RecoveryContinue { window_id } => {
            recovery::handle_continue(ctx, cb, &window_id).await
        }
        CallbackAction::RecoveryResume { window_id } => {
            recovery::handle_resume(ctx, cb, &window_id).await
        }
        CallbackAction::RecoveryPick(idx) => recovery::handle_pick(ctx, cb, idx).await,
        CallbackAction::RecoveryBack { window_id } => {
            recovery::handle_back(ctx, cb, &window_id).await
        }
        CallbackAction::RecoveryCancel => recovery::handle_cancel(ctx, cb).await,

        CallbackAction::ResumePick(idx) => resume_pick(ctx, cb, idx).await,
        CallbackAction::ResumePage(page) => resume_page(ctx, cb, page).await,
        CallbackAction::ResumeCancel => resume_cancel(ctx, cb).await,

        CallbackAction::Noop => ok(),
    }
}

async fn edit_cb(ctx: &AppContext, cb: &CbMeta, text: &str, kb: Option<teloxide::types::InlineKeyboardMarkup>) {
    if let Some(message_id) = cb.message_id {
        let _ = sender::edit_md(&ctx.bot, cb.chat_id, message_id, text, kb).await;
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

async fn history_page(
    ctx: &Arc<AppContext>,
    cb: &CbMeta,
    page: i64,
    window_id: &str,
    start: u64,
    end: u64,
) -> Toast {
    match ctx.tmux.find_window_by_id(window_id).await {
        Ok(Some(_)) => {
            // Offsets are not advanced on pagination: they could go
            // backwards if new messages landed while paging.
            send_history(
                ctx,
                cb.chat_id,
                cb.thread_id,
                window_id,
                page,
                cb.message_id,
                (start, end),
            )
            .await;
            toast("Page updated")
        }
        _ => {
            edit_cb(ctx, cb, "Window no longer exists.", None).await;
            ok()
        }
    }
}

// ---------------------------------------------------------------------------
// Directory browser
// ---------------------------------------------------------------------------

/// Fetch the user's browser state, enforcing topic ownership.
fn browse_state(ctx: &AppContext, cb: &CbMeta) -> Result<PendingUi, Toast> {
    let Some(pending) = ctx.ui.get(&cb.user_id).map(|p| p.clone()) else {
        return Err(alert("Browser expired, send a message to restart"));
    };
    if cb.thread_id != Some(pending.thread_id) {
        return Err(alert("Stale browser (topic mismatch)"));
    }
    Ok(pending)
}

async fn rebuild_browser(ctx: &Arc<AppContext>, cb: &CbMeta, mut pending: PendingUi) -> Toast {
    let starred = ctx.store.get_user_starred(cb.user_id);
    let mru = ctx.store.get_user_mru(cb.user_id);
    let (text, keyboard, entries) =
        build_directory_browser(&pending.browse_path, pending.browse_page, &starred, &mru);
    pending.browse_dirs = entries;
    pending.stage = UiStage::BrowsingDirectory;
    ctx.ui.insert(cb.user_id, pending);
    edit_cb(ctx, cb, &text, Some(keyboard)).await;
    ok()
}

async fn dir_select(ctx: &Arc<AppContext>, cb: &CbMeta, idx: usize) -> Toast {
    let mut pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    let Some(entry) = pending.browse_dirs.get(idx).cloned() else {
        return alert("Directory list changed, please refresh");
    };
    let new_path = resolve_selection(&pending.browse_path, &entry);
    if !std::path::Path::new(&new_path).is_dir() {
        return alert("Directory not found");
    }
    pending.browse_path = new_path;
    pending.browse_page = 0;
    rebuild_browser(ctx, cb, pending).await
}

async fn dir_up(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    let mut pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    let parent = std::path::Path::new(&pending.browse_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    pending.browse_path = parent;
    pending.browse_page = 0;
    rebuild_browser(ctx, cb, pending).await
}

async fn dir_page(ctx: &Arc<AppContext>, cb: &CbMeta, page: usize) -> Toast {
    let mut pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    pending.browse_page = page;
    rebuild_browser(ctx, cb, pending).await
}

async fn dir_star(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    let pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    let starred = ctx.store.toggle_user_star(cb.user_id, &pending.browse_path);
    let note = if starred { "⭐ Starred" } else { "Unstarred" };
    let result = rebuild_browser(ctx, cb, pending).await;
    if result.0.is_empty() {
        toast(note)
    } else {
        result
    }
}

async fn dir_confirm(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    let pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    ctx.ui.remove(&cb.user_id);

    info!(
        user_id = cb.user_id,
        path = %pending.browse_path,
        "creating session from browser"
    );
    match create_and_bind(ctx, cb.user_id, pending.thread_id, &pending.browse_path, "").await {
        Ok(created) => {
            edit_cb(
                ctx,
                cb,
                &format!("✅ {}\n\nBound to this topic. Send messages here.", created.message),
                None,
            )
            .await;
            forward_pending_text(
                ctx,
                cb.user_id,
                pending.thread_id,
                &created.window_id,
                pending.pending_text,
            )
            .await;
            toast("Created")
        }
        Err(e) => {
            edit_cb(ctx, cb, &format!("❌ {e}"), None).await;
            toast("Failed")
        }
    }
}

async fn dir_cancel(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    match browse_state(ctx, cb) {
        Ok(_) => {
            ctx.ui.remove(&cb.user_id);
            edit_cb(ctx, cb, "Cancelled", None).await;
            toast("Cancelled")
        }
        Err(t) => t,
    }
}

// ---------------------------------------------------------------------------
// Window picker
// ---------------------------------------------------------------------------

async fn win_bind(ctx: &Arc<AppContext>, cb: &CbMeta, idx: usize) -> Toast {
    let pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    let Some(window_id) = pending.unbound_windows.get(idx).cloned() else {
        return alert("Window list changed, please retry");
    };
    let Ok(Some(window)) = ctx.tmux.find_window_by_id(&window_id).await else {
        let display = ctx.store.get_display_name(&window_id);
        return alert(&format!("Window '{display}' no longer exists"));
    };

    ctx.ui.remove(&cb.user_id);
    ctx.store.bind_thread(
        cb.user_id,
        pending.thread_id,
        &window_id,
        &window.window_name,
    );
    ctx.emoji
        .rename(&ctx.bot, cb.chat_id, pending.thread_id, &window.window_name)
        .await;
    edit_cb(
        ctx,
        cb,
        &format!("✅ Bound to window `{}`", window.window_name),
        None,
    )
    .await;
    forward_pending_text(
        ctx,
        cb.user_id,
        pending.thread_id,
        &window_id,
        pending.pending_text,
    )
    .await;
    toast("Bound")
}

/// "New session" from the picker: transition into the directory browser,
/// keeping the stashed text.
async fn win_new(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    let mut pending = match browse_state(ctx, cb) {
        Ok(p) => p,
        Err(t) => return t,
    };
    pending.browse_path = std::env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "/".to_string());
    pending.browse_page = 0;
    pending.unbound_windows.clear();
    rebuild_browser(ctx, cb, pending).await
}

// ---------------------------------------------------------------------------
// Interactive prompt keys
// ---------------------------------------------------------------------------

async fn ask_key(ctx: &Arc<AppContext>, cb: &CbMeta, key: AskKey, window_id: &str) -> Toast {
    let Ok(Some(window)) = ctx.tmux.find_window_by_id(window_id).await else {
        return toast(key.label());
    };

    if let Some(tmux_key) = key.tmux_key() {
        ctx.tmux.send_keys(&window.window_id, tmux_key, false, false).await;
    }

    if key == AskKey::Esc {
        // Esc dismisses the prompt; take the keyboard message with it.
        ctx.interactive
            .clear_msg(&ctx.bot, &ctx.store, cb.user_id, cb.thread_id)
            .await;
        return toast(key.label());
    }

    // Give the TUI a beat to redraw, then refresh the mirrored prompt.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    handle_interactive_ui(
        &ctx.bot,
        &ctx.store,
        &ctx.tmux,
        &ctx.analyzer,
        &ctx.interactive,
        cb.user_id,
        window_id,
        cb.thread_id,
    )
    .await;
    toast(key.label())
}

async fn control_key(
    ctx: &Arc<AppContext>,
    cb: &CbMeta,
    key: ControlKey,
    window_id: &str,
) -> Toast {
    let Ok(Some(window)) = ctx.tmux.find_window_by_id(window_id).await else {
        return alert("Window not found");
    };
    ctx.tmux
        .send_keys(&window.window_id, key.tmux_key(), false, false)
        .await;

    // Refresh the screenshot under the keyboard after the key lands.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    if let Some(message_id) = cb.message_id {
        let _ = refresh_screenshot(ctx, cb.chat_id, message_id, window_id).await;
    }
    toast(key.label())
}

// ---------------------------------------------------------------------------
// Sessions dashboard
// ---------------------------------------------------------------------------

async fn sessions_refresh(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    let (windows, bound, modes) = dashboard_data(ctx).await;
    let (text, keyboard) = build_dashboard(&windows, &bound, &modes);
    edit_cb(ctx, cb, &text, Some(keyboard)).await;
    ok()
}

async fn sessions_kill(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> Toast {
    let display = ctx.store.get_display_name(window_id);
    let (text, keyboard) = build_kill_confirm(window_id, &display);
    edit_cb(ctx, cb, &text, Some(keyboard)).await;
    ok()
}

async fn sessions_kill_confirm(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> Toast {
    let killed = ctx.tmux.kill_window(window_id).await;
    let result = sessions_refresh(ctx, cb).await;
    if !result.0.is_empty() {
        return result;
    }
    if killed {
        toast("Killed")
    } else {
        alert("Window already gone")
    }
}

async fn sessions_mode(ctx: &Arc<AppContext>, cb: &CbMeta, window_id: &str) -> Toast {
    let mode = ctx.store.cycle_notification_mode(window_id);
    let result = sessions_refresh(ctx, cb).await;
    if !result.0.is_empty() {
        return result;
    }
    toast(&format!("Notifications: {}", mode.as_str()))
}

// ---------------------------------------------------------------------------
// Status action buttons
// ---------------------------------------------------------------------------

async fn status_esc(ctx: &Arc<AppContext>, window_id: &str) -> Toast {
    match send_to_window_key(ctx, window_id, "Escape").await {
        true => toast("⎋ Esc"),
        false => alert("Window not found"),
    }
}

async fn send_to_window_key(ctx: &AppContext, window_id: &str, key: &str) -> bool {
    match ctx.tmux.find_window_by_id(window_id).await {
        Ok(Some(window)) => ctx.tmux.send_keys(&window.window_id, key, false, false).await,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Resume browser
// ---------------------------------------------------------------------------

async fn resume_pick(ctx: &Arc<AppContext>, cb: &CbMeta, idx: usize) -> Toast {
    let Some(pending) = ctx.resume.get(&cb.user_id).map(|p| p.clone()) else {
        return alert("Resume browser expired");
    };
    if cb.thread_id != Some(pending.thread_id) {
        return alert("Stale (topic mismatch)");
    }
    let Some((session_id, summary)) = pending.sessions.get(idx).cloned() else {
        return alert("Invalid session index");
    };

    let cwd = ctx.store.get_window_state(&pending.window_id).cwd;
    if cwd.is_empty() || !std::path::Path::new(&cwd).is_dir() {
        edit_cb(ctx, cb, "❌ Directory no longer exists.", None).await;
        ctx.resume.remove(&cb.user_id);
        return toast("Failed");
    }

    // Replace the bound window with one resuming the picked session.
    if let Ok(Some(window)) = ctx.tmux.find_window_by_id(&pending.window_id).await {
        ctx.tmux.kill_window(&window.window_id).await;
    }
    ctx.store.unbind_thread(cb.user_id, pending.thread_id);
    ctx.resume.remove(&cb.user_id);

    match create_and_bind(
        ctx,
        cb.user_id,
        pending.thread_id,
        &cwd,
        &format!("--resume {session_id}"),
    )
    .await
    {
        Ok(created) => {
            let label: String = summary.chars().take(40).collect();
            edit_cb(
                ctx,
                cb,
                &format!("✅ {}\n\nResuming session: {label}", created.message),
                None,
            )
            .await;
            toast("Resumed")
        }
        Err(e) => {
            edit_cb(ctx, cb, &format!("❌ {e}"), None).await;
            toast("Failed")
        }
    }
}

async fn resume_page(ctx: &Arc<AppContext>, cb: &CbMeta, page: usize) -> Toast {
    let Some(mut pending) = ctx.resume.get(&cb.user_id).map(|p| p.clone()) else {
        return alert("Resume browser expired");
    };
    if cb.thread_id != Some(pending.thread_id) {
        return alert("Stale (topic mismatch)");
    }
    pending.page = page;
    let (text, keyboard) = build_resume_browser(&pending.sessions, page);
    ctx.resume.insert(cb.user_id, pending);
    edit_cb(ctx, cb, &text, Some(keyboard)).await;
    ok()
}

async fn resume_cancel(ctx: &Arc<AppContext>, cb: &CbMeta) -> Toast {
    ctx.resume.remove(&cb.user_id);
    edit_cb(ctx, cb, "Cancelled", None).await;
    toast("Cancelled")
}
