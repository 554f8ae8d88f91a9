//! Inbound update handling and monitor-event consumption.

use std::sync::Arc;
use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::MessageKind;
use tracing::{debug, info, warn};

use termgram_core::types::NotificationMode;
use termgram_monitor::{MonitorEvent, NewMessage};
use termgram_sessions::resolve_session_for_window;
use termgram_transcript::ContentType;

use crate::binding;
use crate::builder::build_response_parts;
use crate::commands;
use crate::context::AppContext;
use crate::interactive::{handle_interactive_ui, is_interactive_tool};
use crate::sender;

/// Where a message came from.
#[derive(Debug, Clone)]
pub struct MsgMeta {
    pub user_id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i32>,
}

/// Messages in the General topic arrive with thread 1; only named topics
/// can bind, so treat General as topic-less.
pub fn normalize_thread(thread_id: Option<i32>) -> Option<i32> {
    thread_id.filter(|t| *t != 1)
}

/// Main message handler registered in the dispatcher.
pub async fn handle_message(msg: Message, ctx: Arc<AppContext>) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let user_id = from.id.0 as i64;
    let thread_id = normalize_thread(msg.thread_id.map(|t| t.0 .0));
    let chat_id = msg.chat.id.0;

    let is_text_like = msg.text().is_some() || msg.photo().is_some();
    if !ctx.is_user_allowed(user_id) {
        if is_text_like {
            let _ = sender::send_md(
                &ctx.bot,
                chat_id,
                thread_id,
                "You are not authorized to use this bot.",
                None,
            )
            .await;
        }
        return Ok(());
    }

    // Telegram requires the group chat id (not the user id) to address a
    // forum thread; remember it on every group update.
    if msg.chat.is_group() || msg.chat.is_supergroup() {
        ctx.store.set_group_chat_id(user_id, thread_id, chat_id);
    }

    let meta = MsgMeta {
        user_id,
        chat_id,
        thread_id,
    };

    if matches!(msg.kind, MessageKind::ForumTopicClosed(_)) {
        handle_topic_closed(&ctx, &meta).await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            commands::handle_command(&ctx, &meta, text).await;
        } else {
            binding::handle_topic_text(&ctx, user_id, chat_id, thread_id, text).await;
        }
        return Ok(());
    }

    if msg.photo().is_some() {
        handle_photo(&ctx, &meta, &msg).await;
        return Ok(());
    }

    // Service messages pass silently; other media gets a notice.
    if matches!(msg.kind, MessageKind::Common(_)) {
        let _ = sender::send_md(
            &ctx.bot,
            chat_id,
            thread_id,
            "⚠ Only text and photos are supported. Stickers, voice, and other \
             media cannot be forwarded to the agent.",
            None,
        )
        .await;
    }
    Ok(())
}

/// Closing a topic kills its window and clears all associated state.
async fn handle_topic_closed(ctx: &Arc<AppContext>, meta: &MsgMeta) {
    let Some(thread_id) = meta.thread_id else {
        return;
    };
    let Some(window_id) = ctx.store.get_window_for_thread(meta.user_id, thread_id) else {
        debug!(user_id = meta.user_id, thread_id, "topic closed without binding");
        return;
    };
    let display_name = ctx.store.get_display_name(&window_id);
    match ctx.tmux.find_window_by_id(&window_id).await {
        Ok(Some(window)) => {
            ctx.tmux.kill_window(&window.window_id).await;
            info!(window = %display_name, user_id = meta.user_id, thread_id, "topic closed, window killed");
        }
        _ => {
            info!(window = %display_name, "topic closed, window already gone");
        }
    }
    ctx.store.unbind_thread(meta.user_id, thread_id);
    ctx.clear_topic_state(meta.user_id, thread_id).await;
}

/// Photos are downloaded into the images directory and their path forwarded
/// to the agent as part of the message.
async fn handle_photo(ctx: &Arc<AppContext>, meta: &MsgMeta, msg: &Message) {
    let Some(thread_id) = meta.thread_id else {
        let _ = sender::send_md(
            &ctx.bot,
            meta.chat_id,
            None,
            "❌ Please use a named topic. Create a new topic to start a session.",
            None,
        )
        .await;
        return;
    };
    let Some(window_id) = ctx.store.get_window_for_thread(meta.user_id, thread_id) else {
        let _ = sender::send_md(
            &ctx.bot,
            meta.chat_id,
            Some(thread_id),
            "❌ No session bound to this topic. Send a text message first to create one.",
            None,
        )
        .await;
        return;
    };
    let Ok(Some(_)) = ctx.tmux.find_window_by_id(&window_id).await else {
        let display = ctx.store.get_display_name(&window_id);
        ctx.store.unbind_thread(meta.user_id, thread_id);
        let _ = sender::send_md(
            &ctx.bot,
            meta.chat_id,
            Some(thread_id),
            &format!(
                "❌ Window '{display}' no longer exists. Binding removed.\n\
                 Send a message to start a new session."
            ),
            None,
        )
        .await;
        return;
    };

    // Highest-resolution variant is last.
    let Some(photo) = msg.photo().and_then(|p| p.last()) else {
        return;
    };
    let file = match ctx.raw_bot.get_file(photo.file.id.clone()).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "get_file failed");
            return;
        }
    };

    let images_dir = ctx.config.images_dir();
    if let Err(e) = std::fs::create_dir_all(&images_dir) {
        warn!(error = %e, "cannot create images dir");
        return;
    }
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let file_path = images_dir.join(format!("{stamp}_{}.jpg", photo.file.unique_id));

    let mut dst = match tokio::fs::File::create(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "cannot create image file");
            return;
        }
    };
    if let Err(e) = ctx.raw_bot.download_file(&file.path, &mut dst).await {
        warn!(error = %e, "photo download failed");
        return;
    }

    let caption = msg.caption().unwrap_or("");
    let text_to_send = if caption.is_empty() {
        format!("(image attached: {})", file_path.display())
    } else {
        format!("{caption}\n\n(image attached: {})", file_path.display())
    };

    ctx.queue.clear_status_info(meta.user_id, thread_id);
    match binding::send_to_window(ctx, &window_id, &text_to_send).await {
        Ok(_) => {
            let _ = sender::send_md(
                &ctx.bot,
                meta.chat_id,
                Some(thread_id),
                "📷 Image sent to the agent.",
                None,
            )
            .await;
        }
        Err(e) => {
            let _ = sender::send_md(
                &ctx.bot,
                meta.chat_id,
                Some(thread_id),
                &format!("❌ {e}"),
                None,
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor events
// ---------------------------------------------------------------------------

/// Drain monitor events for the lifetime of the process.
pub async fn run_monitor_events(
    ctx: Arc<AppContext>,
    mut rx: tokio::sync::mpsc::Receiver<MonitorEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            MonitorEvent::Message(msg) => handle_new_message(&ctx, &msg).await,
            MonitorEvent::NewWindow(event) => binding::handle_new_window(&ctx, &event).await,
        }
    }
    warn!("monitor event channel closed");
}

fn suppressed_by_mode(mode: NotificationMode, msg: &NewMessage) -> bool {
    match mode {
        NotificationMode::All => false,
        NotificationMode::Muted => true,
        NotificationMode::ErrorsOnly => {
            !(msg.text.contains("⎿  Error") || msg.text.contains("⏹ Interrupted"))
        }
    }
}

/// Route one parsed transcript message to every user bound to its session.
pub async fn handle_new_message(ctx: &Arc<AppContext>, msg: &NewMessage) {
    debug!(
        session_id = %msg.session_id,
        content_type = ?msg.content_type,
        len = msg.text.len(),
        "new message"
    );
    let active_users = ctx.store.find_users_for_session(&msg.session_id);
    if active_users.is_empty() {
        debug!(session_id = %msg.session_id, "no active users for session");
        return;
    }

    for (user_id, window_id, thread_id) in active_users {
        let mode = ctx.store.get_notification_mode(&window_id);
        if suppressed_by_mode(mode, msg) {
            continue;
        }

        // Interactive tools route through the prompt mirror instead of a
        // plain message.
        if msg.content_type == ContentType::ToolUse && is_interactive_tool(msg.tool_name.as_deref())
        {
            // Mark interactive BEFORE waiting so the poller skips this
            // window, then flush pending content (e.g. the plan text).
            ctx.interactive
                .set_mode(user_id, &window_id, Some(thread_id));
            ctx.queue.wait_idle(user_id).await;
            // Give the CLI a moment to render the prompt.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let handled = handle_interactive_ui(
                &ctx.bot,
                &ctx.store,
                &ctx.tmux,
                &ctx.analyzer,
                &ctx.interactive,
                user_id,
                &window_id,
                Some(thread_id),
            )
            .await;
            if handled {
                advance_read_offset(ctx, user_id, &window_id).await;
                continue;
            }
            ctx.interactive.clear_mode(user_id, Some(thread_id));
        }

        // Any non-interactive message means the interaction finished.
        if ctx.interactive.msg_id(user_id, Some(thread_id)).is_some() {
            ctx.interactive
                .clear_msg(&ctx.bot, &ctx.store, user_id, Some(thread_id))
                .await;
        }

        let parts = build_response_parts(&msg.text, msg.content_type, msg.role);
        ctx.queue.enqueue_content(
            user_id,
            Some(thread_id),
            &window_id,
            parts,
            msg.tool_use_id.clone(),
            msg.content_type,
            msg.image_data.clone(),
        );

        advance_read_offset(ctx, user_id, &window_id).await;
    }
}

/// Mark everything up to the current transcript size as delivered.
async fn advance_read_offset(ctx: &Arc<AppContext>, user_id: i64, window_id: &str) {
    if let Some(session) = resolve_session_for_window(&ctx.store, window_id).await {
        if let Ok(meta) = std::fs::metadata(&session.file_path) {
            ctx.store
                .update_user_window_offset(user_id, window_id, meta.len());
        }
    }
}
