//! Topic→window binding orchestration for inbound user messages.
//!
//! The resolution flow for a text in a topic:
//! UI guard (picker/browser open) → unbound (picker or browser) →
//! dead window (recovery or re-browse) → live window (forward keystrokes).

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{debug, info, warn};

use termgram_monitor::NewWindowEvent;
use termgram_tmux::CreatedWindow;

use crate::browser::{build_directory_browser, build_window_picker};
use crate::context::{AppContext, PendingRecovery, PendingUi, TopicState, UiStage};
use crate::interactive::handle_interactive_ui;
use crate::recovery::build_recovery_keyboard;
use crate::sender;
use crate::status::BASH_CAPTURE_CYCLES;

/// Send literal text to a window's pane. Returns a user-facing confirmation
/// or error message.
pub async fn send_to_window(
    ctx: &AppContext,
    window_id: &str,
    text: &str,
) -> Result<String, String> {
    let display_name = ctx.store.get_display_name(window_id);
    debug!(window_id, display = %display_name, len = text.len(), "send_to_window");
    let window = match ctx.tmux.find_window_by_id(window_id).await {
        Ok(Some(w)) => w,
        _ => return Err("Window not found (may have been closed)".to_string()),
    };
    if ctx.tmux.send_keys(&window.window_id, text, true, true).await {
        Ok(format!("Sent to {display_name}"))
    } else {
        Err("Failed to send keys".to_string())
    }
}

/// Handle a plain text message in a topic. `chat_id` is the chat the
/// message arrived in; replies go back there.
pub async fn handle_topic_text(
    ctx: &Arc<AppContext>,
    user_id: i64,
    chat_id: i64,
    thread_id: Option<i32>,
    text: &str,
) {
    // UI guard: a picker/browser opened from THIS topic owns the input.
    if let Some(pending) = ctx.ui.get(&user_id).map(|p| p.clone()) {
        if Some(pending.thread_id) == thread_id {
            let hint = match pending.stage {
                UiStage::SelectingWindow => "Please use the window picker above, or tap Cancel.",
                UiStage::BrowsingDirectory => {
                    "Please use the directory browser above, or tap Cancel."
                }
            };
            let _ = sender::send_md(&ctx.bot, chat_id, thread_id, hint, None).await;
            return;
        }
        // Stale state from another topic: clear and continue.
        ctx.ui.remove(&user_id);
    }

    let Some(thread_id) = thread_id else {
        let _ = sender::send_md(
            &ctx.bot,
            chat_id,
            None,
            "❌ Please use a named topic. Create a new topic to start a session.",
            None,
        )
        .await;
        return;
    };

    let Some(window_id) = ctx.store.get_window_for_thread(user_id, thread_id) else {
        show_binding_ui(ctx, user_id, chat_id, thread_id, text).await;
        return;
    };

    // Bound topic — is the window still alive?
    let window = match ctx.tmux.find_window_by_id(&window_id).await {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "tmux unavailable");
            None
        }
    };
    let Some(window) = window else {
        handle_dead_window(ctx, user_id, chat_id, thread_id, &window_id, text).await;
        return;
    };

    let mut typing = ctx
        .bot
        .send_chat_action(ChatId(chat_id), teloxide::types::ChatAction::Typing);
    if let Some(t) = sender::as_thread(Some(thread_id)) {
        typing = typing.message_thread_id(t);
    }
    let _ = typing.await;
    ctx.queue
        .enqueue_status_update(user_id, Some(thread_id), &window_id, None);

    // A new message pushes pane content down: stop any running capture.
    ctx.cancel_bash_capture(user_id, thread_id);

    if !ctx.tmux.send_keys(&window.window_id, text, true, true).await {
        let _ = sender::send_md(&ctx.bot, chat_id, Some(thread_id), "❌ Failed to send keys", None)
            .await;
        return;
    }

    if let Some(command) = text.strip_prefix('!').filter(|c| !c.is_empty()) {
        spawn_bash_capture(ctx, user_id, thread_id, &window_id, command);
    }

    // Mid-navigation text (e.g. typing into a filter) refreshes the prompt.
    if ctx.interactive.window(user_id, Some(thread_id)).as_deref() == Some(window_id.as_str()) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle_interactive_ui(
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
    }
}

/// Unbound topic: offer existing unbound windows, else the directory
/// browser. The triggering text is stashed and forwarded after binding.
async fn show_binding_ui(
    ctx: &Arc<AppContext>,
    user_id: i64,
    chat_id: i64,
    thread_id: i32,
    text: &str,
) {
    let all_windows = ctx.tmux.list_windows().await.unwrap_or_default();
    let bound: std::collections::HashSet<String> = ctx
        .store
        .iter_thread_bindings()
        .into_iter()
        .map(|(_, _, wid)| wid)
        .collect();
    let unbound: Vec<_> = all_windows
        .into_iter()
        .filter(|w| !bound.contains(&w.window_id))
        .collect();

    if !unbound.is_empty() {
        info!(user_id, thread_id, count = unbound.len(), "showing window picker");
        let (msg_text, keyboard, ids) = build_window_picker(&unbound);
        ctx.ui.insert(
            user_id,
            PendingUi {
                stage: UiStage::SelectingWindow,
                thread_id,
                pending_text: Some(text.to_string()),
                browse_path: String::new(),
                browse_page: 0,
                browse_dirs: Vec::new(),
                unbound_windows: ids,
            },
        );
        let _ = sender::send_md(&ctx.bot, chat_id, Some(thread_id), &msg_text, Some(keyboard))
            .await;
        return;
    }

    info!(user_id, thread_id, "showing directory browser");
    let start_path = std::env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "/".to_string());
    let starred = ctx.store.get_user_starred(user_id);
    let mru = ctx.store.get_user_mru(user_id);
    let (msg_text, keyboard, entries) = build_directory_browser(&start_path, 0, &starred, &mru);
    ctx.ui.insert(
        user_id,
        PendingUi {
            stage: UiStage::BrowsingDirectory,
            thread_id,
            pending_text: Some(text.to_string()),
            browse_path: start_path,
            browse_page: 0,
            browse_dirs: entries,
            unbound_windows: Vec::new(),
        },
    );
    let _ = sender::send_md(&ctx.bot, chat_id, Some(thread_id), &msg_text, Some(keyboard)).await;
}

/// Bound window vanished. With a valid cwd the user gets recovery options;
/// without one the binding is dropped and the browser reopens.
async fn handle_dead_window(
    ctx: &Arc<AppContext>,
    user_id: i64,
    chat_id: i64,
    thread_id: i32,
    window_id: &str,
    text: &str,
) {
    let display = ctx.store.get_display_name(window_id);
    let ws = ctx.store.get_window_state(window_id);
    let cwd_valid = !ws.cwd.is_empty() && std::path::Path::new(&ws.cwd).is_dir();

    if cwd_valid {
        info!(user_id, thread_id, window_id, "dead window, offering recovery");
        ctx.emoji
            .update(&ctx.bot, chat_id, thread_id, TopicState::Dead, &display)
            .await;
        ctx.recovery.insert(
            user_id,
            PendingRecovery {
                thread_id,
                window_id: window_id.to_string(),
                pending_text: Some(text.to_string()),
                sessions: Vec::new(),
            },
        );
        let msg = format!(
            "⚠ Session `{display}` ended.\n📂 `{}`\n\nTap a button to recover.",
            ws.cwd
        );
        let _ = sender::send_md(
            &ctx.bot,
            chat_id,
            Some(thread_id),
            &msg,
            Some(build_recovery_keyboard(window_id)),
        )
        .await;
        return;
    }

    info!(user_id, thread_id, window_id, "dead window without cwd, re-browsing");
    ctx.store.unbind_thread(user_id, thread_id);
    ctx.clear_topic_state(user_id, thread_id).await;
    show_binding_ui(ctx, user_id, chat_id, thread_id, text).await;
}

/// Create a window in `cwd`, wait for its session-map entry, bind it to the
/// topic, and rename the topic after the window.
pub async fn create_and_bind(
    ctx: &Arc<AppContext>,
    user_id: i64,
    thread_id: i32,
    cwd: &str,
    extra_args: &str,
) -> Result<CreatedWindow, String> {
    let created = ctx
        .tmux
        .create_window(cwd, None, true, extra_args)
        .await
        .map_err(|e| e.to_string())?;

    ctx.store
        .wait_for_session_map_entry(
            &created.window_id,
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
        .await;

    ctx.store
        .bind_thread(user_id, thread_id, &created.window_id, &created.window_name);
    ctx.store.update_user_mru(user_id, cwd);

    let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
    ctx.emoji
        .rename(&ctx.bot, chat_id, thread_id, &created.window_name)
        .await;

    Ok(created)
}

/// Forward stashed text to a freshly bound window, reporting failures into
/// the topic.
pub async fn forward_pending_text(
    ctx: &Arc<AppContext>,
    user_id: i64,
    thread_id: i32,
    window_id: &str,
    pending_text: Option<String>,
) {
    let Some(text) = pending_text.filter(|t| !t.is_empty()) else {
        return;
    };
    debug!(window_id, len = text.len(), "forwarding pending text");
    if let Err(e) = send_to_window(ctx, window_id, &text).await {
        warn!(error = %e, "failed to forward pending text");
        let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
        let _ = sender::send_md(
            &ctx.bot,
            chat_id,
            Some(thread_id),
            &format!("❌ Failed to send pending message: {e}"),
            None,
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Bash capture
// ---------------------------------------------------------------------------

/// Background capture of `!` command output: sends the first capture as a
/// message, then edits it in place as more output appears. Stops after
/// `BASH_CAPTURE_CYCLES` seconds or when cancelled by a newer message.
pub fn spawn_bash_capture(
    ctx: &Arc<AppContext>,
    user_id: i64,
    thread_id: i32,
    window_id: &str,
    command: &str,
) {
    ctx.cancel_bash_capture(user_id, thread_id);
    let ctx2 = Arc::clone(ctx);
    let window_id = window_id.to_string();
    let command = command.to_string();
    let task = tokio::spawn(async move {
        capture_bash_output(&ctx2, user_id, thread_id, &window_id, &command).await;
        ctx2.bash_tasks.remove(&(user_id, thread_id));
    });
    ctx.bash_tasks.insert((user_id, thread_id), task);
}

async fn capture_bash_output(
    ctx: &AppContext,
    user_id: i64,
    thread_id: i32,
    window_id: &str,
    command: &str,
) {
    // Let the command start producing output first.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
    let mut msg_id: Option<teloxide::types::MessageId> = None;
    let mut last_output = String::new();

    for _ in 0..BASH_CAPTURE_CYCLES {
        let Some(raw) = ctx.tmux.capture_pane(window_id, false).await else {
            return;
        };
        let output = termgram_terminal::extract_bash_output(&raw, command);
        let Some(mut output) = output.filter(|o| !o.is_empty()) else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };
        if output == last_output {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        last_output = output.clone();

        // Keep the tail within the message limit.
        let count = output.chars().count();
        if count > 3800 {
            let tail: String = output.chars().skip(count - 3800).collect();
            output = format!("… {tail}");
        }

        match msg_id {
            None => {
                if let Ok(Some(sent)) =
                    sender::send_plain(&ctx.bot, chat_id, Some(thread_id), &output, None).await
                {
                    msg_id = Some(sent.id);
                }
            }
            Some(id) => {
                let _ = sender::edit_plain(&ctx.bot, chat_id, id, &output, None).await;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

// ---------------------------------------------------------------------------
// Auto-topic creation for new windows
// ---------------------------------------------------------------------------

/// Handle a window newly observed by the monitor: create a topic for it and
/// bind it. Target chat/user come from the first existing binding, falling
/// back to the configured group and the first allowed user.
pub async fn handle_new_window(ctx: &Arc<AppContext>, event: &NewWindowEvent) {
    // Already bound somewhere — nothing to do.
    if ctx
        .store
        .iter_thread_bindings()
        .iter()
        .any(|(_, _, wid)| wid == &event.window_id)
    {
        return;
    }

    // Per-window backoff after a topic-creation rate limit.
    if let Some(deadline) = ctx.topic_create_retry.get(&event.window_id).map(|d| *d) {
        if tokio::time::Instant::now() < deadline {
            return;
        }
        ctx.topic_create_retry.remove(&event.window_id);
    }

    let bindings = ctx.store.iter_thread_bindings();
    let (target_chat, target_user) = match bindings.first() {
        Some((uid, tid, _)) => (ctx.store.resolve_chat_id(*uid, Some(*tid)), *uid),
        None => {
            let Some(group_id) = ctx.config.telegram.group_id else {
                debug!(window_id = %event.window_id, "no group configured, skipping auto-topic");
                return;
            };
            let Some(user) = ctx.config.telegram.allowed_users.first().copied() else {
                return;
            };
            (group_id, user)
        }
    };

    let topic_name = if event.window_name.is_empty() {
        std::path::Path::new(&event.cwd)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("session")
            .to_string()
    } else {
        event.window_name.clone()
    };

    match ctx
        .bot
        .create_forum_topic(ChatId(target_chat), topic_name.clone(), 7322096, String::new())
        .await
    {
        Ok(topic) => {
            let thread_id = topic.thread_id.0 .0;
            info!(
                window_id = %event.window_id,
                thread_id,
                chat_id = target_chat,
                "auto-created topic for new window"
            );
            ctx.store
                .bind_thread(target_user, thread_id, &event.window_id, &topic_name);
            ctx.store
                .set_group_chat_id(target_user, Some(thread_id), target_chat);
        }
        Err(e) => {
            if let Some(delay) = sender::is_retry_after(&e) {
                info!(window_id = %event.window_id, ?delay, "topic creation rate-limited");
                ctx.topic_create_retry
                    .insert(event.window_id.clone(), tokio::time::Instant::now() + delay);
            } else {
                warn!(window_id = %event.window_id, error = %e, "failed to create topic");
            }
        }
    }
}
