//! Terminal status polling for all thread-bound windows.
//!
//! Every second, each binding gets: interactive-UI precedence handling,
//! status-line extraction into the queue, death detection with a one-shot
//! recovery notification, rename detection, and topic-emoji updates. The
//! loop also hosts the 60 s topic-liveness probe and the 10 s auto-close
//! sweep. Nothing here may escape as an error.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use termgram_core::types::NotificationMode;
use termgram_terminal::parse_status_line;

use crate::context::{AppContext, TopicState};
use crate::interactive::handle_interactive_ui;
use crate::recovery::build_recovery_keyboard;
use crate::sender::{self, as_thread};

pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const TOPIC_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const AUTOCLOSE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Max 1 s cycles a `!` bash capture runs before giving up.
pub const BASH_CAPTURE_CYCLES: usize = 30;

/// Background polling task for all thread-bound windows.
pub async fn status_poll_loop(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    info!(interval = ?STATUS_POLL_INTERVAL, "status polling started");
    let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick probes immediately.
    let mut last_topic_check = Instant::now() - TOPIC_CHECK_INTERVAL;
    let mut last_autoclose_sweep = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("status polling stopped");
                    return;
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(last_topic_check) >= TOPIC_CHECK_INTERVAL {
            last_topic_check = now;
            probe_topics(&ctx).await;
        }
        if now.duration_since(last_autoclose_sweep) >= AUTOCLOSE_SWEEP_INTERVAL {
            last_autoclose_sweep = now;
            sweep_autoclose(&ctx).await;
        }

        for (user_id, thread_id, window_id) in ctx.store.iter_thread_bindings() {
            poll_binding(&ctx, user_id, thread_id, &window_id).await;
        }
    }
}

async fn poll_binding(ctx: &Arc<AppContext>, user_id: i64, thread_id: i32, window_id: &str) {
    // Already notified about this death — don't re-check until recovery.
    if ctx
        .dead_notified
        .contains(&(user_id, thread_id, window_id.to_string()))
    {
        return;
    }

    let window = match ctx.tmux.find_window_by_id(window_id).await {
        Ok(w) => w,
        Err(e) => {
            debug!(window_id, error = %e, "tmux lookup failed");
            return;
        }
    };

    let Some(window) = window else {
        notify_dead_window(ctx, user_id, thread_id, window_id).await;
        return;
    };

    // Rename detection: keep the stored display name and the topic title in
    // sync with the live window name.
    let stored = ctx.store.get_display_name(window_id);
    if !window.window_name.is_empty() && window.window_name != stored {
        info!(window_id, old = %stored, new = %window.window_name, "window renamed");
        ctx.store.set_display_name(window_id, &window.window_name);
        let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
        ctx.emoji
            .rename(&ctx.bot, chat_id, thread_id, &window.window_name)
            .await;
    }

    // Don't talk over in-flight content deliveries.
    if !ctx.queue.is_queue_empty(user_id) {
        return;
    }

    update_status(ctx, user_id, thread_id, window_id).await;
}

/// Poll the pane and drive status/interactive/emoji state for one binding.
async fn update_status(ctx: &Arc<AppContext>, user_id: i64, thread_id: i32, window_id: &str) {
    let Some(pane_text) = ctx.tmux.capture_pane(window_id, false).await else {
        // Transient capture failure — keep the current status message.
        return;
    };

    let mut check_new_ui = true;
    match ctx.interactive.window(user_id, Some(thread_id)) {
        Some(active) if active == window_id => {
            if ctx.analyzer.is_interactive(&pane_text) {
                // The user is mid-navigation; leave everything alone.
                return;
            }
            // Prompt is gone: clear the keyboard, and don't instantly
            // re-detect a new one this cycle.
            ctx.interactive
                .clear_msg(&ctx.bot, &ctx.store, user_id, Some(thread_id))
                .await;
            check_new_ui = false;
        }
        Some(_) => {
            // Interactive mode points at a different window: stale.
            ctx.interactive
                .clear_msg(&ctx.bot, &ctx.store, user_id, Some(thread_id))
                .await;
        }
        None => {}
    }

    if check_new_ui && ctx.analyzer.is_interactive(&pane_text) {
        // Permission prompts have no transcript entry; the poller is the
        // only one who can surface them.
        handle_interactive_ui(
            &ctx.bot,
            &ctx.store,
            &ctx.tmux,
            &ctx.analyzer,
            &ctx.interactive,
            user_id,
            window_id,
            Some(thread_id),
        )
        .await;
        return;
    }

    let muted = ctx.store.get_notification_mode(window_id) == NotificationMode::Muted;
    let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
    let display = ctx.store.get_display_name(window_id);

    match parse_status_line(&pane_text) {
        Some(status) => {
            if !muted {
                ctx.queue
                    .enqueue_status_update(user_id, Some(thread_id), window_id, Some(status));
            }
            ctx.emoji
                .update(&ctx.bot, chat_id, thread_id, TopicState::Active, &display)
                .await;
            set_autoclose_state(ctx, user_id, thread_id, TopicState::Active);
        }
        None => {
            if !muted {
                ctx.queue
                    .enqueue_status_update(user_id, Some(thread_id), window_id, None);
            }
            ctx.emoji
                .update(&ctx.bot, chat_id, thread_id, TopicState::Idle, &display)
                .await;
            set_autoclose_state(ctx, user_id, thread_id, TopicState::Idle);
        }
    }
}

/// One-shot dead-window notification with recovery options.
async fn notify_dead_window(ctx: &Arc<AppContext>, user_id: i64, thread_id: i32, window_id: &str) {
    let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
    let display = ctx.store.get_display_name(window_id);
    ctx.emoji
        .update(&ctx.bot, chat_id, thread_id, TopicState::Dead, &display)
        .await;

    let ws = ctx.store.get_window_state(window_id);
    let dir_exists = !ws.cwd.is_empty() && std::path::Path::new(&ws.cwd).is_dir();
    let (text, keyboard) = if dir_exists {
        (
            format!(
                "⚠ Session `{display}` ended.\n📂 `{}`\n\nTap a button or send a message to recover.",
                ws.cwd
            ),
            Some(build_recovery_keyboard(window_id)),
        )
    } else {
        (format!("⚠ Session `{display}` ended."), None)
    };

    match sender::send_md(&ctx.bot, chat_id, Some(thread_id), &text, keyboard).await {
        Ok(Some(_)) => {
            ctx.dead_notified
                .insert((user_id, thread_id, window_id.to_string()));
            set_autoclose_state(ctx, user_id, thread_id, TopicState::Dead);
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "dead notification rate-limited"),
    }
}

/// Topic-liveness probe: `unpinAllForumTopicMessages` is a no-op for live
/// topics and fails with `TOPIC_ID_INVALID` once the topic is deleted.
async fn probe_topics(ctx: &Arc<AppContext>) {
    for (user_id, thread_id, window_id) in ctx.store.iter_thread_bindings() {
        let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
        let Some(thread) = as_thread(Some(thread_id)) else {
            continue;
        };
        match ctx
            .bot
            .unpin_all_forum_topic_messages(ChatId(chat_id), thread)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("topic_id_invalid") {
                    info!(user_id, thread_id, window_id = %window_id, "topic deleted, cleaning up");
                    if let Ok(Some(w)) = ctx.tmux.find_window_by_id(&window_id).await {
                        ctx.tmux.kill_window(&w.window_id).await;
                    }
                    ctx.store.unbind_thread(user_id, thread_id);
                    ctx.clear_topic_state(user_id, thread_id).await;
                } else {
                    debug!(window_id = %window_id, error = %e, "topic probe error");
                }
            }
        }
    }
}

/// Arm, re-arm, or clear the auto-close timer for a topic based on the
/// observed state. Timers restart on every state change, so a topic that
/// goes back to work cancels its pending close.
fn set_autoclose_state(ctx: &AppContext, user_id: i64, thread_id: i32, state: TopicState) {
    let minutes = match state {
        TopicState::Active => 0,
        TopicState::Idle => ctx.config.autoclose.idle_minutes,
        TopicState::Dead => ctx.config.autoclose.dead_minutes,
    };
    let key = (user_id, thread_id);
    if minutes == 0 {
        // Active, or the timer is disabled for this state.
        ctx.autoclose.remove(&key);
        return;
    }

    let deadline = Instant::now() + Duration::from_secs(minutes * 60);
    match ctx.autoclose.get(&key).map(|e| e.0) {
        Some(existing) if existing == state => {} // already armed for this state
        _ => {
            ctx.autoclose.insert(key, (state, deadline));
        }
    }
}

/// Close topics whose auto-close deadline has passed.
async fn sweep_autoclose(ctx: &Arc<AppContext>) {
    let now = Instant::now();
    let due: Vec<(i64, i32)> = ctx
        .autoclose
        .iter()
        .filter(|entry| entry.value().1 <= now)
        .map(|entry| *entry.key())
        .collect();
    for (user_id, thread_id) in due {
        ctx.autoclose.remove(&(user_id, thread_id));
        let chat_id = ctx.store.resolve_chat_id(user_id, Some(thread_id));
        let Some(thread) = as_thread(Some(thread_id)) else {
            continue;
        };
        info!(user_id, thread_id, "auto-closing topic");
        if let Err(e) = ctx.bot.close_forum_topic(ChatId(chat_id), thread).await {
            warn!(thread_id, error = %e, "failed to auto-close topic");
        }
    }
}
