//! Sessions dashboard: one message listing every live window with kill and
//! notification-mode controls.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use termgram_core::types::NotificationMode;
use termgram_tmux::TmuxWindow;

use crate::callback::encode;
use crate::context::AppContext;

fn mode_icon(mode: NotificationMode) -> &'static str {
    match mode {
        NotificationMode::All => "🔔",
        NotificationMode::ErrorsOnly => "⚠️",
        NotificationMode::Muted => "🔕",
    }
}

/// One dashboard row per window plus the action row.
pub fn build_dashboard(
    windows: &[TmuxWindow],
    bound: &[(i64, i32, String)],
    modes: &[(String, NotificationMode)],
) -> (String, InlineKeyboardMarkup) {
    let mut lines = vec!["🖥 *Sessions*".to_string(), String::new()];
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();

    if windows.is_empty() {
        lines.push("No windows running. Create a topic to start one.".to_string());
    }
    for window in windows {
        let is_bound = bound.iter().any(|(_, _, wid)| wid == &window.window_id);
        let marker = if is_bound { "🔗" } else { "🞅" };
        let mode = modes
            .iter()
            .find(|(wid, _)| wid == &window.window_id)
            .map(|(_, m)| *m)
            .unwrap_or_default();
        lines.push(format!(
            "{marker} `{}` — {} ({})",
            window.window_name, window.cwd, window.pane_current_command
        ));
        rows.push(vec![
            InlineKeyboardButton::callback(
                format!("{} {}", mode_icon(mode), window.window_name),
                encode(&format!("sess:mode:{}", window.window_id)),
            ),
            InlineKeyboardButton::callback(
                "🗑",
                encode(&format!("sess:kill:{}", window.window_id)),
            ),
        ]);
    }

    rows.push(vec![
        InlineKeyboardButton::callback("🔄 Refresh", encode("sess:ref")),
        InlineKeyboardButton::callback("➕ New", encode("sess:new")),
    ]);

    (lines.join("\n"), InlineKeyboardMarkup::new(rows))
}

/// Confirmation keyboard for a kill request.
pub fn build_kill_confirm(window_id: &str, display: &str) -> (String, InlineKeyboardMarkup) {
    let text = format!("Kill window `{display}`? The running session will be lost.");
    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("💀 Kill it", encode(&format!("sess:killok:{window_id}"))),
        InlineKeyboardButton::callback("✖ Keep", encode("sess:ref")),
    ]]);
    (text, keyboard)
}

/// Snapshot the data the dashboard needs.
pub async fn dashboard_data(
    ctx: &AppContext,
) -> (Vec<TmuxWindow>, Vec<(i64, i32, String)>, Vec<(String, NotificationMode)>) {
    let windows = ctx.tmux.list_windows().await.unwrap_or_default();
    let bound = ctx.store.iter_thread_bindings();
    let modes = windows
        .iter()
        .map(|w| (w.window_id.clone(), ctx.store.get_notification_mode(&w.window_id)))
        .collect();
    (windows, bound, modes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(id: &str, name: &str) -> TmuxWindow {
        TmuxWindow {
            window_id: id.into(),
            window_name: name.into(),
            cwd: "/code".into(),
            pane_current_command: "claude".into(),
        }
    }

    #[test]
    fn dashboard_lists_windows_with_controls() {
        let (text, kb) = build_dashboard(
            &[window("@1", "api"), window("@2", "web")],
            &[(7, 5, "@1".to_string())],
            &[("@1".to_string(), NotificationMode::Muted)],
        );
        assert!(text.contains("`api`"));
        assert!(text.contains("`web`"));
        // two window rows + action row
        assert_eq!(kb.inline_keyboard.len(), 3);
        assert!(kb.inline_keyboard[0][0].text.starts_with("🔕"));
    }

    #[test]
    fn empty_dashboard_has_hint() {
        let (text, kb) = build_dashboard(&[], &[], &[]);
        assert!(text.contains("No windows running"));
        assert_eq!(kb.inline_keyboard.len(), 1);
    }

    #[test]
    fn kill_confirm_mentions_window() {
        let (text, kb) = build_kill_confirm("@4", "api");
        assert!(text.contains("`api`"));
        assert_eq!(kb.inline_keyboard[0].len(), 2);
    }
}
