//! Interactive terminal prompts mirrored as inline keyboards.
//!
//! When the CLI renders a prompt (question panel, plan confirmation,
//! permission request, checkpoint restore), the captured region is sent to
//! the topic with arrow/enter/esc buttons and edited in place as the user
//! navigates.
//!
//! State is keyed by (user_id, thread_id_or_0). Telegram's General topic is
//! thread 1 and real topics are larger, so 0 never collides with a topic.

use dashmap::DashMap;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId};
use tracing::{debug, info, warn};

use termgram_sessions::SessionStore;
use termgram_terminal::PaneAnalyzer;
use termgram_tmux::TmuxManager;

use crate::callback::encode;
use crate::context::Bot;
use crate::sender;

/// Tool names that trigger an interactive UI via the transcript.
pub const INTERACTIVE_TOOL_NAMES: [&str; 2] = ["AskUserQuestion", "ExitPlanMode"];

pub fn is_interactive_tool(name: Option<&str>) -> bool {
    name.is_some_and(|n| INTERACTIVE_TOOL_NAMES.contains(&n))
}

fn key(user_id: i64, thread_id: Option<i32>) -> (i64, i32) {
    (user_id, thread_id.unwrap_or(0))
}

/// Tracks the keyboard message and the window being navigated, per topic.
pub struct InteractiveState {
    msgs: DashMap<(i64, i32), MessageId>,
    mode: DashMap<(i64, i32), String>,
}

impl InteractiveState {
    pub fn new() -> Self {
        Self {
            msgs: DashMap::new(),
            mode: DashMap::new(),
        }
    }

    /// The window the user is currently navigating, if any.
    pub fn window(&self, user_id: i64, thread_id: Option<i32>) -> Option<String> {
        self.mode.get(&key(user_id, thread_id)).map(|w| w.clone())
    }

    pub fn set_mode(&self, user_id: i64, window_id: &str, thread_id: Option<i32>) {
        debug!(user_id, window_id, ?thread_id, "set interactive mode");
        self.mode
            .insert(key(user_id, thread_id), window_id.to_string());
    }

    /// Leave interactive mode without deleting the keyboard message.
    pub fn clear_mode(&self, user_id: i64, thread_id: Option<i32>) {
        self.mode.remove(&key(user_id, thread_id));
    }

    pub fn msg_id(&self, user_id: i64, thread_id: Option<i32>) -> Option<MessageId> {
        self.msgs.get(&key(user_id, thread_id)).map(|m| *m)
    }

    /// Delete the keyboard message and leave interactive mode.
    pub async fn clear_msg(
        &self,
        bot: &Bot,
        store: &SessionStore,
        user_id: i64,
        thread_id: Option<i32>,
    ) {
        let k = key(user_id, thread_id);
        let msg_id = self.msgs.remove(&k).map(|(_, m)| m);
        self.mode.remove(&k);
        if let Some(msg_id) = msg_id {
            let chat_id = store.resolve_chat_id(user_id, thread_id);
            sender::delete_message(bot, chat_id, msg_id).await;
        }
    }
}

impl Default for InteractiveState {
    fn default() -> Self {
        Self::new()
    }
}

/// Navigation keyboard. `RestoreCheckpoint` omits ←/→ — selection there is
/// vertical only.
pub fn build_interactive_keyboard(window_id: &str, ui_name: &str) -> InlineKeyboardMarkup {
    let btn = |label: &str, action: &str| {
        InlineKeyboardButton::callback(label, encode(&format!("aq:{action}:{window_id}")))
    };

    let mut rows = vec![vec![btn("␣ Space", "spc"), btn("↑", "up"), btn("⇥ Tab", "tab")]];
    if ui_name == "RestoreCheckpoint" {
        rows.push(vec![btn("↓", "down")]);
    } else {
        rows.push(vec![btn("←", "left"), btn("↓", "down"), btn("→", "right")]);
    }
    rows.push(vec![btn("⎋ Esc", "esc"), btn("🔄", "ref"), btn("⏎ Enter", "enter")]);
    InlineKeyboardMarkup::new(rows)
}

/// Capture the pane and mirror the interactive region into the topic.
///
/// Edits the existing keyboard message when one is tracked; otherwise sends
/// a new one. Returns whether a UI was detected and delivered.
pub async fn handle_interactive_ui(
    bot: &Bot,
    store: &SessionStore,
    tmux: &TmuxManager,
    analyzer: &PaneAnalyzer,
    state: &InteractiveState,
    user_id: i64,
    window_id: &str,
    thread_id: Option<i32>,
) -> bool {
    let chat_id = store.resolve_chat_id(user_id, thread_id);
    let window = match tmux.find_window_by_id(window_id).await {
        Ok(Some(w)) => w,
        _ => return false,
    };

    let Some(pane_text) = tmux.capture_pane(&window.window_id, false).await else {
        debug!(window_id, "no pane text captured");
        return false;
    };

    let Some(content) = analyzer.extract_interactive(&pane_text) else {
        debug!(window_id, "no interactive UI detected");
        return false;
    };

    let keyboard = build_interactive_keyboard(window_id, &content.name);
    let k = key(user_id, thread_id);

    // Terminal content is not markdown: plain text both ways.
    if let Some(existing) = state.msgs.get(&k).map(|m| *m) {
        match sender::edit_plain(bot, chat_id, existing, &content.content, Some(keyboard)).await {
            Ok(_) => {
                state.mode.insert(k, window_id.to_string());
                return true;
            }
            Err(e) => {
                debug!(error = %e, "interactive edit rate-limited");
                return true;
            }
        }
    }

    info!(user_id, window_id, ui = %content.name, "sending interactive UI");
    match sender::send_plain(bot, chat_id, thread_id, &content.content, Some(keyboard)).await {
        Ok(Some(sent)) => {
            state.msgs.insert(k, sent.id);
            state.mode.insert(k, window_id.to_string());
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "failed to send interactive UI");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_layout_standard() {
        let kb = build_interactive_keyboard("@5", "AskUserQuestion");
        assert_eq!(kb.inline_keyboard.len(), 3);
        assert_eq!(kb.inline_keyboard[1].len(), 3);
    }

    #[test]
    fn keyboard_layout_vertical_only() {
        let kb = build_interactive_keyboard("@5", "RestoreCheckpoint");
        assert_eq!(kb.inline_keyboard[1].len(), 1);
    }

    #[test]
    fn interactive_tool_names() {
        assert!(is_interactive_tool(Some("AskUserQuestion")));
        assert!(is_interactive_tool(Some("ExitPlanMode")));
        assert!(!is_interactive_tool(Some("Read")));
        assert!(!is_interactive_tool(None));
    }

    #[test]
    fn state_mode_round_trip() {
        let state = InteractiveState::new();
        state.set_mode(1, "@2", Some(7));
        assert_eq!(state.window(1, Some(7)).as_deref(), Some("@2"));
        assert_eq!(state.window(1, None), None);
        state.clear_mode(1, Some(7));
        assert_eq!(state.window(1, Some(7)), None);
    }
}
