//! Topic-name emoji prefixes reflecting session state.
//!
//! Tracks per-topic state to suppress redundant `editForumTopic` calls and
//! disables itself per chat after a permission error.

use dashmap::{DashMap, DashSet};
use teloxide::prelude::*;
use tracing::{debug, info};

use crate::context::{Bot, TopicState};
use crate::sender::as_thread;

pub const EMOJI_ACTIVE: &str = "🟢";
pub const EMOJI_IDLE: &str = "💤";
pub const EMOJI_DEAD: &str = "⚫";

pub struct TopicEmoji {
    /// (chat_id, thread_id) → last state applied.
    states: DashMap<(i64, i32), TopicState>,
    /// Chats where editForumTopic is disabled after a permission error.
    disabled_chats: DashSet<i64>,
}

impl TopicEmoji {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            disabled_chats: DashSet::new(),
        }
    }

    fn emoji(state: TopicState) -> &'static str {
        match state {
            TopicState::Active => EMOJI_ACTIVE,
            TopicState::Idle => EMOJI_IDLE,
            TopicState::Dead => EMOJI_DEAD,
        }
    }

    /// Strip any known emoji prefix from a topic name.
    pub fn strip_prefix(name: &str) -> &str {
        for emoji in [EMOJI_ACTIVE, EMOJI_IDLE, EMOJI_DEAD] {
            if let Some(rest) = name.strip_prefix(emoji) {
                return rest.strip_prefix(' ').unwrap_or(rest);
            }
        }
        name
    }

    /// Update the topic name prefix for `state`. No-op when the cached state
    /// already matches or emoji updates are disabled for this chat.
    pub async fn update(
        &self,
        bot: &Bot,
        chat_id: i64,
        thread_id: i32,
        state: TopicState,
        display_name: &str,
    ) {
        if self.disabled_chats.contains(&chat_id) {
            return;
        }
        let key = (chat_id, thread_id);
        if self.states.get(&key).map(|s| *s) == Some(state) {
            return;
        }

        let clean = Self::strip_prefix(display_name);
        let new_name = format!("{} {}", Self::emoji(state), clean);
        let Some(thread) = as_thread(Some(thread_id)) else {
            return;
        };
        let result = bot
            .edit_forum_topic(ChatId(chat_id), thread)
            .name(new_name.clone())
            .await;
        match result {
            Ok(_) => {
                self.states.insert(key, state);
                debug!(chat_id, thread_id, ?state, name = %new_name, "topic emoji updated");
            }
            Err(e) => {
                let text = e.to_string();
                if text.contains("not enough rights") || text.contains("Not enough rights") {
                    self.disabled_chats.insert(chat_id);
                    info!(chat_id, "topic emoji disabled: insufficient permissions");
                } else if text.contains("TOPIC_NOT_MODIFIED") {
                    self.states.insert(key, state);
                } else {
                    debug!(chat_id, thread_id, error = %text, "topic emoji update failed");
                }
            }
        }
    }

    /// Rename a topic while keeping the current state prefix (window rename).
    pub async fn rename(&self, bot: &Bot, chat_id: i64, thread_id: i32, new_display: &str) {
        if self.disabled_chats.contains(&chat_id) {
            return;
        }
        let state = self.states.get(&(chat_id, thread_id)).map(|s| *s);
        let name = match state {
            Some(s) => format!("{} {}", Self::emoji(s), Self::strip_prefix(new_display)),
            None => Self::strip_prefix(new_display).to_string(),
        };
        let Some(thread) = as_thread(Some(thread_id)) else {
            return;
        };
        if let Err(e) = bot.edit_forum_topic(ChatId(chat_id), thread).name(name).await {
            debug!(chat_id, thread_id, error = %e, "topic rename failed");
        }
    }

    pub fn clear_state(&self, chat_id: i64, thread_id: i32) {
        self.states.remove(&(chat_id, thread_id));
    }

    /// Current cached state for a topic (None before the first update).
    pub fn current_state(&self, chat_id: i64, thread_id: i32) -> Option<TopicState> {
        self.states.get(&(chat_id, thread_id)).map(|s| *s)
    }
}

impl Default for TopicEmoji {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_prefix_removes_known_emojis() {
        assert_eq!(TopicEmoji::strip_prefix("🟢 proj"), "proj");
        assert_eq!(TopicEmoji::strip_prefix("💤 proj"), "proj");
        assert_eq!(TopicEmoji::strip_prefix("⚫ proj"), "proj");
        assert_eq!(TopicEmoji::strip_prefix("proj"), "proj");
    }

    #[test]
    fn strip_prefix_only_once() {
        assert_eq!(TopicEmoji::strip_prefix("🟢 💤 proj"), "💤 proj");
    }
}
