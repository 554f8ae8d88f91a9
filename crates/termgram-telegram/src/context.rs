//! Shared application context threaded through every handler.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use teloxide::adaptors::Throttle;
use tokio::task::JoinHandle;

use termgram_core::TermgramConfig;
use termgram_sessions::SessionStore;
use termgram_terminal::PaneAnalyzer;
use termgram_tmux::TmuxManager;

use crate::emoji::TopicEmoji;
use crate::interactive::InteractiveState;
use crate::queue::DeliveryPool;

/// The bot handle used everywhere: rate limiting is the adaptor's job.
pub type Bot = Throttle<teloxide::Bot>;

/// UI-guard stage for an unbound topic mid-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiStage {
    SelectingWindow,
    BrowsingDirectory,
}

/// Per-user picker/browser state, keyed by the topic that opened it.
#[derive(Debug, Clone)]
pub struct PendingUi {
    pub stage: UiStage,
    pub thread_id: i32,
    /// The message that triggered the flow, forwarded after binding.
    pub pending_text: Option<String>,
    pub browse_path: String,
    pub browse_page: usize,
    /// Subdirectory names backing the numbered browser buttons.
    pub browse_dirs: Vec<String>,
    /// Window ids backing the numbered picker buttons.
    pub unbound_windows: Vec<String>,
}

/// Per-user dead-window recovery state.
#[derive(Debug, Clone)]
pub struct PendingRecovery {
    pub thread_id: i32,
    pub window_id: String,
    pub pending_text: Option<String>,
    /// (session_id, summary) rows backing the resume picker buttons.
    pub sessions: Vec<(String, String)>,
}

/// Per-user `/resume` browser state.
#[derive(Debug, Clone)]
pub struct PendingResume {
    pub thread_id: i32,
    pub window_id: String,
    pub sessions: Vec<(String, String)>,
    pub page: usize,
}

/// Auto-close timers are state-change timers: re-armed on every observed
/// state transition, cleared when the topic becomes active again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Active,
    Idle,
    Dead,
}

pub struct AppContext {
    pub config: TermgramConfig,
    pub bot: Bot,
    /// Un-throttled bot used only for file downloads.
    pub raw_bot: teloxide::Bot,
    pub store: SessionStore,
    pub tmux: TmuxManager,
    pub analyzer: Arc<PaneAnalyzer>,
    pub queue: DeliveryPool,
    pub interactive: InteractiveState,
    pub emoji: TopicEmoji,

    /// Picker/browser flow state per user.
    pub ui: DashMap<i64, PendingUi>,
    /// Dead-window recovery state per user.
    pub recovery: DashMap<i64, PendingRecovery>,
    /// `/resume` browser state per user.
    pub resume: DashMap<i64, PendingResume>,

    /// (user, thread, window) tuples already notified about a death.
    pub dead_notified: DashSet<(i64, i32, String)>,
    /// Running `!` bash-capture tasks per topic.
    pub bash_tasks: DashMap<(i64, i32), JoinHandle<()>>,
    /// Auto-close deadlines per topic.
    pub autoclose: DashMap<(i64, i32), (TopicState, tokio::time::Instant)>,
    /// Per-window backoff deadlines after topic-creation rate limits.
    pub topic_create_retry: DashMap<String, tokio::time::Instant>,
}

impl AppContext {
    pub fn new(
        config: TermgramConfig,
        bot: Bot,
        raw_bot: teloxide::Bot,
        store: SessionStore,
        tmux: TmuxManager,
    ) -> Arc<Self> {
        let analyzer = Arc::new(PaneAnalyzer::new());
        let queue = DeliveryPool::new(
            bot.clone(),
            store.clone(),
            tmux.clone(),
            Arc::clone(&analyzer),
        );
        Arc::new(Self {
            config,
            bot,
            raw_bot,
            store,
            tmux,
            analyzer,
            queue,
            interactive: InteractiveState::new(),
            emoji: TopicEmoji::new(),
            ui: DashMap::new(),
            recovery: DashMap::new(),
            resume: DashMap::new(),
            dead_notified: DashSet::new(),
            bash_tasks: DashMap::new(),
            autoclose: DashMap::new(),
            topic_create_retry: DashMap::new(),
        })
    }

    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.config.is_user_allowed(user_id)
    }

    /// Cancel any running bash capture for a topic (a newer user message
    /// pushes the pane content down, invalidating the capture).
    pub fn cancel_bash_capture(&self, user_id: i64, thread_id: i32) {
        if let Some((_, task)) = self.bash_tasks.remove(&(user_id, thread_id)) {
            task.abort();
        }
    }

    /// Drop every piece of in-memory state tied to a topic.
    pub async fn clear_topic_state(&self, user_id: i64, thread_id: i32) {
        self.queue.clear_status_info(user_id, thread_id);
        self.queue.clear_tool_msg_ids_for_user(user_id);
        self.dead_notified
            .retain(|(u, t, _)| !(*u == user_id && *t == thread_id));
        self.autoclose.remove(&(user_id, thread_id));
        self.cancel_bash_capture(user_id, thread_id);
        self.interactive
            .clear_msg(&self.bot, &self.store, user_id, Some(thread_id))
            .await;
        let chat_id = self.store.resolve_chat_id(user_id, Some(thread_id));
        self.emoji.clear_state(chat_id, thread_id);
        if let Some(ui) = self.ui.get(&user_id) {
            let matches = ui.thread_id == thread_id;
            drop(ui);
            if matches {
                self.ui.remove(&user_id);
            }
        }
        if let Some(rec) = self.recovery.get(&user_id) {
            let matches = rec.thread_id == thread_id;
            drop(rec);
            if matches {
                self.recovery.remove(&user_id);
            }
        }
    }
}
