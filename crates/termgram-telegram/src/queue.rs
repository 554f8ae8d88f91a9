//! Per-user ordered delivery with merging, in-place edits, and rate-limit
//! aware retries.
//!
//! A fixed-size worker pool pulls tasks keyed by user_id; a claim set
//! guarantees at most one in-flight task per user, so per-user FIFO order
//! holds while different users' sends proceed concurrently. Each user's
//! queue is a plain deque behind a mutex so the merge step can inspect and
//! consume the head nondestructively.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use termgram_sessions::SessionStore;
use termgram_terminal::{parse_status_line, PaneAnalyzer};
use termgram_tmux::TmuxManager;
use termgram_transcript::{ContentType, ImageAttachment};

use crate::callback::encode;
use crate::context::Bot;
use crate::sender::{self, is_retry_after};

/// Merged content must stay under this many characters, leaving room for
/// markup expansion within Telegram's 4096 limit.
pub const MERGE_MAX_LENGTH: usize = 3800;

const DEFAULT_POOL_SIZE: usize = 4;

/// Idle re-check period; a safety net against lost notify wakeups.
const WORKER_IDLE_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum MessageTask {
    Content {
        thread_id: Option<i32>,
        window_id: String,
        /// Already-split raw-Markdown parts, each within the merge cap.
        parts: Vec<String>,
        tool_use_id: Option<String>,
        content_type: ContentType,
        image_data: Option<Vec<ImageAttachment>>,
    },
    StatusUpdate {
        thread_id: Option<i32>,
        window_id: String,
        text: Option<String>,
    },
    StatusClear {
        thread_id: Option<i32>,
    },
}

fn thread_key(thread_id: Option<i32>) -> i32 {
    thread_id.unwrap_or(0)
}

type UserQueue = Arc<Mutex<VecDeque<MessageTask>>>;

struct PoolInner {
    bot: Bot,
    store: SessionStore,
    tmux: TmuxManager,
    analyzer: Arc<PaneAnalyzer>,
    queues: DashMap<i64, UserQueue>,
    /// Users with a task currently in flight.
    claimed: Mutex<HashSet<i64>>,
    notify: Notify,
    /// (tool_use_id, user_id) → message to edit when the result arrives.
    tool_msg_ids: DashMap<(String, i64), MessageId>,
    /// (user_id, thread_or_0) → (message_id, window_id, last_text).
    status_info: DashMap<(i64, i32), (MessageId, String, String)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Handle to the delivery pool. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryPool {
    inner: Arc<PoolInner>,
}

impl DeliveryPool {
    pub fn new(
        bot: Bot,
        store: SessionStore,
        tmux: TmuxManager,
        analyzer: Arc<PaneAnalyzer>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                bot,
                store,
                tmux,
                analyzer,
                queues: DashMap::new(),
                claimed: Mutex::new(HashSet::new()),
                notify: Notify::new(),
                tool_msg_ids: DashMap::new(),
                status_info: DashMap::new(),
                workers: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the worker pool. Must run inside the runtime.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        for i in 0..DEFAULT_POOL_SIZE {
            let pool = self.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker = i, "delivery worker started");
                pool.worker_loop().await;
            }));
        }
        info!(size = DEFAULT_POOL_SIZE, "delivery pool started");
    }

    /// Cancel all workers. Queued tasks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        for worker in self.inner.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }

    fn user_queue(&self, user_id: i64) -> UserQueue {
        self.inner
            .queues
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    fn push(&self, user_id: i64, task: MessageTask) {
        self.user_queue(user_id).lock().unwrap().push_back(task);
        self.inner.notify.notify_waiters();
    }

    pub fn enqueue_content(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
        parts: Vec<String>,
        tool_use_id: Option<String>,
        content_type: ContentType,
        image_data: Option<Vec<ImageAttachment>>,
    ) {
        self.push(
            user_id,
            MessageTask::Content {
                thread_id,
                window_id: window_id.to_string(),
                parts,
                tool_use_id,
                content_type,
                image_data,
            },
        );
    }

    pub fn enqueue_status_update(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
        text: Option<String>,
    ) {
        self.push(
            user_id,
            MessageTask::StatusUpdate {
                thread_id,
                window_id: window_id.to_string(),
                text,
            },
        );
    }

    pub fn enqueue_status_clear(&self, user_id: i64, thread_id: Option<i32>) {
        self.push(user_id, MessageTask::StatusClear { thread_id });
    }

    /// Forget tracked status message state without deleting anything.
    pub fn clear_status_info(&self, user_id: i64, thread_id: i32) {
        self.inner.status_info.remove(&(user_id, thread_id));
    }

    pub fn clear_tool_msg_ids_for_user(&self, user_id: i64) {
        self.inner.tool_msg_ids.retain(|(_, uid), _| *uid != user_id);
    }

    /// Whether nothing is queued for this user.
    pub fn is_queue_empty(&self, user_id: i64) -> bool {
        self.inner
            .queues
            .get(&user_id)
            .map(|q| q.lock().unwrap().is_empty())
            .unwrap_or(true)
    }

    /// Wait until the user's queue is drained and no task is in flight.
    /// Used to flush pending content before an interactive prompt goes out.
    pub async fn wait_idle(&self, user_id: i64) {
        loop {
            let empty = self.is_queue_empty(user_id);
            let claimed = self.inner.claimed.lock().unwrap().contains(&user_id);
            if empty && !claimed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Worker pool
    // -----------------------------------------------------------------------

    async fn worker_loop(&self) {
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let job = self.claim_next();
            match job {
                Some((user_id, task)) => {
                    self.run_task(user_id, &task).await;
                    self.inner.claimed.lock().unwrap().remove(&user_id);
                    self.inner.notify.notify_waiters();
                }
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = tokio::time::sleep(WORKER_IDLE_TICK) => {}
                    }
                }
            }
        }
    }

    /// Claim the next available (user, task) pair: the user must have queued
    /// work and no task in flight. The claim and the pop happen under the
    /// claim lock so two workers can never serve the same user.
    fn claim_next(&self) -> Option<(i64, MessageTask)> {
        let mut claimed = self.inner.claimed.lock().unwrap();
        for entry in self.inner.queues.iter() {
            let user_id = *entry.key();
            if claimed.contains(&user_id) {
                continue;
            }
            let mut queue = entry.value().lock().unwrap();
            if let Some(mut task) = queue.pop_front() {
                if let MessageTask::Content { .. } = task {
                    merge_from_queue(&mut task, &mut queue);
                }
                claimed.insert(user_id);
                return Some((user_id, task));
            }
        }
        None
    }

    /// Process one task, sleeping and retrying on rate-limit errors.
    async fn run_task(&self, user_id: i64, task: &MessageTask) {
        loop {
            let result = match task {
                MessageTask::Content { .. } => self.process_content(user_id, task).await,
                MessageTask::StatusUpdate {
                    thread_id,
                    window_id,
                    text,
                } => {
                    self.process_status_update(user_id, *thread_id, window_id, text.as_deref())
                        .await
                }
                MessageTask::StatusClear { thread_id } => {
                    self.clear_status_message(user_id, *thread_id).await;
                    Ok(())
                }
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    if let Some(delay) = is_retry_after(&e) {
                        info!(user_id, ?delay, "rate limited, retrying task");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(user_id, error = %e, "task failed, dropping");
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Content processing
    // -----------------------------------------------------------------------

    async fn process_content(
        &self,
        user_id: i64,
        task: &MessageTask,
    ) -> Result<(), teloxide::RequestError> {
        let MessageTask::Content {
            thread_id,
            window_id,
            parts,
            tool_use_id,
            content_type,
            image_data,
        } = task
        else {
            return Ok(());
        };
        let thread_id = *thread_id;
        let chat_id = self.inner.store.resolve_chat_id(user_id, thread_id);

        // Tool results edit the original tool_use message in place.
        if *content_type == ContentType::ToolResult {
            if let Some(tuid) = tool_use_id {
                let edit_target = self
                    .inner
                    .tool_msg_ids
                    .remove(&(tuid.clone(), user_id))
                    .map(|(_, m)| m);
                if let Some(msg_id) = edit_target {
                    self.clear_status_message(user_id, thread_id).await;
                    let full_text = parts.join("\n\n");
                    if sender::edit_md(&self.inner.bot, chat_id, msg_id, &full_text, None).await? {
                        self.check_and_send_status(user_id, thread_id, window_id)
                            .await?;
                        return Ok(());
                    }
                    debug!(user_id, "tool message edit failed, sending new");
                }
            }
        }

        let mut first_part = true;
        let mut last_msg_id: Option<MessageId> = None;
        for part in parts {
            if first_part {
                first_part = false;
                // Convert an existing status message into this content in
                // place — avoids the delete+send flicker.
                if let Some(converted) = self
                    .convert_status_to_content(user_id, thread_id, window_id, part)
                    .await?
                {
                    last_msg_id = Some(converted);
                    continue;
                }
            }
            if let Some(sent) =
                sender::send_md(&self.inner.bot, chat_id, thread_id, part, None).await?
            {
                last_msg_id = Some(sent.id);
            }
        }

        if let Some(images) = image_data {
            self.send_images(chat_id, thread_id, images).await?;
        }

        // Remember the tool_use message so its result can edit it later.
        if let (Some(msg_id), Some(tuid)) = (last_msg_id, tool_use_id) {
            if *content_type == ContentType::ToolUse {
                self.inner
                    .tool_msg_ids
                    .insert((tuid.clone(), user_id), msg_id);
            }
        }

        self.check_and_send_status(user_id, thread_id, window_id)
            .await?;
        Ok(())
    }

    async fn send_images(
        &self,
        chat_id: i64,
        thread_id: Option<i32>,
        images: &[ImageAttachment],
    ) -> Result<(), teloxide::RequestError> {
        for image in images {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&image.data_base64)
            else {
                debug!("undecodable image attachment skipped");
                continue;
            };
            let mut req = self
                .inner
                .bot
                .send_photo(ChatId(chat_id), InputFile::memory(bytes));
            if let Some(t) = sender::as_thread(thread_id) {
                req = req.message_thread_id(t);
            }
            match req.await {
                Ok(_) => {}
                Err(e) if is_retry_after(&e).is_some() => return Err(e),
                Err(e) => warn!(chat_id, error = %e, "failed to send photo"),
            }
        }
        Ok(())
    }

    /// Edit the tracked status message into content. Returns the message id
    /// when the conversion succeeded.
    async fn convert_status_to_content(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
        content: &str,
    ) -> Result<Option<MessageId>, teloxide::RequestError> {
        let key = (user_id, thread_key(thread_id));
        let Some((_, (msg_id, stored_wid, _))) = self.inner.status_info.remove(&key) else {
            return Ok(None);
        };
        let chat_id = self.inner.store.resolve_chat_id(user_id, thread_id);
        if stored_wid != window_id {
            // Status belongs to another window: just drop it.
            sender::delete_message(&self.inner.bot, chat_id, msg_id).await;
            return Ok(None);
        }
        if sender::edit_md(&self.inner.bot, chat_id, msg_id, content, None).await? {
            Ok(Some(msg_id))
        } else {
            Ok(None)
        }
    }

    // -----------------------------------------------------------------------
    // Status processing
    // -----------------------------------------------------------------------

    async fn process_status_update(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
        text: Option<&str>,
    ) -> Result<(), teloxide::RequestError> {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            self.clear_status_message(user_id, thread_id).await;
            return Ok(());
        };
        let chat_id = self.inner.store.resolve_chat_id(user_id, thread_id);

        // An interruptible status means the agent is actively working.
        if text.to_lowercase().contains("esc to interrupt") {
            let mut req = self
                .inner
                .bot
                .send_chat_action(ChatId(chat_id), teloxide::types::ChatAction::Typing);
            if let Some(t) = sender::as_thread(thread_id) {
                req = req.message_thread_id(t);
            }
            let _ = req.await;
        }

        let key = (user_id, thread_key(thread_id));
        let current = self.inner.status_info.get(&key).map(|v| v.clone());
        match current {
            Some((msg_id, stored_wid, last_text)) => {
                if stored_wid != window_id {
                    self.clear_status_message(user_id, thread_id).await;
                    self.send_status_message(user_id, thread_id, window_id, text)
                        .await?;
                } else if last_text == text {
                    // Identical status: zero platform calls.
                } else if sender::edit_md(
                    &self.inner.bot,
                    chat_id,
                    msg_id,
                    text,
                    Some(status_keyboard(window_id)),
                )
                .await?
                {
                    self.inner.status_info.insert(
                        key,
                        (msg_id, window_id.to_string(), text.to_string()),
                    );
                } else {
                    self.inner.status_info.remove(&key);
                    self.send_status_message(user_id, thread_id, window_id, text)
                        .await?;
                }
            }
            None => {
                self.send_status_message(user_id, thread_id, window_id, text)
                    .await?;
            }
        }
        Ok(())
    }

    async fn send_status_message(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
        text: &str,
    ) -> Result<(), teloxide::RequestError> {
        let chat_id = self.inner.store.resolve_chat_id(user_id, thread_id);
        if let Some(sent) = sender::send_md(
            &self.inner.bot,
            chat_id,
            thread_id,
            text,
            Some(status_keyboard(window_id)),
        )
        .await?
        {
            self.inner.status_info.insert(
                (user_id, thread_key(thread_id)),
                (sent.id, window_id.to_string(), text.to_string()),
            );
        }
        Ok(())
    }

    async fn clear_status_message(&self, user_id: i64, thread_id: Option<i32>) {
        let key = (user_id, thread_key(thread_id));
        if let Some((_, (msg_id, _, _))) = self.inner.status_info.remove(&key) {
            let chat_id = self.inner.store.resolve_chat_id(user_id, thread_id);
            sender::delete_message(&self.inner.bot, chat_id, msg_id).await;
        }
    }

    /// After content lands, re-poll the pane and append a status message so
    /// status always sits below the latest content for its window.
    async fn check_and_send_status(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
        window_id: &str,
    ) -> Result<(), teloxide::RequestError> {
        if !self.is_queue_empty(user_id) {
            return Ok(());
        }
        let Ok(Some(window)) = self.inner.tmux.find_window_by_id(window_id).await else {
            return Ok(());
        };
        let Some(pane_text) = self.inner.tmux.capture_pane(&window.window_id, false).await else {
            return Ok(());
        };
        // Skip while an interactive prompt is showing; the poller owns that.
        if self.inner.analyzer.is_interactive(&pane_text) {
            return Ok(());
        }
        if let Some(status) = parse_status_line(&pane_text) {
            self.send_status_message(user_id, thread_id, window_id, &status)
                .await?;
        }
        Ok(())
    }
}

/// Action buttons attached to status messages.
fn status_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("⎋ Esc", encode(&format!("st:esc:{window_id}"))),
        InlineKeyboardButton::callback("📸", encode(&format!("st:ss:{window_id}"))),
    ]])
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

fn is_mergeable(content_type: ContentType) -> bool {
    !matches!(content_type, ContentType::ToolUse | ContentType::ToolResult)
}

fn task_len(parts: &[String]) -> usize {
    parts.iter().map(|p| p.chars().count()).sum()
}

/// Merge queued content tasks into `task` while the head of the queue is
/// another content task for the same window, neither side is a tool
/// use/result, and the merged size stays within the cap. Consumed tasks are
/// popped; the first non-mergeable task stays queued, preserving order.
fn merge_from_queue(task: &mut MessageTask, queue: &mut VecDeque<MessageTask>) {
    let MessageTask::Content {
        window_id,
        parts,
        content_type,
        ..
    } = task
    else {
        return;
    };
    if !is_mergeable(*content_type) {
        return;
    }

    let mut current_len = task_len(parts);
    loop {
        let can_take = match queue.front() {
            Some(MessageTask::Content {
                window_id: w,
                parts: p,
                content_type: ct,
                ..
            }) => {
                w == window_id
                    && is_mergeable(*ct)
                    && current_len + task_len(p) + 2 <= MERGE_MAX_LENGTH
            }
            _ => false,
        };
        if !can_take {
            return;
        }
        let Some(MessageTask::Content { parts: p, .. }) = queue.pop_front() else {
            return;
        };
        for piece in p {
            // Coalesce into the last part when it fits, otherwise keep the
            // piece separate (it was split for a reason).
            match parts.last_mut() {
                Some(last)
                    if last.chars().count() + piece.chars().count() + 2 <= MERGE_MAX_LENGTH =>
                {
                    last.push_str("\n\n");
                    last.push_str(&piece);
                }
                _ => parts.push(piece),
            }
        }
        current_len = task_len(parts);
    }
}
