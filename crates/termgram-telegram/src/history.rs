//! Paginated message history for a window's session.
//!
//! The byte range of the transcript is snapshotted on the first view and
//! carried through the pagination callbacks, so pages stay stable while the
//! session keeps appending.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId};

use termgram_sessions::{get_recent_messages, resolve_session_for_window};
use termgram_transcript::{MessageRecord, Role};

use crate::callback::encode;
use crate::context::AppContext;
use crate::markdown::strip_sentinels;
use crate::sender;

/// Messages per history page.
const PAGE_SIZE: usize = 5;
/// Per-message display cap inside a page.
const MESSAGE_PREVIEW: usize = 500;

fn format_record(record: &MessageRecord) -> String {
    let text = strip_sentinels(&record.text);
    let mut text: String = text.chars().take(MESSAGE_PREVIEW).collect();
    if record.text.chars().count() > MESSAGE_PREVIEW {
        text.push('…');
    }
    match record.role {
        Role::User => format!("👤 {text}"),
        Role::Assistant => text,
    }
}

/// Build one history page. Page 0 is the most recent slice; higher pages go
/// further back. Returns `None` when the range has no messages.
pub fn build_history_page(
    records: &[MessageRecord],
    page: i64,
) -> Option<(String, usize, i64)> {
    if records.is_empty() {
        return None;
    }
    let total_pages = records.len().div_ceil(PAGE_SIZE) as i64;
    let page = page.clamp(0, total_pages - 1);

    // Page 0 = newest: slice from the tail.
    let end = records.len() - (page as usize) * PAGE_SIZE;
    let start = end.saturating_sub(PAGE_SIZE);
    let body = records[start..end]
        .iter()
        .map(format_record)
        .collect::<Vec<_>>()
        .join("\n───\n");

    let header = format!("📜 History (page {}/{})\n\n", page + 1, total_pages);
    Some((format!("{header}{body}"), records.len(), page))
}

fn history_keyboard(
    page: i64,
    total: usize,
    window_id: &str,
    start: u64,
    end: u64,
) -> InlineKeyboardMarkup {
    let total_pages = total.div_ceil(PAGE_SIZE) as i64;
    let mut row = Vec::new();
    if page + 1 < total_pages {
        row.push(InlineKeyboardButton::callback(
            "⬅ Older",
            encode(&format!("hp:{}:{window_id}:{start}:{end}", page + 1)),
        ));
    }
    if page > 0 {
        row.push(InlineKeyboardButton::callback(
            "Newer ➡",
            encode(&format!("hn:{}:{window_id}:{start}:{end}", page - 1)),
        ));
    }
    if row.is_empty() {
        row.push(InlineKeyboardButton::callback("·", encode("noop")));
    }
    InlineKeyboardMarkup::new(vec![row])
}

/// Send (or edit, for pagination callbacks) a history page for a window.
///
/// `byte_range` of (0, 0) means "snapshot now": the whole current file.
/// Returns the end byte of the snapshot, so the caller can advance the
/// user's read offset on the initial view.
#[allow(clippy::too_many_arguments)]
pub async fn send_history(
    ctx: &AppContext,
    chat_id: i64,
    thread_id: Option<i32>,
    window_id: &str,
    page: i64,
    edit: Option<MessageId>,
    byte_range: (u64, u64),
) -> Option<u64> {
    let (start, end) = if byte_range == (0, 0) {
        let session = resolve_session_for_window(&ctx.store, window_id).await?;
        let size = std::fs::metadata(&session.file_path).ok()?.len();
        (0, size)
    } else {
        byte_range
    };

    let (records, _) = get_recent_messages(&ctx.store, window_id, start, Some(end)).await;
    let Some((text, total, page)) = build_history_page(&records, page) else {
        let empty = "No messages in this session yet.";
        match edit {
            Some(message_id) => {
                let _ = sender::edit_md(&ctx.bot, chat_id, message_id, empty, None).await;
            }
            None => {
                let _ = sender::send_md(&ctx.bot, chat_id, thread_id, empty, None).await;
            }
        }
        return Some(end);
    };

    let keyboard = history_keyboard(page, total, window_id, start, end);
    match edit {
        Some(message_id) => {
            let _ = sender::edit_md(&ctx.bot, chat_id, message_id, &text, Some(keyboard)).await;
        }
        None => {
            let _ = sender::send_md(&ctx.bot, chat_id, thread_id, &text, Some(keyboard)).await;
        }
    }
    Some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgram_transcript::ContentType;

    fn record(text: &str, role: Role) -> MessageRecord {
        MessageRecord {
            role,
            text: text.to_string(),
            content_type: ContentType::Text,
            tool_use_id: None,
            tool_name: None,
            timestamp: None,
            image_data: None,
        }
    }

    #[test]
    fn empty_records_yield_none() {
        assert!(build_history_page(&[], 0).is_none());
    }

    #[test]
    fn page_zero_is_newest() {
        let records: Vec<MessageRecord> = (0..12)
            .map(|i| record(&format!("msg {i}"), Role::Assistant))
            .collect();
        let (text, total, page) = build_history_page(&records, 0).unwrap();
        assert_eq!(total, 12);
        assert_eq!(page, 0);
        assert!(text.contains("msg 11"));
        assert!(!text.contains("msg 0\n"));

        let (older, _, _) = build_history_page(&records, 2).unwrap();
        assert!(older.contains("msg 0"));
    }

    #[test]
    fn page_clamps_to_range() {
        let records = vec![record("only", Role::Assistant)];
        let (_, _, page) = build_history_page(&records, 99).unwrap();
        assert_eq!(page, 0);
    }

    #[test]
    fn user_records_are_prefixed() {
        let records = vec![record("hi there", Role::User)];
        let (text, _, _) = build_history_page(&records, 0).unwrap();
        assert!(text.contains("👤 hi there"));
    }

    #[test]
    fn long_messages_are_previewed() {
        let records = vec![record(&"x".repeat(900), Role::Assistant)];
        let (text, _, _) = build_history_page(&records, 0).unwrap();
        assert!(text.contains('…'));
    }
}
