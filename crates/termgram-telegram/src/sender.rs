//! Safe send/edit helpers with MarkdownV2 → plain-text fallback.
//!
//! Rate limiting lives in the `Throttle` adaptor underneath; `RetryAfter`
//! errors are re-raised so the queue worker can pause and retry the same
//! task. Every other failure degrades to plain text, then to a logged drop.

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, MessageId, ParseMode, ThreadId};
use teloxide::RequestError;
use tracing::{debug, warn};

use crate::context::Bot;
use crate::markdown::{convert_markdown, strip_sentinels};

pub fn as_thread(thread_id: Option<i32>) -> Option<ThreadId> {
    thread_id.map(|t| ThreadId(MessageId(t)))
}

pub fn is_retry_after(err: &RequestError) -> Option<std::time::Duration> {
    match err {
        RequestError::RetryAfter(secs) => Some(secs.duration()),
        _ => None,
    }
}

fn is_not_modified(err: &RequestError) -> bool {
    err.to_string().to_lowercase().contains("message is not modified")
}

/// Send `text` (raw Markdown) converting to MarkdownV2, falling back to
/// plain text when Telegram rejects the markup. Returns the sent message, or
/// `None` when both attempts failed for non-rate-limit reasons.
pub async fn send_md(
    bot: &Bot,
    chat_id: i64,
    thread_id: Option<i32>,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<Option<Message>, RequestError> {
    let mut req = bot
        .send_message(ChatId(chat_id), convert_markdown(text))
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(t) = as_thread(thread_id) {
        req = req.message_thread_id(t);
    }
    if let Some(kb) = keyboard.clone() {
        req = req.reply_markup(kb);
    }
    match req.await {
        Ok(msg) => Ok(Some(msg)),
        Err(e) if is_retry_after(&e).is_some() => Err(e),
        Err(e) => {
            debug!(error = %e, "MarkdownV2 send rejected, falling back to plain");
            let mut req = bot.send_message(ChatId(chat_id), strip_sentinels(text));
            if let Some(t) = as_thread(thread_id) {
                req = req.message_thread_id(t);
            }
            if let Some(kb) = keyboard {
                req = req.reply_markup(kb);
            }
            match req.await {
                Ok(msg) => Ok(Some(msg)),
                Err(e) if is_retry_after(&e).is_some() => Err(e),
                Err(e) => {
                    warn!(chat_id, error = %e, "failed to send message");
                    Ok(None)
                }
            }
        }
    }
}

/// Send plain text without any conversion (terminal captures, prompts).
pub async fn send_plain(
    bot: &Bot,
    chat_id: i64,
    thread_id: Option<i32>,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<Option<Message>, RequestError> {
    let mut req = bot.send_message(ChatId(chat_id), text);
    if let Some(t) = as_thread(thread_id) {
        req = req.message_thread_id(t);
    }
    if let Some(kb) = keyboard {
        req = req.reply_markup(kb);
    }
    match req.await {
        Ok(msg) => Ok(Some(msg)),
        Err(e) if is_retry_after(&e).is_some() => Err(e),
        Err(e) => {
            warn!(chat_id, error = %e, "failed to send plain message");
            Ok(None)
        }
    }
}

/// Edit a message in place, MarkdownV2 first, plain fallback. Returns
/// whether the edit succeeded ("not modified" counts as success).
pub async fn edit_md(
    bot: &Bot,
    chat_id: i64,
    message_id: MessageId,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<bool, RequestError> {
    let mut req = bot
        .edit_message_text(ChatId(chat_id), message_id, convert_markdown(text))
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(kb) = keyboard.clone() {
        req = req.reply_markup(kb);
    }
    match req.await {
        Ok(_) => Ok(true),
        Err(e) if is_retry_after(&e).is_some() => Err(e),
        Err(e) if is_not_modified(&e) => Ok(true),
        Err(e) => {
            debug!(error = %e, "MarkdownV2 edit rejected, falling back to plain");
            let mut req = bot.edit_message_text(ChatId(chat_id), message_id, strip_sentinels(text));
            if let Some(kb) = keyboard {
                req = req.reply_markup(kb);
            }
            match req.await {
                Ok(_) => Ok(true),
                Err(e) if is_retry_after(&e).is_some() => Err(e),
                Err(e) if is_not_modified(&e) => Ok(true),
                Err(e) => {
                    debug!(chat_id, error = %e, "failed to edit message");
                    Ok(false)
                }
            }
        }
    }
}

/// Edit with plain text only (interactive prompt captures).
pub async fn edit_plain(
    bot: &Bot,
    chat_id: i64,
    message_id: MessageId,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<bool, RequestError> {
    let mut req = bot.edit_message_text(ChatId(chat_id), message_id, text);
    if let Some(kb) = keyboard {
        req = req.reply_markup(kb);
    }
    match req.await {
        Ok(_) => Ok(true),
        Err(e) if is_retry_after(&e).is_some() => Err(e),
        Err(e) if is_not_modified(&e) => Ok(true),
        Err(e) => {
            debug!(chat_id, error = %e, "failed to edit message");
            Ok(false)
        }
    }
}

/// Best-effort delete; deleted/too-old messages are not an error.
pub async fn delete_message(bot: &Bot, chat_id: i64, message_id: MessageId) {
    if let Err(e) = bot.delete_message(ChatId(chat_id), message_id).await {
        debug!(chat_id, message_id = message_id.0, error = %e, "delete failed");
    }
}
