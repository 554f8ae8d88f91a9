//! Terminal "screenshot": the pane capture (with color codes preserved)
//! shipped as a document, with a control-key keyboard attached.
//!
//! Rendering the capture to a bitmap is an external concern; the raw capture
//! travels as a text document the renderer (or the user) can consume.

use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia, InputMediaDocument,
    MessageId,
};
use tracing::debug;

use crate::callback::encode;
use crate::context::AppContext;
use crate::sender::as_thread;

/// Control-key keyboard shown under screenshots.
pub fn build_screenshot_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    let btn = |label: &str, key: &str| {
        InlineKeyboardButton::callback(label, encode(&format!("kb:{key}:{window_id}")))
    };
    InlineKeyboardMarkup::new(vec![
        vec![btn("␣ Space", "spc"), btn("↑", "up"), btn("⇥ Tab", "tab")],
        vec![btn("←", "lt"), btn("↓", "dn"), btn("→", "rt")],
        vec![btn("⎋ Esc", "esc"), btn("^C", "cc"), btn("⏎ Enter", "ent")],
        vec![InlineKeyboardButton::callback(
            "🔄 Refresh",
            encode(&format!("ss:ref:{window_id}")),
        )],
    ])
}

fn capture_document(text: &str) -> InputFile {
    InputFile::memory(text.as_bytes().to_vec()).file_name("screenshot.txt")
}

/// Capture the pane and send it as a document into the topic.
pub async fn send_screenshot(
    ctx: &AppContext,
    chat_id: i64,
    thread_id: Option<i32>,
    window_id: &str,
) -> Result<(), String> {
    let window = match ctx.tmux.find_window_by_id(window_id).await {
        Ok(Some(w)) => w,
        _ => return Err("Window no longer exists".to_string()),
    };
    let Some(text) = ctx.tmux.capture_pane(&window.window_id, true).await else {
        return Err("Failed to capture pane content".to_string());
    };

    let mut req = ctx
        .bot
        .send_document(ChatId(chat_id), capture_document(&text))
        .reply_markup(build_screenshot_keyboard(window_id));
    if let Some(t) = as_thread(thread_id) {
        req = req.message_thread_id(t);
    }
    req.await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Replace an existing screenshot message with a fresh capture.
pub async fn refresh_screenshot(
    ctx: &AppContext,
    chat_id: i64,
    message_id: MessageId,
    window_id: &str,
) -> Result<(), String> {
    let window = match ctx.tmux.find_window_by_id(window_id).await {
        Ok(Some(w)) => w,
        _ => return Err("Window no longer exists".to_string()),
    };
    let Some(text) = ctx.tmux.capture_pane(&window.window_id, true).await else {
        return Err("Failed to capture pane".to_string());
    };

    let media = InputMedia::Document(InputMediaDocument::new(capture_document(&text)));
    let result = ctx
        .bot
        .edit_message_media(ChatId(chat_id), message_id, media)
        .reply_markup(build_screenshot_keyboard(window_id))
        .await;
    if let Err(e) = result {
        debug!(error = %e, "screenshot refresh failed");
        return Err("Failed to refresh".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_has_control_rows_and_refresh() {
        let kb = build_screenshot_keyboard("@7");
        assert_eq!(kb.inline_keyboard.len(), 4);
        assert_eq!(kb.inline_keyboard[0].len(), 3);
        assert_eq!(kb.inline_keyboard[3].len(), 1);
    }
}
