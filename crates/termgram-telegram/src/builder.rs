//! Response part building: one parsed message → paginated raw-Markdown parts.
//!
//! No markup conversion happens here — the send layer converts each part
//! exactly once.

use termgram_transcript::{ContentType, Role, EXPANDABLE_QUOTE_END, EXPANDABLE_QUOTE_START};

/// Conservative cap leaving room for MarkdownV2 escaping at the send edge.
const MAX_PART_TEXT: usize = 3000;
const MAX_THINKING: usize = 500;

/// Build paginated response parts. Multi-part messages carry a `[i/N]`
/// suffix; user messages are prefixed with 👤 and never split.
pub fn build_response_parts(text: &str, content_type: ContentType, role: Role) -> Vec<String> {
    let mut text = text.trim().to_string();

    if role == Role::User {
        if text.chars().count() > MAX_PART_TEXT {
            let cut: String = text.chars().take(MAX_PART_TEXT).collect();
            text = format!("{cut}…");
        }
        return vec![format!("👤 {text}")];
    }

    // Thinking stays compact: truncate the quoted body.
    if content_type == ContentType::Thinking {
        text = truncate_thinking(&text);
    }

    let (prefix, separator) = if content_type == ContentType::Thinking {
        ("∴ Thinking…", "\n")
    } else {
        ("", "")
    };

    // Expandable quotes must stay atomic — the quote renderer enforces its
    // own budget, so no splitting here.
    if text.contains(EXPANDABLE_QUOTE_START) {
        return vec![assemble(prefix, separator, &text)];
    }

    let budget = MAX_PART_TEXT - prefix.len() - separator.len();
    let chunks = crate::split::split_message(&text, budget);
    let total = chunks.len();
    if total == 1 {
        return vec![assemble(prefix, separator, &chunks[0])];
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{}\n\n[{}/{}]", assemble(prefix, separator, &chunk), i + 1, total))
        .collect()
}

fn assemble(prefix: &str, separator: &str, body: &str) -> String {
    if prefix.is_empty() {
        body.to_string()
    } else {
        format!("{prefix}{separator}{body}")
    }
}

fn truncate_thinking(text: &str) -> String {
    if let (Some(start), Some(end)) = (
        text.find(EXPANDABLE_QUOTE_START),
        text.find(EXPANDABLE_QUOTE_END),
    ) {
        let inner = &text[start + EXPANDABLE_QUOTE_START.len_utf8()..end];
        if inner.chars().count() > MAX_THINKING {
            let cut: String = inner.chars().take(MAX_THINKING).collect();
            return format!(
                "{}{cut}\n\n… (thinking truncated){}",
                &text[..start + EXPANDABLE_QUOTE_START.len_utf8()],
                EXPANDABLE_QUOTE_END
            );
        }
        return text.to_string();
    }
    if text.chars().count() > MAX_THINKING {
        let cut: String = text.chars().take(MAX_THINKING).collect();
        return format!("{cut}\n\n… (thinking truncated)");
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgram_transcript::wrap_expandable;

    #[test]
    fn user_message_gets_emoji_prefix() {
        let parts = build_response_parts("hello", ContentType::Text, Role::User);
        assert_eq!(parts, vec!["👤 hello"]);
    }

    #[test]
    fn short_assistant_text_is_single_part() {
        let parts = build_response_parts("done.", ContentType::Text, Role::Assistant);
        assert_eq!(parts, vec!["done."]);
    }

    #[test]
    fn long_text_paginates_with_suffix() {
        let text = (0..200)
            .map(|i| format!("line number {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let parts = build_response_parts(&text, ContentType::Text, Role::Assistant);
        assert!(parts.len() > 1);
        assert!(parts[0].ends_with(&format!("[1/{}]", parts.len())));
        assert!(parts.last().unwrap().ends_with(&format!("[{0}/{0}]", parts.len())));
    }

    #[test]
    fn thinking_gets_prefix_and_truncation() {
        let long = "x".repeat(900);
        let parts = build_response_parts(
            &wrap_expandable(&long),
            ContentType::Thinking,
            Role::Assistant,
        );
        assert_eq!(parts.len(), 1);
        assert!(parts[0].starts_with("∴ Thinking…\n"));
        assert!(parts[0].contains("(thinking truncated)"));
    }

    #[test]
    fn expandable_quote_is_never_split() {
        let long = "line\n".repeat(2000);
        let parts = build_response_parts(
            &format!("  ⎿  Output 2000 lines\n{}", wrap_expandable(&long)),
            ContentType::ToolResult,
            Role::Assistant,
        );
        assert_eq!(parts.len(), 1, "quote regions stay atomic");
    }
}
