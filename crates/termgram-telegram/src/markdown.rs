//! Markdown → Telegram MarkdownV2 conversion.
//!
//! Raw Markdown flows through every layer untouched; this conversion runs
//! exactly once, at the send edge. Expandable-quote regions (delimited by the
//! transcript sentinels) are rendered separately as Telegram's collapsed
//! blockquote (`>` lines closed with `||`) so the generic escaping cannot
//! mangle that syntax.

use termgram_transcript::{EXPANDABLE_QUOTE_END, EXPANDABLE_QUOTE_START};

/// Max rendered chars for one expandable quote block, leaving room for
/// surrounding text inside Telegram's 4096-char message limit.
const EXPQUOTE_MAX_RENDERED: usize = 3800;

/// Escape every character MarkdownV2 treats as markup.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Strip the sentinel markers for the plain-text fallback path.
pub fn strip_sentinels(text: &str) -> String {
    text.replace(EXPANDABLE_QUOTE_START, "")
        .replace(EXPANDABLE_QUOTE_END, "")
}

/// Render one expandable blockquote body, truncated to the render budget.
fn render_expandable_quote(inner: &str) -> String {
    let escaped = escape_markdown_v2(inner);
    let suffix = "\n>… \\(truncated\\)||";
    let budget = EXPQUOTE_MAX_RENDERED - suffix.len();

    let mut built: Vec<String> = Vec::new();
    let mut total = 0usize;
    let mut truncated = false;
    for line in escaped.split('\n') {
        let cost = 1 + line.len() + 1; // ">" prefix + "\n" separator
        if total + cost > budget {
            let remaining = budget.saturating_sub(total + 2);
            if remaining > 20 {
                let cut: String = line.chars().take(remaining).collect();
                built.push(format!(">{cut}"));
            }
            truncated = true;
            break;
        }
        built.push(format!(">{line}"));
        total += cost;
    }

    if truncated {
        format!("{}{}", built.join("\n"), suffix)
    } else {
        format!("{}||", built.join("\n"))
    }
}

/// Convert the markdown subset the parser emits: fenced code blocks, inline
/// code, and `**bold**`; everything else is escaped.
fn markdownify(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 32);
    let mut rest = text;

    // Fenced code blocks pass through with only ``\`` and `\` escaped inside.
    while let Some(start) = rest.find("```") {
        out.push_str(&convert_inline(&rest[..start]));
        let after = &rest[start + 3..];
        match after.find("```") {
            Some(end) => {
                let body = &after[..end];
                out.push_str("```");
                out.push_str(&escape_code(body));
                out.push_str("```");
                rest = &after[end + 3..];
            }
            None => {
                // Unterminated fence: escape it literally.
                out.push_str("\\`\\`\\`");
                rest = after;
            }
        }
    }
    out.push_str(&convert_inline(rest));
    out
}

fn escape_code(body: &str) -> String {
    body.replace('\\', "\\\\").replace('`', "\\`")
}

/// Inline conversion: `**bold**` → `*bold*`, `` `code` `` kept as code,
/// all other special characters escaped.
fn convert_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        // Inline code span.
        if chars[i] == '`' {
            if let Some(close) = chars[i + 1..].iter().position(|&c| c == '`') {
                let body: String = chars[i + 1..i + 1 + close].iter().collect();
                out.push('`');
                out.push_str(&escape_code(&body));
                out.push('`');
                i += close + 2;
                continue;
            }
        }
        // Bold: **...** becomes *...*
        if chars[i] == '*' && i + 1 < chars.len() && chars[i + 1] == '*' {
            if let Some(close) = find_double_star(&chars, i + 2) {
                let body: String = chars[i + 2..close].iter().collect();
                out.push('*');
                out.push_str(&escape_markdown_v2(&body));
                out.push('*');
                i = close + 2;
                continue;
            }
        }
        match chars[i] {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' | '\\' => {
                out.push('\\');
                out.push(chars[i]);
            }
            c => out.push(c),
        }
        i += 1;
    }
    out
}

fn find_double_star(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '*' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Convert standard Markdown to MarkdownV2, rendering sentinel-delimited
/// expandable-quote regions separately.
pub fn convert_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    let mut rest = text;
    while let Some(start) = rest.find(EXPANDABLE_QUOTE_START) {
        out.push_str(&markdownify(&rest[..start]));
        let after = &rest[start + EXPANDABLE_QUOTE_START.len_utf8()..];
        match after.find(EXPANDABLE_QUOTE_END) {
            Some(end) => {
                out.push_str(&render_expandable_quote(&after[..end]));
                rest = &after[end + EXPANDABLE_QUOTE_END.len_utf8()..];
            }
            None => {
                // Unterminated region: treat the remainder as quote body.
                out.push_str(&render_expandable_quote(after));
                rest = "";
            }
        }
    }
    out.push_str(&markdownify(rest));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgram_transcript::wrap_expandable;

    #[test]
    fn escapes_specials() {
        let escaped = escape_markdown_v2("a.b!c(d)e[f]");
        assert_eq!(escaped, "a\\.b\\!c\\(d\\)e\\[f\\]");
    }

    #[test]
    fn plain_text_passes_with_escaping_only() {
        assert_eq!(convert_markdown("hello world"), "hello world");
        assert_eq!(convert_markdown("1. item"), "1\\. item");
    }

    #[test]
    fn bold_converts_to_single_star() {
        assert_eq!(convert_markdown("**Read**(a.rs)"), "*Read*\\(a\\.rs\\)");
    }

    #[test]
    fn inline_code_preserved() {
        assert_eq!(convert_markdown("run `ls -la` now"), "run `ls -la` now");
        assert_eq!(convert_markdown("`a\\b`"), "`a\\\\b`");
    }

    #[test]
    fn fenced_code_preserved() {
        let converted = convert_markdown("before\n```\nlet x = a.b;\n```\nafter.");
        assert_eq!(converted, "before\n```\nlet x = a.b;\n```\nafter\\.");
    }

    #[test]
    fn unterminated_fence_is_escaped() {
        assert_eq!(convert_markdown("oops ``` dangling"), "oops \\`\\`\\` dangling");
    }

    #[test]
    fn expandable_quote_renders_as_blockquote() {
        let text = format!("stats line\n{}", wrap_expandable("line one\nline two"));
        let converted = convert_markdown(&text);
        assert!(converted.contains(">line one\n>line two||"), "got: {converted}");
    }

    #[test]
    fn expandable_quote_escapes_inner_markup() {
        let converted = convert_markdown(&wrap_expandable("a*b_c"));
        assert!(converted.contains(">a\\*b\\_c||"));
    }

    #[test]
    fn expandable_quote_truncates_at_budget() {
        let long: String = (0..500)
            .map(|i| format!("line number {i:04}\n"))
            .collect();
        let converted = convert_markdown(&wrap_expandable(&long));
        assert!(converted.len() <= EXPQUOTE_MAX_RENDERED + 64);
        assert!(converted.ends_with("\\(truncated\\)||"), "got tail: {}",
            &converted[converted.len().saturating_sub(40)..]);
    }

    #[test]
    fn strip_sentinels_removes_markers() {
        let text = wrap_expandable("body");
        assert_eq!(strip_sentinels(&text), "body");
    }

    #[test]
    fn text_around_quote_still_converted() {
        let text = format!("**Bash**(make)\n{}", wrap_expandable("ok"));
        let converted = convert_markdown(&text);
        assert!(converted.starts_with("*Bash*\\(make\\)\n"));
        assert!(converted.ends_with(">ok||"));
    }
}
