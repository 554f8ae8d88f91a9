//! Message splitting for Telegram's 4096-character limit.

pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Split text into chunks of at most `max_length` characters, preferring
/// newline boundaries. A single over-long line is cut into fixed pieces.
pub fn split_message(text: &str, max_length: usize) -> Vec<String> {
    if text.chars().count() <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        if line_len > max_length {
            if !current.is_empty() {
                chunks.push(current.trim_end_matches('\n').to_string());
                current = String::new();
                current_len = 0;
            }
            let cs: Vec<char> = line.chars().collect();
            for piece in cs.chunks(max_length) {
                chunks.push(piece.iter().collect());
            }
        } else if current_len + line_len + 1 > max_length {
            chunks.push(current.trim_end_matches('\n').to_string());
            current = format!("{line}\n");
            current_len = line_len + 1;
        } else {
            current.push_str(line);
            current.push('\n');
            current_len += line_len + 1;
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim_end_matches('\n').to_string());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn splits_on_newlines() {
        let text = format!("{}\n{}\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let chunks = split_message(&text, 90);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 90));
        assert!(chunks[0].contains('a') && chunks[0].contains('b'));
        assert!(chunks[1].contains('c'));
    }

    #[test]
    fn force_splits_over_long_line() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn respects_char_boundaries() {
        let text = "é".repeat(150);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 100);
    }
}
