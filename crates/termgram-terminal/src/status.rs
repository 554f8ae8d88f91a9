//! Status line, pane chrome, bash output, and usage panel parsing.

/// Spinner characters the CLI uses in its status line.
const STATUS_SPINNERS: [char; 6] = ['·', '✻', '✽', '✶', '✳', '✢'];

/// How many trailing lines may contain the pane chrome.
const CHROME_SEARCH_WINDOW: usize = 10;

fn is_chrome_separator(line: &str) -> bool {
    let stripped = line.trim();
    stripped.chars().count() >= 20 && stripped.chars().all(|c| c == '─')
}

/// Extract the CLI status line from pane text.
///
/// The status line (spinner + working text) sits just above the chrome
/// separator (a full line of `─`). Anchoring on the separator avoids false
/// positives from `·` bullets inside regular output.
///
/// Returns the text after the spinner, or `None` when no status line shows.
pub fn parse_status_line(pane_text: &str) -> Option<String> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = pane_text.split('\n').collect();

    let search_start = lines.len().saturating_sub(CHROME_SEARCH_WINDOW);
    let chrome_idx = (search_start..lines.len()).find(|&i| is_chrome_separator(lines[i]))?;

    // Walk up to 4 lines above the separator, skipping blanks. The first
    // non-blank line decides: spinner prefix → status, anything else → none.
    let lower = chrome_idx.saturating_sub(4);
    for i in (lower..chrome_idx).rev() {
        let line = lines[i].trim();
        if line.is_empty() {
            continue;
        }
        let first = line.chars().next()?;
        if STATUS_SPINNERS.contains(&first) {
            let rest: String = line.chars().skip(1).collect();
            return Some(rest.trim().to_string());
        }
        return None;
    }
    None
}

/// Strip the CLI's bottom chrome (prompt area + status bar).
///
/// The bottom of the pane looks like:
///
/// ```text
/// ────────────────────────  (separator)
/// ❯                         (prompt)
/// ────────────────────────  (separator)
///   [model] Context: 34%
/// ```
///
/// Finds the topmost separator in the last 10 lines and drops everything
/// from there down.
pub fn strip_pane_chrome<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let search_start = lines.len().saturating_sub(CHROME_SEARCH_WINDOW);
    for i in search_start..lines.len() {
        if is_chrome_separator(lines[i]) {
            return lines[..i].to_vec();
        }
    }
    lines.to_vec()
}

/// Extract `!` bash-command output from a pane capture.
///
/// Searches from the bottom for the `! <command>` echo line (matching on the
/// first 10 characters, the echo may be truncated), then returns that line
/// and everything below it within the non-chrome region.
pub fn extract_bash_output(pane_text: &str, command: &str) -> Option<String> {
    let all_lines: Vec<&str> = pane_text.lines().collect();
    let lines = strip_pane_chrome(&all_lines);

    let match_prefix: String = command.chars().take(10).collect();
    let spaced = format!("! {match_prefix}");
    let tight = format!("!{match_prefix}");

    let cmd_idx = (0..lines.len()).rev().find(|&i| {
        let stripped = lines[i].trim();
        stripped.starts_with(&spaced) || stripped.starts_with(&tight)
    })?;

    let mut region: Vec<&str> = lines[cmd_idx..].to_vec();
    while region.last().is_some_and(|l| l.trim().is_empty()) {
        region.pop();
    }
    if region.is_empty() {
        return None;
    }
    Some(region.join("\n").trim().to_string())
}

/// Parsed output from the CLI's usage settings tab.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageInfo {
    /// Full captured pane text.
    pub raw_text: String,
    /// Cleaned content lines from the panel.
    pub parsed_lines: Vec<String>,
}

fn is_block_element(c: char) -> bool {
    ('\u{2580}'..='\u{259f}').contains(&c)
}

/// Extract usage information from the CLI's usage settings tab.
///
/// Brackets the region between a line containing both `Settings:` and
/// `Usage` (header, excluded) and a line beginning with `Esc to ` (footer,
/// excluded), stripping leading progress-bar block characters from each
/// content line.
pub fn parse_usage_output(pane_text: &str) -> Option<UsageInfo> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = pane_text.trim().split('\n').collect();

    let mut start_idx: Option<usize> = None;
    let mut end_idx: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        match start_idx {
            None => {
                if stripped.contains("Settings:") && stripped.contains("Usage") {
                    start_idx = Some(i + 1);
                }
            }
            Some(_) => {
                if stripped.starts_with("Esc to ") {
                    end_idx = Some(i);
                    break;
                }
            }
        }
    }

    let start = start_idx?;
    let end = end_idx.unwrap_or(lines.len());

    let mut cleaned: Vec<String> = Vec::new();
    for line in &lines[start..end] {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        let without_bars = stripped
            .trim_start_matches(|c: char| is_block_element(c) || c.is_whitespace())
            .trim();
        if !without_bars.is_empty() {
            cleaned.push(without_bars.to_string());
        }
    }

    if cleaned.is_empty() {
        return None;
    }
    Some(UsageInfo {
        raw_text: pane_text.to_string(),
        parsed_lines: cleaned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sep() -> String {
        "─".repeat(40)
    }

    #[test]
    fn status_line_above_separator() {
        let pane = format!("output line\n✻ Pondering… (esc to interrupt)\n{}\n❯", sep());
        assert_eq!(
            parse_status_line(&pane).as_deref(),
            Some("Pondering… (esc to interrupt)")
        );
    }

    #[test]
    fn status_line_skips_blanks_above_separator() {
        let pane = format!("· Working…\n\n\n{}\n❯", sep());
        assert_eq!(parse_status_line(&pane).as_deref(), Some("Working…"));
    }

    #[test]
    fn bullet_in_body_without_chrome_is_not_status() {
        let pane = "· this is a bullet\nmore text";
        assert_eq!(parse_status_line(pane), None);
    }

    #[test]
    fn non_spinner_line_above_separator_is_not_status() {
        let pane = format!("just output\n{}\n❯", sep());
        assert_eq!(parse_status_line(&pane), None);
    }

    #[test]
    fn short_dash_run_is_not_chrome() {
        let pane = "✻ Working…\n────────\n❯";
        assert_eq!(parse_status_line(pane), None);
    }

    #[test]
    fn strip_chrome_drops_from_topmost_separator() {
        let separator = sep();
        let lines = vec!["output", "more", separator.as_str(), "❯", separator.as_str()];
        assert_eq!(strip_pane_chrome(&lines), vec!["output", "more"]);
    }

    #[test]
    fn strip_chrome_without_separator_keeps_all() {
        let lines = vec!["a", "b"];
        assert_eq!(strip_pane_chrome(&lines), vec!["a", "b"]);
    }

    #[test]
    fn bash_output_found_from_bottom() {
        let pane = format!(
            "older stuff\n! cargo build\n  ⎿  Compiling termgram\n  ⎿  Finished\n{}\n❯",
            sep()
        );
        let out = extract_bash_output(&pane, "cargo build --release").unwrap();
        assert!(out.starts_with("! cargo buil"), "out: {out}");
        assert!(out.ends_with("Finished"));
    }

    #[test]
    fn bash_output_missing_echo_returns_none() {
        let pane = format!("no echo here\n{}\n❯", sep());
        assert_eq!(extract_bash_output(&pane, "ls"), None);
    }

    #[test]
    fn usage_panel_parses_content_lines() {
        let pane = "\
Settings:  Model | Usage   (tab to cycle)
  █████▋   38% used
  Resets at 3pm

Esc to cancel";
        let usage = parse_usage_output(pane).unwrap();
        assert_eq!(usage.parsed_lines, vec!["38% used", "Resets at 3pm"]);
    }

    #[test]
    fn usage_panel_absent_returns_none() {
        assert_eq!(parse_usage_output("regular output"), None);
        assert_eq!(parse_usage_output(""), None);
    }
}
