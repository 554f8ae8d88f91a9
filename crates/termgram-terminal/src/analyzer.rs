//! Interactive-prompt region detection via top/bottom marker patterns.

use regex::Regex;

/// Content extracted from an interactive UI region.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractiveUi {
    /// The extracted display content, separators shortened.
    pub content: String,
    /// Pattern name that matched (e.g. "AskUserQuestion").
    pub name: String,
}

/// A marker pair delimiting an interactive UI region.
///
/// Extraction scans lines top-down: the first line matching any `top` regex
/// marks the start, the first subsequent line matching any `bottom` regex
/// marks the end. Both boundary lines are included. With an empty `bottom`
/// set, the region extends to the last non-empty line (multi-tab question
/// panels have a footer that varies by tab).
///
/// `top`/`bottom` hold several alternatives so reworded prompts across CLI
/// versions keep matching.
#[derive(Debug)]
pub struct UiPattern {
    pub name: &'static str,
    pub top: Vec<Regex>,
    pub bottom: Vec<Regex>,
    /// Minimum line distance between top and bottom; closer matches are
    /// rejected as false positives.
    pub min_gap: usize,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

/// Compiled pattern table. Patterns are tried in declaration order; the
/// first match wins.
pub struct PaneAnalyzer {
    patterns: Vec<UiPattern>,
}

impl PaneAnalyzer {
    pub fn new() -> Self {
        let patterns = vec![
            UiPattern {
                name: "ExitPlanMode",
                top: vec![
                    re(r"^\s*Would you like to proceed\?"),
                    re(r"^\s*Claude has written up a plan"),
                ],
                bottom: vec![re(r"^\s*ctrl-g to edit in "), re(r"^\s*Esc to (cancel|exit)")],
                min_gap: 2,
            },
            // Multi-tab variant: footer varies per tab, so no bottom marker.
            UiPattern {
                name: "AskUserQuestion",
                top: vec![re(r"^\s*←\s+[☐✔☒]")],
                bottom: vec![],
                min_gap: 1,
            },
            UiPattern {
                name: "AskUserQuestion",
                top: vec![re(r"^\s*[☐✔☒]")],
                bottom: vec![re(r"^\s*Enter to select")],
                min_gap: 1,
            },
            UiPattern {
                name: "PermissionPrompt",
                top: vec![
                    re(r"^\s*Do you want to proceed\?"),
                    re(r"^\s*Do you want to make this edit"),
                ],
                bottom: vec![re(r"^\s*Esc to cancel")],
                min_gap: 2,
            },
            UiPattern {
                name: "RestoreCheckpoint",
                top: vec![re(r"^\s*Restore the code")],
                bottom: vec![re(r"^\s*Enter to continue")],
                min_gap: 2,
            },
            UiPattern {
                name: "Settings",
                top: vec![re(r"^\s*Settings:.*tab to cycle"), re(r"^\s*Select model")],
                bottom: vec![
                    re(r"Esc to cancel"),
                    re(r"Esc to exit"),
                    re(r"Enter to confirm"),
                    re(r"^\s*Type to filter"),
                ],
                min_gap: 2,
            },
        ];
        Self { patterns }
    }

    /// Extract the first interactive UI region found in pane text.
    pub fn extract_interactive(&self, pane_text: &str) -> Option<InteractiveUi> {
        if pane_text.is_empty() {
            return None;
        }
        let lines: Vec<&str> = pane_text.trim().split('\n').collect();
        self.patterns
            .iter()
            .find_map(|pattern| try_extract(&lines, pattern))
    }

    /// Check whether the pane currently shows an interactive UI.
    pub fn is_interactive(&self, pane_text: &str) -> bool {
        self.extract_interactive(pane_text).is_some()
    }
}

impl Default for PaneAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn try_extract(lines: &[&str], pattern: &UiPattern) -> Option<InteractiveUi> {
    let mut top_idx: Option<usize> = None;
    let mut bottom_idx: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        match top_idx {
            None => {
                if pattern.top.iter().any(|p| p.is_match(line)) {
                    top_idx = Some(i);
                }
            }
            Some(_) => {
                if !pattern.bottom.is_empty() && pattern.bottom.iter().any(|p| p.is_match(line)) {
                    bottom_idx = Some(i);
                    break;
                }
            }
        }
    }

    let top = top_idx?;

    if pattern.bottom.is_empty() {
        bottom_idx = (top + 1..lines.len())
            .rev()
            .find(|&i| !lines[i].trim().is_empty());
    }

    let bottom = bottom_idx?;
    if bottom - top < pattern.min_gap {
        return None;
    }

    let content = lines[top..=bottom].join("\n");
    Some(InteractiveUi {
        content: shorten_separators(content.trim_end()),
        name: pattern.name.to_string(),
    })
}

/// Replace lines of 5+ `─` characters with exactly `─────`.
fn shorten_separators(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let stripped = line.trim();
            if stripped.chars().count() >= 5 && stripped.chars().all(|c| c == '─') {
                "─────"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> PaneAnalyzer {
        PaneAnalyzer::new()
    }

    #[test]
    fn detects_permission_prompt() {
        let pane = "\
some earlier output
Do you want to proceed?
  1. Yes
  2. No
Esc to cancel";
        let ui = analyzer().extract_interactive(pane).unwrap();
        assert_eq!(ui.name, "PermissionPrompt");
        assert!(ui.content.starts_with("Do you want to proceed?"));
        assert!(ui.content.ends_with("Esc to cancel"));
    }

    #[test]
    fn detects_exit_plan_mode_both_wordings() {
        for top in ["Would you like to proceed?", "Claude has written up a plan"] {
            let pane = format!("{top}\n  1. Yes\n  2. No\nEsc to cancel");
            let ui = analyzer().extract_interactive(&pane).unwrap();
            assert_eq!(ui.name, "ExitPlanMode", "top line: {top}");
        }
    }

    #[test]
    fn multi_tab_question_extends_to_last_nonempty_line() {
        let pane = "\
 ←  ☐ Which option?
  ❯ 1. First
    2. Second

";
        let ui = analyzer().extract_interactive(pane).unwrap();
        assert_eq!(ui.name, "AskUserQuestion");
        assert!(ui.content.ends_with("2. Second"));
    }

    #[test]
    fn single_tab_question_requires_bottom_marker() {
        let pane = "\
☐ Pick one
  ❯ 1. A
    2. B
Enter to select";
        let ui = analyzer().extract_interactive(pane).unwrap();
        assert_eq!(ui.name, "AskUserQuestion");
    }

    #[test]
    fn min_gap_rejects_adjacent_markers() {
        // Top and bottom with nothing between them is not a real prompt.
        let pane = "Do you want to proceed?\nEsc to cancel";
        assert!(analyzer().extract_interactive(pane).is_none());
    }

    #[test]
    fn plain_output_is_not_interactive() {
        let pane = "compiling...\nwarning: unused variable\nfinished in 2s";
        assert!(!analyzer().is_interactive(pane));
    }

    #[test]
    fn empty_pane_is_not_interactive() {
        assert!(analyzer().extract_interactive("").is_none());
    }

    #[test]
    fn long_separators_are_shortened() {
        let pane = format!(
            "Do you want to proceed?\n{}\n  1. Yes\nEsc to cancel",
            "─".repeat(60)
        );
        let ui = analyzer().extract_interactive(&pane).unwrap();
        assert!(ui.content.contains("\n─────\n"));
        assert!(!ui.content.contains(&"─".repeat(60)));
    }

    #[test]
    fn first_matching_pattern_wins() {
        // A plan prompt that also contains a checkbox char must classify as
        // ExitPlanMode because it is declared first.
        let pane = "\
Would you like to proceed?
  ☐ keep going
  2. No
Esc to cancel";
        let ui = analyzer().extract_interactive(pane).unwrap();
        assert_eq!(ui.name, "ExitPlanMode");
    }

    #[test]
    fn settings_panel_detected() {
        let pane = "\
Settings:  Model | Usage   (tab to cycle)
  model: default
  verbose: off
Esc to exit";
        let ui = analyzer().extract_interactive(pane).unwrap();
        assert_eq!(ui.name, "Settings");
    }
}
