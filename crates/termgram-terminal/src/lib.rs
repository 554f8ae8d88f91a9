//! Captured-pane analysis for the AI CLI's terminal UI.
//!
//! Detects interactive prompt regions, the spinner status line, `!` bash
//! command echo regions, and the usage settings panel in plain-text pane
//! captures. All detection is best-effort: unrecognized content yields
//! `None`, never an error.
//!
//! All CLI text patterns live here. To support a new UI type or a changed
//! CLI version, edit the pattern table in `PaneAnalyzer::new`.

pub mod analyzer;
pub mod status;

pub use analyzer::{InteractiveUi, PaneAnalyzer, UiPattern};
pub use status::{
    extract_bash_output, parse_status_line, parse_usage_output, strip_pane_chrome, UsageInfo,
};
