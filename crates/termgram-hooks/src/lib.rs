//! SessionStart hook: invoked by the agent CLI inside each tmux pane to
//! register the window↔session association in session_map.json.
//!
//! This crate must stay independent of the bot config — hooks run in panes
//! where the bot's environment (token, allowlist) is not set.

pub mod install;
pub mod payload;

pub use install::{hook_status, install_hook, uninstall_hook};
pub use payload::{process_hook_payload, HookPayload, SessionMapEntry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("tmux error: {0}")]
    Tmux(String),
}

pub type Result<T> = std::result::Result<T, HookError>;
