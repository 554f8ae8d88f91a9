use thiserror::Error;

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux command failed: {0}")]
    Command(String),

    #[error("tmux command timed out")]
    Timeout,

    #[error("Window not found: {0}")]
    WindowNotFound(String),

    #[error("Directory does not exist: {0}")]
    BadDirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TmuxError>;
