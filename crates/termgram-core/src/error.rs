use thiserror::Error;

#[derive(Debug, Error)]
pub enum TermgramError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Window not found: {window_id}")]
    WindowNotFound { window_id: String },

    #[error("State persistence error: {0}")]
    State(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TermgramError>;
