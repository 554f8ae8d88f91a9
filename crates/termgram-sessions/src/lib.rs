//! Durable state hub: window↔session associations, topic↔window bindings,
//! per-user read offsets, display names, group chat routing, and directory
//! favorites. Single owner of every persisted map; other components hold only
//! transient copies resolved through it.

pub mod history;
pub mod map;
pub mod store;

pub use history::{get_recent_messages, resolve_session_for_window, ClaudeSession, HistoryMessage};
pub use map::{parse_session_map, WindowDetails};
pub use store::{DirFavorites, SessionStore, WindowState};
