//! Session monitoring — watches the session map and each active transcript
//! for changes, reads new bytes incrementally, and emits normalized message
//! events plus new-window events for auto-topic creation.

pub mod monitor;
pub mod scan;
pub mod state;

pub use monitor::{MonitorEvent, NewMessage, NewWindowEvent, SessionMonitor};
pub use state::{MonitorState, TrackedSession};
