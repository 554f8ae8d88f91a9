//! JSONL transcript parsing for AI-CLI session files.
//!
//! Translates structured log entries into a normalized message stream with
//! tool-call pairing. Pending tool_use state can be carried across calls so a
//! tool_use observed in one poll cycle still pairs with a tool_result that
//! arrives in the next.

pub mod diff;
pub mod parser;
pub mod record;

pub use parser::{parse_entries, parse_line};
pub use record::{
    wrap_expandable, ContentType, ImageAttachment, MessageRecord, PendingTool, Role,
    EXPANDABLE_QUOTE_END, EXPANDABLE_QUOTE_START,
};
