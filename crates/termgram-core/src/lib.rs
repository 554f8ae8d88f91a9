pub mod config;
pub mod error;
pub mod fsutil;
pub mod types;

pub use config::TermgramConfig;
pub use error::{Result, TermgramError};
