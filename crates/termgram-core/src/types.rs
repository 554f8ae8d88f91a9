//! Shared identifier types and helpers.

use serde::{Deserialize, Serialize};

/// Return `true` if a key looks like a tmux window ID (e.g. `@0`, `@12`).
///
/// Persisted state written before the window_id migration used window names
/// as keys; this is the discriminator between the two formats.
pub fn is_window_id(key: &str) -> bool {
    let Some(rest) = key.strip_prefix('@') else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

/// Per-window notification mode, cycled from the sessions dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    #[default]
    All,
    ErrorsOnly,
    Muted,
}

impl NotificationMode {
    /// all → errors_only → muted → all
    pub fn next(self) -> Self {
        match self {
            NotificationMode::All => NotificationMode::ErrorsOnly,
            NotificationMode::ErrorsOnly => NotificationMode::Muted,
            NotificationMode::Muted => NotificationMode::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationMode::All => "all",
            NotificationMode::ErrorsOnly => "errors_only",
            NotificationMode::Muted => "muted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_id_shapes() {
        assert!(is_window_id("@0"));
        assert!(is_window_id("@12"));
        assert!(!is_window_id("@"));
        assert!(!is_window_id("myproject"));
        assert!(!is_window_id("@1a"));
        assert!(!is_window_id(""));
    }

    #[test]
    fn notification_mode_cycles() {
        let m = NotificationMode::All;
        assert_eq!(m.next(), NotificationMode::ErrorsOnly);
        assert_eq!(m.next().next(), NotificationMode::Muted);
        assert_eq!(m.next().next().next(), NotificationMode::All);
    }

    #[test]
    fn notification_mode_serde_round_trip() {
        let s = serde_json::to_string(&NotificationMode::ErrorsOnly).unwrap();
        assert_eq!(s, "\"errors_only\"");
        let m: NotificationMode = serde_json::from_str(&s).unwrap();
        assert_eq!(m, NotificationMode::ErrorsOnly);
    }
}
