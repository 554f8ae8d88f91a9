//! Inline-keyboard callback data.
//!
//! Callback payloads are ≤64-byte strings with a short prefix. They are
//! parsed exactly once, at the edge, into a tagged `CallbackAction`; every
//! handler downstream works with typed payloads.

/// Truncate callback data to Telegram's 64-byte limit on a char boundary.
pub fn encode(data: &str) -> String {
    if data.len() <= 64 {
        return data.to_string();
    }
    let mut end = 64;
    while end > 0 && !data.is_char_boundary(end) {
        end -= 1;
    }
    data[..end].to_string()
}

/// Keys available on the interactive-prompt keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskKey {
    Up,
    Down,
    Left,
    Right,
    Esc,
    Enter,
    Space,
    Tab,
    Refresh,
}

impl AskKey {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "up" => AskKey::Up,
            "down" => AskKey::Down,
            "left" => AskKey::Left,
            "right" => AskKey::Right,
            "esc" => AskKey::Esc,
            "enter" => AskKey::Enter,
            "spc" => AskKey::Space,
            "tab" => AskKey::Tab,
            "ref" => AskKey::Refresh,
            _ => return None,
        })
    }

    /// The tmux named key this button injects (`Refresh` injects nothing).
    pub fn tmux_key(self) -> Option<&'static str> {
        Some(match self {
            AskKey::Up => "Up",
            AskKey::Down => "Down",
            AskKey::Left => "Left",
            AskKey::Right => "Right",
            AskKey::Esc => "Escape",
            AskKey::Enter => "Enter",
            AskKey::Space => "Space",
            AskKey::Tab => "Tab",
            AskKey::Refresh => return None,
        })
    }

    /// Toast label shown when the key is pressed.
    pub fn label(self) -> &'static str {
        match self {
            AskKey::Up => "↑",
            AskKey::Down => "↓",
            AskKey::Left => "←",
            AskKey::Right => "→",
            AskKey::Esc => "⎋ Esc",
            AskKey::Enter => "⏎ Enter",
            AskKey::Space => "␣ Space",
            AskKey::Tab => "⇥ Tab",
            AskKey::Refresh => "🔄",
        }
    }
}

/// Keys available on the screenshot control keyboard (adds Ctrl-C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Up,
    Down,
    Left,
    Right,
    Esc,
    Enter,
    Space,
    Tab,
    CtrlC,
}

impl ControlKey {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "up" => ControlKey::Up,
            "dn" => ControlKey::Down,
            "lt" => ControlKey::Left,
            "rt" => ControlKey::Right,
            "esc" => ControlKey::Esc,
            "ent" => ControlKey::Enter,
            "spc" => ControlKey::Space,
            "tab" => ControlKey::Tab,
            "cc" => ControlKey::CtrlC,
            _ => return None,
        })
    }

    pub fn tmux_key(self) -> &'static str {
        match self {
            ControlKey::Up => "Up",
            ControlKey::Down => "Down",
            ControlKey::Left => "Left",
            ControlKey::Right => "Right",
            ControlKey::Esc => "Escape",
            ControlKey::Enter => "Enter",
            ControlKey::Space => "Space",
            ControlKey::Tab => "Tab",
            ControlKey::CtrlC => "C-c",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ControlKey::Up => "↑",
            ControlKey::Down => "↓",
            ControlKey::Left => "←",
            ControlKey::Right => "→",
            ControlKey::Esc => "⎋ Esc",
            ControlKey::Enter => "⏎ Enter",
            ControlKey::Space => "␣ Space",
            ControlKey::Tab => "⇥ Tab",
            ControlKey::CtrlC => "^C",
        }
    }
}

/// Every inline-keyboard action the bot understands.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    /// History pagination (`hp:`/`hn:`): page offset + byte range snapshot.
    HistoryPage {
        newer: bool,
        page: i64,
        window_id: String,
        start: u64,
        end: u64,
    },

    DirSelect(usize),
    DirUp,
    DirPage(usize),
    DirConfirm,
    DirCancel,
    DirStar,

    WinBind(usize),
    WinNew,
    WinCancel,

    ScreenshotRefresh { window_id: String },
    AskKey { key: AskKey, window_id: String },
    ControlKey { key: ControlKey, window_id: String },

    SessionsRefresh,
    SessionsNew,
    SessionsKill { window_id: String },
    SessionsKillConfirm { window_id: String },
    SessionsMode { window_id: String },

    StatusEsc { window_id: String },
    StatusScreenshot { window_id: String },

    RecoveryFresh { window_id: String },
    RecoveryContinue { window_id: String },
    RecoveryResume { window_id: String },
    RecoveryPick(usize),
    RecoveryBack { window_id: String },
    RecoveryCancel,

    ResumePick(usize),
    ResumePage(usize),
    ResumeCancel,

    Noop,
}

impl CallbackAction {
    /// Parse raw callback data. `None` means malformed — the router answers
    /// with an "Invalid data" toast.
    pub fn parse(data: &str) -> Option<Self> {
        if data == "noop" {
            return Some(CallbackAction::Noop);
        }

        if let Some(rest) = data.strip_prefix("hp:").or_else(|| data.strip_prefix("hn:")) {
            let newer = data.starts_with("hn:");
            let parts: Vec<&str> = rest.split(':').collect();
            // Old format: page:window_id. New: page:window_id:start:end,
            // where window_id may itself contain colons.
            let (page_s, window_id, start, end) = if parts.len() >= 4 {
                (
                    parts[0],
                    parts[1..parts.len() - 2].join(":"),
                    parts[parts.len() - 2].parse::<u64>().ok()?,
                    parts[parts.len() - 1].parse::<u64>().ok()?,
                )
            } else if parts.len() >= 2 {
                (parts[0], parts[1..].join(":"), 0, 0)
            } else {
                return None;
            };
            return Some(CallbackAction::HistoryPage {
                newer,
                page: page_s.parse().ok()?,
                window_id,
                start,
                end,
            });
        }

        if let Some(rest) = data.strip_prefix("db:") {
            return Some(match rest {
                "up" => CallbackAction::DirUp,
                "confirm" => CallbackAction::DirConfirm,
                "cancel" => CallbackAction::DirCancel,
                "star" => CallbackAction::DirStar,
                _ => {
                    if let Some(idx) = rest.strip_prefix("sel:") {
                        CallbackAction::DirSelect(idx.parse().ok()?)
                    } else if let Some(page) = rest.strip_prefix("page:") {
                        CallbackAction::DirPage(page.parse().ok()?)
                    } else {
                        return None;
                    }
                }
            });
        }

        if let Some(rest) = data.strip_prefix("wb:") {
            return Some(match rest {
                "new" => CallbackAction::WinNew,
                "cancel" => CallbackAction::WinCancel,
                _ => CallbackAction::WinBind(rest.strip_prefix("sel:")?.parse().ok()?),
            });
        }

        if let Some(window_id) = data.strip_prefix("ss:ref:") {
            return Some(CallbackAction::ScreenshotRefresh {
                window_id: window_id.to_string(),
            });
        }

        if let Some(rest) = data.strip_prefix("aq:") {
            let (key_s, window_id) = rest.split_once(':')?;
            return Some(CallbackAction::AskKey {
                key: AskKey::parse(key_s)?,
                window_id: window_id.to_string(),
            });
        }

        if let Some(rest) = data.strip_prefix("kb:") {
            let (key_s, window_id) = rest.split_once(':')?;
            return Some(CallbackAction::ControlKey {
                key: ControlKey::parse(key_s)?,
                window_id: window_id.to_string(),
            });
        }

        if let Some(rest) = data.strip_prefix("sess:") {
            return Some(match rest {
                "ref" => CallbackAction::SessionsRefresh,
                "new" => CallbackAction::SessionsNew,
                _ => {
                    if let Some(wid) = rest.strip_prefix("killok:") {
                        CallbackAction::SessionsKillConfirm {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(wid) = rest.strip_prefix("kill:") {
                        CallbackAction::SessionsKill {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(wid) = rest.strip_prefix("mode:") {
                        CallbackAction::SessionsMode {
                            window_id: wid.to_string(),
                        }
                    } else {
                        return None;
                    }
                }
            });
        }

        if let Some(rest) = data.strip_prefix("st:") {
            if let Some(wid) = rest.strip_prefix("esc:") {
                return Some(CallbackAction::StatusEsc {
                    window_id: wid.to_string(),
                });
            }
            if let Some(wid) = rest.strip_prefix("ss:") {
                return Some(CallbackAction::StatusScreenshot {
                    window_id: wid.to_string(),
                });
            }
            return None;
        }

        if let Some(rest) = data.strip_prefix("rec:") {
            return Some(match rest {
                "x" => CallbackAction::RecoveryCancel,
                _ => {
                    if let Some(wid) = rest.strip_prefix("f:") {
                        CallbackAction::RecoveryFresh {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(wid) = rest.strip_prefix("c:") {
                        CallbackAction::RecoveryContinue {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(wid) = rest.strip_prefix("r:") {
                        CallbackAction::RecoveryResume {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(wid) = rest.strip_prefix("b:") {
                        CallbackAction::RecoveryBack {
                            window_id: wid.to_string(),
                        }
                    } else if let Some(idx) = rest.strip_prefix("p:") {
                        CallbackAction::RecoveryPick(idx.parse().ok()?)
                    } else {
                        return None;
                    }
                }
            });
        }

        if let Some(rest) = data.strip_prefix("res:") {
            return Some(match rest {
                "x" => CallbackAction::ResumeCancel,
                _ => {
                    if let Some(idx) = rest.strip_prefix("p:") {
                        CallbackAction::ResumePick(idx.parse().ok()?)
                    } else if let Some(page) = rest.strip_prefix("pg:") {
                        CallbackAction::ResumePage(page.parse().ok()?)
                    } else {
                        return None;
                    }
                }
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_truncates_at_64_bytes() {
        let long = "x".repeat(100);
        assert_eq!(encode(&long).len(), 64);
        assert_eq!(encode("short"), "short");
    }

    #[test]
    fn encode_respects_char_boundaries() {
        let data = format!("{}é", "x".repeat(63));
        let encoded = encode(&data);
        assert!(encoded.len() <= 64);
        assert!(encoded.is_char_boundary(encoded.len()));
    }

    #[test]
    fn parses_history_new_format() {
        let action = CallbackAction::parse("hp:2:@5:100:900").unwrap();
        assert_eq!(
            action,
            CallbackAction::HistoryPage {
                newer: false,
                page: 2,
                window_id: "@5".into(),
                start: 100,
                end: 900,
            }
        );
    }

    #[test]
    fn parses_history_old_format() {
        let action = CallbackAction::parse("hn:1:@5").unwrap();
        assert_eq!(
            action,
            CallbackAction::HistoryPage {
                newer: true,
                page: 1,
                window_id: "@5".into(),
                start: 0,
                end: 0,
            }
        );
    }

    #[test]
    fn parses_directory_actions() {
        assert_eq!(CallbackAction::parse("db:sel:3"), Some(CallbackAction::DirSelect(3)));
        assert_eq!(CallbackAction::parse("db:up"), Some(CallbackAction::DirUp));
        assert_eq!(CallbackAction::parse("db:page:2"), Some(CallbackAction::DirPage(2)));
        assert_eq!(CallbackAction::parse("db:confirm"), Some(CallbackAction::DirConfirm));
        assert_eq!(CallbackAction::parse("db:cancel"), Some(CallbackAction::DirCancel));
        assert_eq!(CallbackAction::parse("db:star"), Some(CallbackAction::DirStar));
    }

    #[test]
    fn parses_window_picker() {
        assert_eq!(CallbackAction::parse("wb:sel:0"), Some(CallbackAction::WinBind(0)));
        assert_eq!(CallbackAction::parse("wb:new"), Some(CallbackAction::WinNew));
        assert_eq!(CallbackAction::parse("wb:cancel"), Some(CallbackAction::WinCancel));
    }

    #[test]
    fn parses_interactive_keys() {
        let action = CallbackAction::parse("aq:up:@12").unwrap();
        assert_eq!(
            action,
            CallbackAction::AskKey {
                key: AskKey::Up,
                window_id: "@12".into()
            }
        );
        assert_eq!(AskKey::Up.tmux_key(), Some("Up"));
        assert_eq!(AskKey::Refresh.tmux_key(), None);
    }

    #[test]
    fn parses_control_keys() {
        let action = CallbackAction::parse("kb:cc:@3").unwrap();
        assert_eq!(
            action,
            CallbackAction::ControlKey {
                key: ControlKey::CtrlC,
                window_id: "@3".into()
            }
        );
        assert_eq!(ControlKey::CtrlC.tmux_key(), "C-c");
    }

    #[test]
    fn parses_recovery_actions() {
        assert_eq!(
            CallbackAction::parse("rec:f:@9"),
            Some(CallbackAction::RecoveryFresh { window_id: "@9".into() })
        );
        assert_eq!(
            CallbackAction::parse("rec:p:2"),
            Some(CallbackAction::RecoveryPick(2))
        );
        assert_eq!(CallbackAction::parse("rec:x"), Some(CallbackAction::RecoveryCancel));
    }

    #[test]
    fn parses_sessions_dashboard() {
        assert_eq!(CallbackAction::parse("sess:ref"), Some(CallbackAction::SessionsRefresh));
        assert_eq!(
            CallbackAction::parse("sess:kill:@4"),
            Some(CallbackAction::SessionsKill { window_id: "@4".into() })
        );
        assert_eq!(
            CallbackAction::parse("sess:killok:@4"),
            Some(CallbackAction::SessionsKillConfirm { window_id: "@4".into() })
        );
    }

    #[test]
    fn rejects_malformed_data() {
        assert_eq!(CallbackAction::parse(""), None);
        assert_eq!(CallbackAction::parse("unknown:xx"), None);
        assert_eq!(CallbackAction::parse("db:sel:notanum"), None);
        assert_eq!(CallbackAction::parse("aq:bogus:@1"), None);
        assert_eq!(CallbackAction::parse("hp:"), None);
    }
}
