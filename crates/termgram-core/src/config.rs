use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (termgram.toml + TERMGRAM_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermgramConfig {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub autoclose: AutocloseConfig,
    /// Base directory for state files (default: ~/.termgram).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Telegram user IDs allowed to talk to the bot (deny-by-default).
    pub allowed_users: Vec<i64>,
    /// Group chat used for auto-created topics when no binding exists yet.
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxConfig {
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Placeholder window kept in the session; excluded from listings.
    #[serde(default = "default_main_window_name")]
    pub main_window_name: String,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            main_window_name: default_main_window_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command launched in new windows (e.g. "claude").
    #[serde(default = "default_agent_command")]
    pub command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Auto-close timers for topics. 0 disables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutocloseConfig {
    /// Minutes of idle (shell prompt, no status line) before closing a topic.
    #[serde(default)]
    pub idle_minutes: u64,
    /// Minutes after a window dies before closing its topic.
    #[serde(default)]
    pub dead_minutes: u64,
}

fn default_session_name() -> String {
    "termgram".to_string()
}
fn default_main_window_name() -> String {
    "__main__".to_string()
}
fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_poll_interval() -> f64 {
    2.0
}
fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.termgram")
}

impl TermgramConfig {
    /// Load config from a TOML file with TERMGRAM_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. TERMGRAM_CONFIG env var
    ///   3. ~/.termgram/termgram.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TERMGRAM_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: TermgramConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TERMGRAM_").split("_"))
            .extract()
            .map_err(|e| crate::error::TermgramError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs the bot cannot start with. The messages are shown to
    /// the operator verbatim, so they name the field and the fix.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(crate::error::TermgramError::Config(
                "telegram.bot_token is required (set TERMGRAM_TELEGRAM_BOT_TOKEN)".into(),
            ));
        }
        if self.telegram.allowed_users.is_empty() {
            return Err(crate::error::TermgramError::Config(
                "telegram.allowed_users must list at least one Telegram user ID".into(),
            ));
        }
        Ok(())
    }

    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.telegram.allowed_users.contains(&user_id)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn monitor_state_file(&self) -> PathBuf {
        self.data_dir().join("monitor_state.json")
    }

    pub fn session_map_file(&self) -> PathBuf {
        self.data_dir().join("session_map.json")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir().join("images")
    }

    /// Root of the CLI's per-project transcript tree (~/.claude/projects).
    pub fn projects_path(&self) -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".claude").join("projects")
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.termgram/termgram.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TermgramConfig {
        TermgramConfig {
            telegram: TelegramConfig {
                bot_token: "123:abc".into(),
                allowed_users: vec![42],
                group_id: None,
            },
            tmux: TmuxConfig::default(),
            agent: AgentConfig::default(),
            monitor: MonitorConfig::default(),
            autoclose: AutocloseConfig::default(),
            data_dir: "/tmp/termgram-test".into(),
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_token() {
        let mut c = minimal();
        c.telegram.bot_token.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_allowlist() {
        let mut c = minimal();
        c.telegram.allowed_users.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn allowlist_check() {
        let c = minimal();
        assert!(c.is_user_allowed(42));
        assert!(!c.is_user_allowed(43));
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let c = minimal();
        assert_eq!(c.state_file(), PathBuf::from("/tmp/termgram-test/state.json"));
        assert_eq!(
            c.session_map_file(),
            PathBuf::from("/tmp/termgram-test/session_map.json")
        );
    }
}
