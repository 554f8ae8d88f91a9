//! `TmuxManager` — window listing, pane capture, keystroke injection, and
//! window lifecycle for the bot's tmux session.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, TmuxError};

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Gap between literal text and the Enter key. The agent TUI treats an Enter
/// arriving in the same input batch as the text as a newline, not a submit.
const ENTER_GAP: Duration = Duration::from_millis(500);

/// Gap after a leading `!` so the TUI can switch into bash mode first.
const BANG_GAP: Duration = Duration::from_secs(1);

/// One window in the bot's tmux session.
#[derive(Debug, Clone, PartialEq)]
pub struct TmuxWindow {
    /// Opaque tmux id, e.g. `@12`. Stable for the window's lifetime.
    pub window_id: String,
    /// Mutable display name.
    pub window_name: String,
    /// Working directory of the active pane.
    pub cwd: String,
    /// Process running in the active pane.
    pub pane_current_command: String,
}

/// Result of `create_window`.
#[derive(Debug, Clone)]
pub struct CreatedWindow {
    pub window_id: String,
    pub window_name: String,
    /// Human-readable confirmation shown to the user.
    pub message: String,
}

/// Manages tmux windows for agent sessions.
#[derive(Debug, Clone)]
pub struct TmuxManager {
    session_name: String,
    /// Placeholder window kept so the session survives with zero agents;
    /// excluded from listings.
    main_window_name: String,
    /// Command launched in new windows (e.g. "claude").
    agent_command: String,
}

impl TmuxManager {
    pub fn new(session_name: &str, main_window_name: &str, agent_command: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            main_window_name: main_window_name.to_string(),
            agent_command: agent_command.to_string(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    async fn tmux(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "tmux");
        let output = tokio::time::timeout(
            TMUX_TIMEOUT,
            Command::new("tmux").args(args).output(),
        )
        .await
        .map_err(|_| TmuxError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TmuxError::Command(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Ensure the bot's tmux session exists, creating it (with the
    /// placeholder window) if needed.
    pub async fn get_or_create_session(&self) -> Result<()> {
        if self.tmux(&["has-session", "-t", &self.session_name]).await.is_ok() {
            return Ok(());
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
        self.tmux(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-n",
            &self.main_window_name,
            "-c",
            &home,
        ])
        .await?;
        info!(session = %self.session_name, "created tmux session");
        Ok(())
    }

    /// List all windows in the session (placeholder window excluded).
    pub async fn list_windows(&self) -> Result<Vec<TmuxWindow>> {
        let out = self
            .tmux(&[
                "list-windows",
                "-t",
                &self.session_name,
                "-F",
                "#{window_id}\t#{window_name}\t#{pane_current_path}\t#{pane_current_command}",
            ])
            .await;
        let out = match out {
            Ok(o) => o,
            Err(TmuxError::Command(msg)) if msg.contains("no server") || msg.contains("can't find")
            => {
                // Session not up yet: no windows rather than an error.
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(parse_window_list(&out, &self.main_window_name))
    }

    pub async fn find_window_by_id(&self, window_id: &str) -> Result<Option<TmuxWindow>> {
        let windows = self.list_windows().await?;
        Ok(windows.into_iter().find(|w| w.window_id == window_id))
    }

    pub async fn find_window_by_name(&self, window_name: &str) -> Result<Option<TmuxWindow>> {
        let windows = self.list_windows().await?;
        Ok(windows.into_iter().find(|w| w.window_name == window_name))
    }

    /// Capture the visible content of a window's active pane.
    ///
    /// `with_ansi` preserves SGR escapes for the screenshot path. Returns
    /// `None` on failure or empty content; capture failures are transient.
    pub async fn capture_pane(&self, window_id: &str, with_ansi: bool) -> Option<String> {
        let result = if with_ansi {
            self.tmux(&["capture-pane", "-e", "-p", "-t", window_id]).await
        } else {
            self.tmux(&["capture-pane", "-p", "-t", window_id]).await
        };
        match result {
            Ok(text) => {
                let text = text.trim_end().to_string();
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                warn!(window_id, error = %e, "capture-pane failed");
                None
            }
        }
    }

    async fn raw_send(&self, window_id: &str, chars: &str, literal: bool) -> bool {
        let result = if literal {
            self.tmux(&["send-keys", "-t", window_id, "-l", "--", chars]).await
        } else {
            self.tmux(&["send-keys", "-t", window_id, chars]).await
        };
        if let Err(e) = &result {
            warn!(window_id, error = %e, "send-keys failed");
        }
        result.is_ok()
    }

    /// Send keys to a window.
    ///
    /// `literal` sends the text verbatim; otherwise `text` is a named key
    /// (`Up`, `Down`, `Enter`, `Escape`, `C-c`, ...). With `literal` and
    /// `enter`, the text and the Enter key are sent in two batches with a
    /// short gap; a leading `!` goes out alone first so the TUI switches to
    /// bash mode before the rest arrives.
    pub async fn send_keys(
        &self,
        window_id: &str,
        text: &str,
        enter: bool,
        literal: bool,
    ) -> bool {
        if !(literal && enter) {
            return self.raw_send(window_id, text, literal).await;
        }

        if let Some(rest) = text.strip_prefix('!') {
            if !self.raw_send(window_id, "!", true).await {
                return false;
            }
            if !rest.is_empty() {
                tokio::time::sleep(BANG_GAP).await;
                if !self.raw_send(window_id, rest, true).await {
                    return false;
                }
            }
        } else if !self.raw_send(window_id, text, true).await {
            return false;
        }

        tokio::time::sleep(ENTER_GAP).await;
        self.raw_send(window_id, "Enter", false).await
    }

    pub async fn kill_window(&self, window_id: &str) -> bool {
        match self.tmux(&["kill-window", "-t", window_id]).await {
            Ok(_) => {
                info!(window_id, "killed window");
                true
            }
            Err(e) => {
                warn!(window_id, error = %e, "kill-window failed");
                false
            }
        }
    }

    /// Create a new window and launch the agent CLI in it.
    ///
    /// Colliding names get a `-2`, `-3`, ... suffix. `extra_args` is appended
    /// to the agent command (e.g. `--continue`, `--resume <id>`).
    pub async fn create_window(
        &self,
        work_dir: &str,
        window_name: Option<&str>,
        start_agent: bool,
        extra_args: &str,
    ) -> Result<CreatedWindow> {
        let path = Path::new(work_dir);
        if !path.exists() {
            return Err(TmuxError::BadDirectory(work_dir.to_string()));
        }
        if !path.is_dir() {
            return Err(TmuxError::NotADirectory(work_dir.to_string()));
        }

        let base_name = window_name
            .map(str::to_string)
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "session".to_string());

        let mut final_name = base_name.clone();
        let mut counter = 2;
        while self.find_window_by_name(&final_name).await?.is_some() {
            final_name = format!("{base_name}-{counter}");
            counter += 1;
        }

        self.get_or_create_session().await?;

        let target = format!("{}:", self.session_name);
        let window_id = self
            .tmux(&[
                "new-window",
                "-t",
                &target,
                "-n",
                &final_name,
                "-c",
                work_dir,
                "-P",
                "-F",
                "#{window_id}",
            ])
            .await?
            .trim()
            .to_string();

        if start_agent {
            let cmd = if extra_args.is_empty() {
                self.agent_command.clone()
            } else {
                format!("{} {}", self.agent_command, extra_args)
            };
            self.raw_send(&window_id, &cmd, true).await;
            self.raw_send(&window_id, "Enter", false).await;
        }

        info!(name = %final_name, id = %window_id, dir = %work_dir, "created window");
        Ok(CreatedWindow {
            window_id,
            window_name: final_name.clone(),
            message: format!("Created window '{final_name}' at {work_dir}"),
        })
    }
}

fn parse_window_list(output: &str, main_window_name: &str) -> Vec<TmuxWindow> {
    let mut windows = Vec::new();
    for line in output.lines() {
        let mut fields = line.splitn(4, '\t');
        let window_id = fields.next().unwrap_or("").to_string();
        let window_name = fields.next().unwrap_or("").to_string();
        let cwd = fields.next().unwrap_or("").to_string();
        let pane_current_command = fields.next().unwrap_or("").to_string();
        if window_id.is_empty() || window_name == main_window_name {
            continue;
        }
        windows.push(TmuxWindow {
            window_id,
            window_name,
            cwd,
            pane_current_command,
        });
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_window_list_skips_placeholder() {
        let out = "@0\t__main__\t/home/u\tbash\n@3\tproj\t/home/u/proj\tclaude\n";
        let windows = parse_window_list(out, "__main__");
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].window_id, "@3");
        assert_eq!(windows[0].window_name, "proj");
        assert_eq!(windows[0].cwd, "/home/u/proj");
        assert_eq!(windows[0].pane_current_command, "claude");
    }

    #[test]
    fn parse_window_list_handles_missing_fields() {
        let out = "@1\tw\n";
        let windows = parse_window_list(out, "__main__");
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].cwd, "");
    }

    #[test]
    fn parse_window_list_empty_output() {
        assert!(parse_window_list("", "__main__").is_empty());
    }
}
