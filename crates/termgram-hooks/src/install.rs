//! Hook (un)installation into the agent CLI's settings.json.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

use crate::Result;

/// Substring marker identifying our hook in command strings. Matches the
/// bare command, full paths, and shell-wrapped variants.
const HOOK_COMMAND_MARKER: &str = "termgram hook";

/// Default location of the agent CLI's settings file.
pub fn default_settings_file() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".claude").join("settings.json")
}

fn is_hook_installed(settings: &Value) -> bool {
    let Some(entries) = settings
        .get("hooks")
        .and_then(|h| h.get("SessionStart"))
        .and_then(Value::as_array)
    else {
        return false;
    };
    entries.iter().any(|entry| {
        entry
            .get("hooks")
            .and_then(Value::as_array)
            .is_some_and(|hooks| {
                hooks.iter().any(|h| {
                    h.get("command")
                        .and_then(Value::as_str)
                        .is_some_and(|cmd| cmd.contains(HOOK_COMMAND_MARKER))
                })
            })
    })
}

fn read_settings(settings_file: &Path) -> Result<Value> {
    match std::fs::read_to_string(settings_file) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(_) => Ok(json!({})),
    }
}

fn write_settings(settings_file: &Path, settings: &Value) -> Result<()> {
    if let Some(parent) = settings_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = format!("{}\n", serde_json::to_string_pretty(settings)?);
    std::fs::write(settings_file, content)?;
    Ok(())
}

/// Install the SessionStart hook. Returns a message for the operator.
pub fn install_hook(settings_file: &Path) -> Result<String> {
    let mut settings = read_settings(settings_file)?;
    if is_hook_installed(&settings) {
        return Ok(format!(
            "Hook already installed in {}",
            settings_file.display()
        ));
    }

    let hook_config = json!({
        "type": "command",
        "command": HOOK_COMMAND_MARKER,
        "timeout": 5,
    });

    let root = settings
        .as_object_mut()
        .ok_or_else(|| crate::HookError::Lock("settings.json is not an object".to_string()))?;
    let session_start = root
        .entry("hooks")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| crate::HookError::Lock("hooks is not an object".to_string()))?
        .entry("SessionStart")
        .or_insert_with(|| json!([]));

    // Prefer an existing matcher group; create one otherwise.
    let appended = session_start
        .as_array_mut()
        .and_then(|arr| arr.first_mut())
        .and_then(|first| first.get_mut("hooks"))
        .and_then(Value::as_array_mut)
        .map(|hooks| hooks.push(hook_config.clone()))
        .is_some();
    if !appended {
        if let Some(arr) = session_start.as_array_mut() {
            arr.push(json!({"hooks": [hook_config]}));
        }
    }

    write_settings(settings_file, &settings)?;
    info!(path = %settings_file.display(), "hook installed");
    Ok(format!(
        "Hook installed successfully in {}",
        settings_file.display()
    ))
}

/// Remove all of our hook entries. Returns a message for the operator.
pub fn uninstall_hook(settings_file: &Path) -> Result<String> {
    if !settings_file.exists() {
        return Ok("No settings.json found — nothing to uninstall.".to_string());
    }
    let mut settings = read_settings(settings_file)?;
    if !is_hook_installed(&settings) {
        return Ok("Hook not installed — nothing to uninstall.".to_string());
    }

    if let Some(session_start) = settings
        .get_mut("hooks")
        .and_then(|h| h.get_mut("SessionStart"))
        .and_then(Value::as_array_mut)
    {
        for entry in session_start.iter_mut() {
            if let Some(hooks) = entry.get_mut("hooks").and_then(Value::as_array_mut) {
                hooks.retain(|h| {
                    !h.get("command")
                        .and_then(Value::as_str)
                        .is_some_and(|cmd| cmd.contains(HOOK_COMMAND_MARKER))
                });
            }
        }
        session_start.retain(|entry| {
            entry
                .get("hooks")
                .and_then(Value::as_array)
                .is_none_or(|hooks| !hooks.is_empty())
        });
    }

    write_settings(settings_file, &settings)?;
    Ok(format!("Hook uninstalled from {}", settings_file.display()))
}

/// Report installation status. Returns (installed, message).
pub fn hook_status(settings_file: &Path) -> (bool, String) {
    if !settings_file.exists() {
        return (
            false,
            format!("Not installed ({} does not exist)", settings_file.display()),
        );
    }
    let Ok(settings) = read_settings(settings_file) else {
        return (false, "Error reading settings".to_string());
    };
    if !is_hook_installed(&settings) {
        return (false, "Not installed".to_string());
    }

    let command = settings
        .get("hooks")
        .and_then(|h| h.get("SessionStart"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("hooks").and_then(Value::as_array))
        .flatten()
        .filter_map(|h| h.get("command").and_then(Value::as_str))
        .find(|cmd| cmd.contains(HOOK_COMMAND_MARKER));

    match command {
        Some(cmd) => (true, format!("Installed: {cmd}")),
        None => (true, "Installed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn install_into_empty_settings() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.json");
        let msg = install_hook(&file).unwrap();
        assert!(msg.contains("installed successfully"));

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert!(is_hook_installed(&settings));

        let (installed, status) = hook_status(&file);
        assert!(installed);
        assert!(status.contains(HOOK_COMMAND_MARKER));
    }

    #[test]
    fn install_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.json");
        install_hook(&file).unwrap();
        let msg = install_hook(&file).unwrap();
        assert!(msg.contains("already installed"));

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        let count = settings["hooks"]["SessionStart"]
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|e| e["hooks"].as_array().unwrap())
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn install_joins_existing_matcher_group() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            json!({
                "hooks": {"SessionStart": [
                    {"hooks": [{"type": "command", "command": "other-tool sync"}]}
                ]}
            })
            .to_string(),
        )
        .unwrap();
        install_hook(&file).unwrap();

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        let groups = settings["hooks"]["SessionStart"].as_array().unwrap();
        assert_eq!(groups.len(), 1, "must join the existing group");
        assert_eq!(groups[0]["hooks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn uninstall_removes_only_our_hook() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            json!({
                "hooks": {"SessionStart": [
                    {"hooks": [
                        {"type": "command", "command": "other-tool sync"},
                        {"type": "command", "command": "/usr/bin/termgram hook 2>/dev/null"}
                    ]}
                ]}
            })
            .to_string(),
        )
        .unwrap();
        uninstall_hook(&file).unwrap();

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert!(!is_hook_installed(&settings));
        let groups = settings["hooks"]["SessionStart"].as_array().unwrap();
        assert_eq!(groups[0]["hooks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn uninstall_without_settings_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let msg = uninstall_hook(&dir.path().join("settings.json")).unwrap();
        assert!(msg.contains("nothing to uninstall"));
    }

    #[test]
    fn status_without_settings() {
        let dir = TempDir::new().unwrap();
        let (installed, _) = hook_status(&dir.path().join("settings.json"));
        assert!(!installed);
    }
}
