//! Directory browser and window picker keyboards for unbound topics.

use std::path::Path;

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use termgram_tmux::TmuxWindow;

use crate::callback::encode;

/// Directories per browser page.
const PAGE_SIZE: usize = 8;

fn btn(label: &str, data: String) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label, encode(&data))
}

fn shorten(path: &str, max: usize) -> String {
    if path.chars().count() <= max {
        return path.to_string();
    }
    let tail: String = path
        .chars()
        .rev()
        .take(max.saturating_sub(1))
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    format!("…{tail}")
}

/// List immediate subdirectories, hidden ones excluded, sorted by name.
pub fn list_subdirs(path: &str) -> Vec<String> {
    let mut dirs: Vec<String> = std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|name| !name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

/// Build the directory browser message.
///
/// Returns (message text, keyboard, selectable entries). Entries are the
/// values behind the numbered `db:sel:` buttons: absolute paths jump
/// directly (favorites/MRU shortcuts), bare names descend from the current
/// path.
pub fn build_directory_browser(
    path: &str,
    page: usize,
    starred: &[String],
    mru: &[String],
) -> (String, InlineKeyboardMarkup, Vec<String>) {
    let mut entries: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();

    // Shortcut rows: starred first, then recents, deduped against starred.
    for fav in starred {
        let idx = entries.len();
        entries.push(fav.clone());
        rows.push(vec![btn(
            &format!("⭐ {}", shorten(fav, 40)),
            format!("db:sel:{idx}"),
        )]);
    }
    for recent in mru.iter().filter(|m| !starred.contains(m)) {
        let idx = entries.len();
        entries.push(recent.clone());
        rows.push(vec![btn(
            &format!("🕐 {}", shorten(recent, 40)),
            format!("db:sel:{idx}"),
        )]);
    }

    let subdirs = list_subdirs(path);
    let total_pages = subdirs.len().div_ceil(PAGE_SIZE).max(1);
    let page = page.min(total_pages - 1);
    let page_start = page * PAGE_SIZE;

    for name in subdirs.iter().skip(page_start).take(PAGE_SIZE) {
        let idx = entries.len();
        entries.push(name.clone());
        rows.push(vec![btn(
            &format!("📁 {}", shorten(name, 40)),
            format!("db:sel:{idx}"),
        )]);
    }

    if total_pages > 1 {
        let mut nav = Vec::new();
        if page > 0 {
            nav.push(btn("◀", format!("db:page:{}", page - 1)));
        }
        nav.push(InlineKeyboardButton::callback(
            format!("{}/{}", page + 1, total_pages),
            encode("noop"),
        ));
        if page + 1 < total_pages {
            nav.push(btn("▶", format!("db:page:{}", page + 1)));
        }
        rows.push(nav);
    }

    rows.push(vec![
        btn("⬆ Up", "db:up".to_string()),
        btn("⭐", "db:star".to_string()),
        btn("✅ Start here", "db:confirm".to_string()),
    ]);
    rows.push(vec![btn("✖ Cancel", "db:cancel".to_string())]);

    let text = format!(
        "📂 Pick a project directory:\n`{path}`\n\nTap ✅ to start a session here.",
    );
    (text, InlineKeyboardMarkup::new(rows), entries)
}

/// Resolve a browser selection against the current path: absolute entries
/// jump, names descend.
pub fn resolve_selection(current_path: &str, entry: &str) -> String {
    if entry.starts_with('/') {
        entry.to_string()
    } else {
        Path::new(current_path)
            .join(entry)
            .to_string_lossy()
            .into_owned()
    }
}

/// Build the window picker for unbound windows.
///
/// Returns (message text, keyboard, window ids behind the numbered buttons).
pub fn build_window_picker(
    unbound: &[TmuxWindow],
) -> (String, InlineKeyboardMarkup, Vec<String>) {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    let mut ids: Vec<String> = Vec::new();

    for (idx, window) in unbound.iter().enumerate() {
        ids.push(window.window_id.clone());
        let label = if window.cwd.is_empty() {
            window.window_name.clone()
        } else {
            format!("{} ({})", window.window_name, shorten(&window.cwd, 30))
        };
        rows.push(vec![btn(&label, format!("wb:sel:{idx}"))]);
    }
    rows.push(vec![
        btn("➕ New session", "wb:new".to_string()),
        btn("✖ Cancel", "wb:cancel".to_string()),
    ]);

    let text = format!(
        "🪟 {} unbound window(s) running.\nPick one to bind to this topic, or start a new session.",
        unbound.len()
    );
    (text, InlineKeyboardMarkup::new(rows), ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn window(id: &str, name: &str, cwd: &str) -> TmuxWindow {
        TmuxWindow {
            window_id: id.into(),
            window_name: name.into(),
            cwd: cwd.into(),
            pane_current_command: "claude".into(),
        }
    }

    #[test]
    fn lists_sorted_visible_subdirs() {
        let dir = TempDir::new().unwrap();
        for name in ["zeta", "alpha", ".hidden"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("a-file"), "x").unwrap();
        let dirs = list_subdirs(dir.path().to_str().unwrap());
        assert_eq!(dirs, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn browser_entries_cover_favorites_and_subdirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (text, _, entries) = build_directory_browser(
            dir.path().to_str().unwrap(),
            0,
            &["/starred/one".to_string()],
            &["/recent/two".to_string()],
        );
        assert!(text.contains(dir.path().to_str().unwrap()));
        assert_eq!(
            entries,
            vec![
                "/starred/one".to_string(),
                "/recent/two".to_string(),
                "sub".to_string()
            ]
        );
    }

    #[test]
    fn selection_resolution() {
        assert_eq!(resolve_selection("/home/u", "proj"), "/home/u/proj");
        assert_eq!(resolve_selection("/home/u", "/starred/x"), "/starred/x");
    }

    #[test]
    fn picker_lists_windows_and_ids() {
        let (text, kb, ids) = build_window_picker(&[
            window("@1", "api", "/code/api"),
            window("@2", "web", "/code/web"),
        ]);
        assert!(text.contains("2 unbound"));
        assert_eq!(ids, vec!["@1".to_string(), "@2".to_string()]);
        // window rows + action row
        assert_eq!(kb.inline_keyboard.len(), 3);
    }

    #[test]
    fn shorten_keeps_tail() {
        assert_eq!(shorten("/very/long/path/to/project", 10), "…o/project");
        assert_eq!(shorten("/short", 10), "/short");
    }
}
