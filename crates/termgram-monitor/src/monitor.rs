//! The monitor polling loop.
//!
//! Each cycle: ingest the session map, diff it against the previous cycle
//! (cleaning up replaced/removed sessions and surfacing new windows), then
//! read new transcript bytes for every current session and emit message
//! events. Nothing in the loop body may escape as an error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use termgram_sessions::{SessionStore, WindowDetails};
use termgram_tmux::TmuxManager;
use termgram_transcript::{parse_entries, parse_line, ContentType, ImageAttachment, PendingTool, Role};

use crate::scan::{self, SessionFile};
use crate::state::{MonitorState, TrackedSession};

/// A new message detected in a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub session_id: String,
    pub text: String,
    pub content_type: ContentType,
    pub tool_use_id: Option<String>,
    pub role: Role,
    pub tool_name: Option<String>,
    pub image_data: Option<Vec<ImageAttachment>>,
}

/// A window newly observed in the session map (or live in tmux with no map
/// entry yet — then `session_id` is empty).
#[derive(Debug, Clone, PartialEq)]
pub struct NewWindowEvent {
    pub window_id: String,
    pub session_id: String,
    pub window_name: String,
    pub cwd: String,
}

#[derive(Debug)]
pub enum MonitorEvent {
    Message(NewMessage),
    NewWindow(NewWindowEvent),
}

/// Watches agent sessions for new transcript entries.
pub struct SessionMonitor {
    store: SessionStore,
    tmux: TmuxManager,
    poll_interval: Duration,
    state: MonitorState,
    /// Per-session pending tool_use state carried across poll cycles.
    pending_tools: HashMap<String, HashMap<String, PendingTool>>,
    /// Session map as of the previous cycle, for change detection. Keys may
    /// be window ids or (old format) window names during an upgrade.
    last_session_map: BTreeMap<String, WindowDetails>,
    /// mtime cache for cheap unchanged-file skips. Not persisted.
    file_mtimes: HashMap<String, SystemTime>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl SessionMonitor {
    pub fn new(
        store: SessionStore,
        tmux: TmuxManager,
        poll_interval: Duration,
        state_file: PathBuf,
        events_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        let mut state = MonitorState::new(state_file);
        state.load();
        Self {
            store,
            tmux,
            poll_interval,
            state,
            pending_tools: HashMap::new(),
            last_session_map: BTreeMap::new(),
            file_mtimes: HashMap::new(),
            events_tx,
        }
    }

    /// Main loop. Polls until `shutdown` flips to true, then saves state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.poll_interval, "session monitor started");

        self.cleanup_stale_on_startup();
        self.last_session_map = self.store.read_session_map();

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.save();
        info!("session monitor stopped");
    }

    async fn cycle(&mut self) {
        // 1. Ingest hook-written session map updates into the store.
        self.store.load_session_map();

        // 2. Diff against the last cycle; clean up and surface new windows.
        let (current_map, new_windows) = self.detect_and_cleanup_changes();
        for event in new_windows {
            self.emit(MonitorEvent::NewWindow(event)).await;
        }

        // 3. Windows alive in tmux but absent from the session map (the CLI
        //    has not written its entry yet) also surface as new windows.
        match self.tmux.list_windows().await {
            Ok(windows) => {
                let live_ids: HashSet<String> =
                    windows.iter().map(|w| w.window_id.clone()).collect();
                self.store.prune_session_map(&live_ids);

                let bound: HashSet<String> = self
                    .store
                    .iter_thread_bindings()
                    .into_iter()
                    .map(|(_, _, wid)| wid)
                    .collect();
                for w in &windows {
                    if current_map.contains_key(&w.window_id) || bound.contains(&w.window_id) {
                        continue;
                    }
                    self.emit(MonitorEvent::NewWindow(NewWindowEvent {
                        window_id: w.window_id.clone(),
                        session_id: String::new(),
                        window_name: w.window_name.clone(),
                        cwd: w.cwd.clone(),
                    }))
                    .await;
                }
            }
            Err(e) => debug!(error = %e, "list_windows failed"),
        }

        // 4. Read new transcript bytes and emit messages.
        let messages = self.check_for_updates(&current_map).await;
        for msg in messages {
            self.emit(MonitorEvent::Message(msg)).await;
        }

        self.state.save_if_dirty();
    }

    async fn emit(&self, event: MonitorEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("monitor event receiver dropped");
        }
    }

    /// Remove tracked sessions that no longer appear in the session map.
    fn cleanup_stale_on_startup(&mut self) {
        let current = self.store.read_session_map();
        let active_sids: HashSet<&str> =
            current.values().map(|d| d.session_id.as_str()).collect();
        let stale: Vec<String> = self
            .state
            .session_ids()
            .into_iter()
            .filter(|sid| !active_sids.contains(sid.as_str()))
            .collect();
        if !stale.is_empty() {
            info!(count = stale.len(), "removing stale sessions at startup");
            for sid in stale {
                self.state.remove(&sid);
                self.file_mtimes.remove(&sid);
                self.pending_tools.remove(&sid);
            }
            self.state.save_if_dirty();
        }
    }

    /// Diff the session map against the previous cycle.
    ///
    /// A window whose session_id changed (clear/resume) or that disappeared
    /// drops its old session from tracking; windows appearing for the first
    /// time yield `NewWindowEvent`s.
    pub fn detect_and_cleanup_changes(
        &mut self,
    ) -> (BTreeMap<String, WindowDetails>, Vec<NewWindowEvent>) {
        let current = self.store.read_session_map();

        let mut sessions_to_remove: HashSet<String> = HashSet::new();
        for (window_key, old) in &self.last_session_map {
            match current.get(window_key) {
                Some(new) if new.session_id != old.session_id => {
                    info!(
                        window = %window_key,
                        old_sid = %old.session_id,
                        new_sid = %new.session_id,
                        "window session changed"
                    );
                    sessions_to_remove.insert(old.session_id.clone());
                }
                None => {
                    info!(window = %window_key, sid = %old.session_id, "window removed");
                    sessions_to_remove.insert(old.session_id.clone());
                }
                _ => {}
            }
        }
        if !sessions_to_remove.is_empty() {
            for sid in &sessions_to_remove {
                self.state.remove(sid);
                self.file_mtimes.remove(sid);
                self.pending_tools.remove(sid);
            }
            self.state.save_if_dirty();
        }

        let mut new_windows = Vec::new();
        for (window_key, details) in &current {
            if !self.last_session_map.contains_key(window_key) {
                new_windows.push(NewWindowEvent {
                    window_id: window_key.clone(),
                    session_id: details.session_id.clone(),
                    window_name: details.window_name.clone(),
                    cwd: details.cwd.clone(),
                });
            }
        }

        self.last_session_map = current.clone();
        (current, new_windows)
    }

    /// Check all current sessions for new transcript entries.
    ///
    /// Primary path: entries carrying a `transcript_path` read directly.
    /// Fallback: remaining sessions are located by scanning the projects
    /// tree against active window cwds.
    pub async fn check_for_updates(
        &mut self,
        current_map: &BTreeMap<String, WindowDetails>,
    ) -> Vec<NewMessage> {
        let mut messages = Vec::new();

        let mut direct: Vec<(String, PathBuf)> = Vec::new();
        let mut fallback_sids: HashSet<String> = HashSet::new();
        for details in current_map.values() {
            if !details.transcript_path.is_empty() {
                let path = PathBuf::from(&details.transcript_path);
                if path.exists() {
                    direct.push((details.session_id.clone(), path));
                    continue;
                }
            }
            fallback_sids.insert(details.session_id.clone());
        }

        for (session_id, path) in direct {
            self.process_session_file(&session_id, &path, &mut messages)
                .await;
        }

        if !fallback_sids.is_empty() {
            for found in self.scan_fallback().await {
                if fallback_sids.contains(&found.session_id) {
                    let SessionFile {
                        session_id,
                        file_path,
                    } = found;
                    self.process_session_file(&session_id, &file_path, &mut messages)
                        .await;
                }
            }
        }

        self.state.save_if_dirty();
        messages
    }

    async fn scan_fallback(&self) -> Vec<SessionFile> {
        let windows = match self.tmux.list_windows().await {
            Ok(w) => w,
            Err(_) => return Vec::new(),
        };
        let active_cwds: HashSet<String> = windows
            .iter()
            .map(|w| {
                std::fs::canonicalize(&w.cwd)
                    .ok()
                    .and_then(|p| p.to_str().map(str::to_string))
                    .unwrap_or_else(|| w.cwd.clone())
            })
            .collect();
        if active_cwds.is_empty() {
            return Vec::new();
        }
        let projects = self.store.projects_path();
        tokio::task::spawn_blocking(move || scan::scan_projects(&projects, &active_cwds))
            .await
            .unwrap_or_default()
    }

    async fn process_session_file(
        &mut self,
        session_id: &str,
        path: &Path,
        messages: &mut Vec<NewMessage>,
    ) {
        let mut tracked = match self.state.get(session_id) {
            Some(t) => t.clone(),
            None => {
                // New session: start at EOF so history is not replayed.
                let (size, mtime) = match std::fs::metadata(path) {
                    Ok(m) => (m.len(), m.modified().ok()),
                    Err(_) => (0, None),
                };
                let tracked = TrackedSession {
                    session_id: session_id.to_string(),
                    file_path: path.to_string_lossy().into_owned(),
                    last_byte_offset: size,
                };
                self.state.update(tracked);
                if let Some(mtime) = mtime {
                    self.file_mtimes.insert(session_id.to_string(), mtime);
                }
                debug!(session_id, "started tracking session");
                return;
            }
        };

        // mtime gate: skip files that have not advanced.
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        let current_mtime = match meta.modified() {
            Ok(m) => m,
            Err(_) => SystemTime::UNIX_EPOCH,
        };
        if let Some(last) = self.file_mtimes.get(session_id) {
            if current_mtime <= *last {
                return;
            }
        }

        let entries = match read_new_lines(&mut tracked, path).await {
            Ok(e) => e,
            Err(e) => {
                warn!(session_id, error = %e, "error reading session file");
                return;
            }
        };
        self.file_mtimes
            .insert(session_id.to_string(), current_mtime);

        if !entries.is_empty() {
            debug!(session_id, count = entries.len(), "read new entries");
        }

        let carry = self
            .pending_tools
            .remove(session_id)
            .unwrap_or_default();
        let (records, remaining) = parse_entries(&entries, Some(carry));
        if !remaining.is_empty() {
            self.pending_tools
                .insert(session_id.to_string(), remaining);
        }

        for record in records {
            if record.text.is_empty() && record.image_data.is_none() {
                continue;
            }
            messages.push(NewMessage {
                session_id: session_id.to_string(),
                text: record.text,
                content_type: record.content_type,
                tool_use_id: record.tool_use_id,
                role: record.role,
                tool_name: record.tool_name,
                image_data: record.image_data,
            });
        }

        self.state.update(tracked);
    }
}

/// Read new complete lines from `tracked.last_byte_offset`, advancing the
/// offset only past fully parsed lines. A non-empty line that fails to parse
/// is a torn write: stop there and retry next cycle. Truncation (offset
/// beyond EOF, e.g. after `/clear`) resets the offset to zero.
async fn read_new_lines(
    tracked: &mut TrackedSession,
    path: &Path,
) -> std::io::Result<Vec<serde_json::Value>> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();

    if tracked.last_byte_offset > file_size {
        info!(
            session_id = %tracked.session_id,
            offset = tracked.last_byte_offset,
            size = file_size,
            "file truncated, resetting offset"
        );
        tracked.last_byte_offset = 0;
    }

    file.seek(std::io::SeekFrom::Start(tracked.last_byte_offset))
        .await?;
    let mut buf = Vec::with_capacity((file_size - tracked.last_byte_offset) as usize);
    file.read_to_end(&mut buf).await?;

    let mut entries = Vec::new();
    let mut safe_offset = tracked.last_byte_offset;
    let mut pos = 0usize;
    while pos < buf.len() {
        let (line_end, consumed) = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => (pos + i, i + 1),
            None => (buf.len(), buf.len() - pos),
        };
        let line = String::from_utf8_lossy(&buf[pos..line_end]);
        if let Some(entry) = parse_line(&line) {
            entries.push(entry);
            safe_offset = tracked.last_byte_offset + (pos + consumed) as u64;
        } else if !line.trim().is_empty() {
            warn!(
                session_id = %tracked.session_id,
                "partial transcript line, will retry next cycle"
            );
            break;
        } else {
            safe_offset = tracked.last_byte_offset + (pos + consumed) as u64;
        }
        pos += consumed;
    }

    tracked.last_byte_offset = safe_offset;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (SessionMonitor, mpsc::Receiver<MonitorEvent>) {
        let store = SessionStore::load(
            &dir.path().join("state.json"),
            &dir.path().join("session_map.json"),
            "termgram",
            &dir.path().join("projects"),
        );
        let tmux = TmuxManager::new("termgram-test-none", "__main__", "claude");
        let (tx, rx) = mpsc::channel(64);
        let monitor = SessionMonitor::new(
            store,
            tmux,
            Duration::from_secs(2),
            dir.path().join("monitor_state.json"),
            tx,
        );
        (monitor, rx)
    }

    fn write_map(dir: &TempDir, entries: &[(&str, &str, &str)]) {
        let mut map = serde_json::Map::new();
        for (wid, sid, transcript) in entries {
            map.insert(
                format!("termgram:{wid}"),
                serde_json::json!({
                    "session_id": sid,
                    "cwd": "/tmp",
                    "window_name": "proj",
                    "transcript_path": transcript,
                }),
            );
        }
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&serde_json::Value::Object(map)).unwrap(),
        )
        .unwrap();
    }

    fn append(path: &Path, line: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(f, "{line}").unwrap();
        // Nudge mtime forward: coarse-grained filesystems would otherwise
        // report the same timestamp for quick successive appends.
        let now = std::time::SystemTime::now() + Duration::from_millis(10);
        f.set_modified(now).unwrap();
    }

    #[tokio::test]
    async fn new_session_initializes_at_eof_without_backfill() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("s1.jsonl");
        append(
            &transcript,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"old"}]}}"#,
        );
        write_map(&dir, &[("@1", "s1", transcript.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, _) = monitor.detect_and_cleanup_changes();
        let messages = monitor.check_for_updates(&map).await;
        assert!(messages.is_empty(), "history must not be replayed");

        // A later append is picked up.
        append(
            &transcript,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"fresh"}]}}"#,
        );
        let messages = monitor.check_for_updates(&map).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "fresh");
    }

    #[tokio::test]
    async fn tool_pairing_across_cycles() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("s1.jsonl");
        append(&transcript, r#"{"type":"summary"}"#);
        write_map(&dir, &[("@1", "s1", transcript.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, _) = monitor.detect_and_cleanup_changes();
        monitor.check_for_updates(&map).await; // start tracking at EOF

        append(
            &transcript,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"T1","name":"Read","input":{"file_path":"a.py"}}]}}"#,
        );
        let cycle_n = monitor.check_for_updates(&map).await;
        assert_eq!(cycle_n.len(), 1);
        assert_eq!(cycle_n[0].text, "**Read**(a.py)");
        assert_eq!(cycle_n[0].tool_use_id.as_deref(), Some("T1"));
        assert!(monitor.pending_tools.get("s1").is_some_and(|p| p.contains_key("T1")));

        append(
            &transcript,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"T1","content":"x\ny\nz"}]}}"#,
        );
        let cycle_n1 = monitor.check_for_updates(&map).await;
        assert_eq!(cycle_n1.len(), 1);
        assert!(
            cycle_n1[0].text.starts_with("**Read**(a.py)\n  ⎿  Read 3 lines"),
            "text: {}",
            cycle_n1[0].text
        );
        assert!(monitor.pending_tools.get("s1").is_none());
    }

    #[tokio::test]
    async fn torn_write_defers_offset() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("s1.jsonl");
        append(&transcript, r#"{"type":"summary"}"#);
        write_map(&dir, &[("@1", "s1", transcript.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, _) = monitor.detect_and_cleanup_changes();
        monitor.check_for_updates(&map).await;

        // Half a JSON line, no trailing newline.
        let torn = r#"{"type":"assistant","message":{"content":[{"type":"text","te"#;
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&transcript)
                .unwrap();
            write!(f, "{torn}").unwrap();
            f.set_modified(std::time::SystemTime::now() + Duration::from_millis(10))
                .unwrap();
        }
        let offset_before = monitor.state.get("s1").unwrap().last_byte_offset;
        let messages = monitor.check_for_updates(&map).await;
        assert!(messages.is_empty());
        assert_eq!(
            monitor.state.get("s1").unwrap().last_byte_offset,
            offset_before,
            "offset must not advance past a torn line"
        );

        // Complete the line next cycle.
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&transcript)
                .unwrap();
            writeln!(f, r#"xt":"done"}}]}}}}"#).unwrap();
            f.set_modified(std::time::SystemTime::now() + Duration::from_millis(20))
                .unwrap();
        }
        let messages = monitor.check_for_updates(&map).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "done");
    }

    #[tokio::test]
    async fn truncation_resets_offset() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("s1.jsonl");
        append(&transcript, &format!("{{\"pad\":\"{}\"}}", "x".repeat(500)));
        write_map(&dir, &[("@1", "s1", transcript.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, _) = monitor.detect_and_cleanup_changes();
        monitor.check_for_updates(&map).await;

        // Truncate and write a short new transcript.
        std::fs::write(&transcript, "").unwrap();
        append(
            &transcript,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"post-clear"}]}}"#,
        );
        let messages = monitor.check_for_updates(&map).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "post-clear");
    }

    #[tokio::test]
    async fn session_change_drops_old_tracking() {
        let dir = TempDir::new().unwrap();
        let t1 = dir.path().join("s1.jsonl");
        append(&t1, r#"{"type":"summary"}"#);
        write_map(&dir, &[("@1", "s1", t1.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, new1) = monitor.detect_and_cleanup_changes();
        assert_eq!(new1.len(), 1);
        assert_eq!(new1[0].window_id, "@1");
        monitor.check_for_updates(&map).await;
        assert!(monitor.state.get("s1").is_some());

        // Same window, new session id (e.g. /clear).
        let t2 = dir.path().join("s2.jsonl");
        append(&t2, r#"{"type":"summary"}"#);
        write_map(&dir, &[("@1", "s2", t2.to_str().unwrap())]);
        let (_, new2) = monitor.detect_and_cleanup_changes();
        assert!(new2.is_empty(), "same window is not a new window");
        assert!(monitor.state.get("s1").is_none(), "old session dropped");
    }

    #[tokio::test]
    async fn deleted_window_drops_session() {
        let dir = TempDir::new().unwrap();
        let t1 = dir.path().join("s1.jsonl");
        append(&t1, r#"{"type":"summary"}"#);
        write_map(&dir, &[("@1", "s1", t1.to_str().unwrap())]);

        let (mut monitor, _rx) = fixture(&dir);
        let (map, _) = monitor.detect_and_cleanup_changes();
        monitor.check_for_updates(&map).await;

        write_map(&dir, &[]);
        monitor.detect_and_cleanup_changes();
        assert!(monitor.state.get("s1").is_none());
    }
}
