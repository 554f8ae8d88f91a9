//! `SessionStore` — the persisted state hub.
//!
//! All maps live in memory; any mutation marks the store dirty and schedules
//! a debounced save (500 ms, reset by fresh mutations). Writes go through the
//! atomic tmp-fsync-rename pattern. Call `flush()` on shutdown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use termgram_core::fsutil::atomic_write_json;
use termgram_core::types::{is_window_id, NotificationMode};
use termgram_tmux::TmuxWindow;

use crate::map::{parse_session_map, WindowDetails};

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Persistent per-window state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Associated agent session ID (empty until the hook fires).
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_name: String,
    /// Direct transcript path from the hook payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transcript_path: String,
    #[serde(default, skip_serializing_if = "is_default_mode")]
    pub notification_mode: NotificationMode,
}

fn is_default_mode(mode: &NotificationMode) -> bool {
    *mode == NotificationMode::All
}

/// Per-user directory favorites for the directory browser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirFavorites {
    #[serde(default)]
    pub starred: Vec<String>,
    #[serde(default)]
    pub mru: Vec<String>,
}

const MRU_CAP: usize = 5;

/// On-disk shape of the state file. Integer user/thread keys serialize as
/// strings (serde_json map-key rule), matching the documented format.
/// BTreeMaps keep serialization order stable so persist→load→persist is
/// byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    window_states: BTreeMap<String, WindowState>,
    #[serde(default)]
    user_window_offsets: BTreeMap<i64, BTreeMap<String, u64>>,
    #[serde(default)]
    thread_bindings: BTreeMap<i64, BTreeMap<i32, String>>,
    #[serde(default)]
    group_chat_ids: BTreeMap<String, i64>,
    #[serde(default)]
    window_display_names: BTreeMap<String, String>,
    #[serde(default)]
    user_dir_favorites: BTreeMap<i64, DirFavorites>,
}

struct StoreState {
    data: StoreData,
    /// Reverse index for O(1) inbound lookups; rebuilt on load, maintained on
    /// bind/unbind. Never persisted.
    window_to_thread: HashMap<(i64, String), i32>,
    dirty: bool,
    needs_migration: bool,
}

struct StoreShared {
    state_file: PathBuf,
    session_map_file: PathBuf,
    tmux_session_name: String,
    projects_path: PathBuf,
    state: Mutex<StoreState>,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the shared store. Cheap to clone; all clones see one state.
#[derive(Clone)]
pub struct SessionStore {
    shared: Arc<StoreShared>,
}

impl SessionStore {
    /// Load state from `state_file` (missing file starts empty; a corrupt
    /// file is logged, zeroed, and overwritten by the next save).
    pub fn load(
        state_file: &Path,
        session_map_file: &Path,
        tmux_session_name: &str,
        projects_path: &Path,
    ) -> Self {
        let (data, needs_migration) = match std::fs::read_to_string(state_file) {
            Ok(content) => match serde_json::from_str::<StoreData>(&content) {
                Ok(data) => {
                    let migrate = detect_old_format(&data);
                    if migrate {
                        info!("detected old-format state (window_name keys), will re-resolve");
                    }
                    (data, migrate)
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse state file, starting empty");
                    (StoreData::default(), false)
                }
            },
            Err(_) => (StoreData::default(), false),
        };

        let window_to_thread = build_reverse_index(&data);
        Self {
            shared: Arc::new(StoreShared {
                state_file: state_file.to_path_buf(),
                session_map_file: session_map_file.to_path_buf(),
                tmux_session_name: tmux_session_name.to_string(),
                projects_path: projects_path.to_path_buf(),
                state: Mutex::new(StoreState {
                    data,
                    window_to_thread,
                    dirty: false,
                    needs_migration,
                }),
                save_task: Mutex::new(None),
            }),
        }
    }

    pub fn projects_path(&self) -> PathBuf {
        self.shared.projects_path.clone()
    }

    pub fn session_map_file(&self) -> PathBuf {
        self.shared.session_map_file.clone()
    }

    pub fn tmux_session_name(&self) -> String {
        self.shared.tmux_session_name.clone()
    }

    pub fn needs_migration(&self) -> bool {
        self.lock().needs_migration
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.shared.state.lock().unwrap()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Mark dirty and (re)schedule the debounced save.
    fn schedule_save(&self) {
        self.lock().dirty = true;

        let mut slot = self.shared.save_task.lock().unwrap();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let store = self.clone();
                *slot = Some(rt.spawn(async move {
                    tokio::time::sleep(SAVE_DEBOUNCE).await;
                    store.do_save();
                }));
            }
            Err(_) => {
                // No runtime (sync callers in tests): save immediately.
                drop(slot);
                self.do_save();
            }
        }
    }

    fn do_save(&self) {
        let data = {
            let mut state = self.lock();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            state.data.clone()
        };
        if let Err(e) = atomic_write_json(&self.shared.state_file, &data) {
            warn!(error = %e, "failed to save state");
            self.lock().dirty = true;
        } else {
            debug!(path = %self.shared.state_file.display(), "state saved");
        }
    }

    /// Force an immediate save of pending changes. Call on shutdown.
    pub fn flush(&self) {
        if let Some(handle) = self.shared.save_task.lock().unwrap().take() {
            handle.abort();
        }
        self.do_save();
    }

    /// Serialize the current state (for the round-trip stability tests).
    pub fn serialize_state(&self) -> String {
        serde_json::to_string_pretty(&self.lock().data).unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Startup reconciliation
    // -----------------------------------------------------------------------

    /// Re-resolve persisted window IDs against live tmux windows.
    ///
    /// Handles two cases, once at startup:
    /// 1. Old-format migration: window_name keys → window_id keys.
    /// 2. Stale IDs: the id is gone but its display name matches a live
    ///    window (tmux server restart renumbers windows).
    /// Entries resolvable neither way are dropped.
    pub fn resolve_stale_ids(&self, live_windows: &[TmuxWindow]) {
        let mut live_by_name: HashMap<&str, &str> = HashMap::new();
        let mut live_ids: HashSet<&str> = HashSet::new();
        for w in live_windows {
            live_by_name.insert(w.window_name.as_str(), w.window_id.as_str());
            live_ids.insert(w.window_id.as_str());
        }

        let mut state = self.lock();
        let mut changed = false;

        // --- window_states ---
        let old_states = std::mem::take(&mut state.data.window_states);
        for (key, mut ws) in old_states {
            if is_window_id(&key) {
                if live_ids.contains(key.as_str()) {
                    state.data.window_states.insert(key, ws);
                } else {
                    let display_name = state
                        .data
                        .window_display_names
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| {
                            if ws.window_name.is_empty() {
                                key.clone()
                            } else {
                                ws.window_name.clone()
                            }
                        });
                    if let Some(new_id) = live_by_name.get(display_name.as_str()) {
                        debug!(old = %key, new = %new_id, name = %display_name, "re-resolved window_state");
                        ws.window_name = display_name.clone();
                        state.data.window_states.insert((*new_id).to_string(), ws);
                        state
                            .data
                            .window_display_names
                            .insert((*new_id).to_string(), display_name);
                        state.data.window_display_names.remove(&key);
                    } else {
                        debug!(key = %key, name = %display_name, "dropping stale window_state");
                    }
                    changed = true;
                }
            } else {
                // Old format: the key is a window name.
                if let Some(new_id) = live_by_name.get(key.as_str()) {
                    debug!(name = %key, new = %new_id, "migrating window_state key");
                    ws.window_name = key.clone();
                    state.data.window_states.insert((*new_id).to_string(), ws);
                    state
                        .data
                        .window_display_names
                        .insert((*new_id).to_string(), key);
                } else {
                    debug!(name = %key, "dropping old-format window_state");
                }
                changed = true;
            }
        }

        // --- thread_bindings ---
        let users: Vec<i64> = state.data.thread_bindings.keys().copied().collect();
        for uid in users {
            let bindings = state.data.thread_bindings.remove(&uid).unwrap_or_default();
            let mut new_bindings: BTreeMap<i32, String> = BTreeMap::new();
            for (tid, wid) in bindings {
                if is_window_id(&wid) {
                    if live_ids.contains(wid.as_str()) {
                        new_bindings.insert(tid, wid);
                        continue;
                    }
                    let display = state
                        .data
                        .window_display_names
                        .get(&wid)
                        .cloned()
                        .unwrap_or_else(|| wid.clone());
                    if let Some(new_id) = live_by_name.get(display.as_str()) {
                        new_bindings.insert(tid, (*new_id).to_string());
                        state
                            .data
                            .window_display_names
                            .insert((*new_id).to_string(), display);
                    } else {
                        debug!(user = uid, thread = tid, wid = %wid, "dropping stale binding");
                    }
                    changed = true;
                } else {
                    if let Some(new_id) = live_by_name.get(wid.as_str()) {
                        new_bindings.insert(tid, (*new_id).to_string());
                        state
                            .data
                            .window_display_names
                            .insert((*new_id).to_string(), wid);
                    } else {
                        debug!(user = uid, thread = tid, name = %wid, "dropping old-format binding");
                    }
                    changed = true;
                }
            }
            if !new_bindings.is_empty() {
                state.data.thread_bindings.insert(uid, new_bindings);
            }
        }

        // --- user_window_offsets ---
        let users: Vec<i64> = state.data.user_window_offsets.keys().copied().collect();
        for uid in users {
            let offsets = state.data.user_window_offsets.remove(&uid).unwrap_or_default();
            let mut new_offsets: BTreeMap<String, u64> = BTreeMap::new();
            for (key, offset) in offsets {
                if is_window_id(&key) {
                    if live_ids.contains(key.as_str()) {
                        new_offsets.insert(key, offset);
                        continue;
                    }
                    let display = state
                        .data
                        .window_display_names
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| key.clone());
                    if let Some(new_id) = live_by_name.get(display.as_str()) {
                        new_offsets.insert((*new_id).to_string(), offset);
                    }
                    changed = true;
                } else {
                    if let Some(new_id) = live_by_name.get(key.as_str()) {
                        new_offsets.insert((*new_id).to_string(), offset);
                    }
                    changed = true;
                }
            }
            state.data.user_window_offsets.insert(uid, new_offsets);
        }

        state.needs_migration = false;
        if changed {
            state.window_to_thread = build_reverse_index(&state.data);
            drop(state);
            self.schedule_save();
            info!("startup re-resolution complete");
        }
    }

    // -----------------------------------------------------------------------
    // SessionMap ingestion
    // -----------------------------------------------------------------------

    /// Read session_map.json and fold new session associations into
    /// window_states. Also purges window_states entries absent from the
    /// current map — except those whose session_id is still referenced by an
    /// old-format key (that hook has not re-fired since the upgrade yet) —
    /// and strips old-format keys out of session_map.json itself.
    pub fn load_session_map(&self) {
        let Ok(content) = std::fs::read_to_string(&self.shared.session_map_file) else {
            return;
        };
        let Ok(mut raw) = serde_json::from_str::<Value>(&content) else {
            return;
        };
        let Some(map) = raw.as_object_mut() else {
            return;
        };

        let prefix = format!("{}:", self.shared.tmux_session_name);
        let mut valid_wids: HashSet<String> = HashSet::new();
        let mut old_format_sids: HashSet<String> = HashSet::new();
        let mut old_format_keys: Vec<String> = Vec::new();
        let mut changed = false;

        {
            let mut state = self.lock();
            for (key, info) in map.iter() {
                let Some(window_key) = key.strip_prefix(&prefix) else {
                    continue;
                };
                let Some(info) = info.as_object() else {
                    continue;
                };
                let field = |name: &str| {
                    info.get(name)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                if !is_window_id(window_key) {
                    let sid = field("session_id");
                    if !sid.is_empty() {
                        old_format_sids.insert(sid);
                    }
                    old_format_keys.push(key.clone());
                    continue;
                }
                valid_wids.insert(window_key.to_string());

                let new_sid = field("session_id");
                if new_sid.is_empty() {
                    continue;
                }
                let new_cwd = field("cwd");
                let new_wname = field("window_name");
                let new_transcript = field("transcript_path");

                let ws = state
                    .data
                    .window_states
                    .entry(window_key.to_string())
                    .or_default();
                if ws.session_id != new_sid || ws.cwd != new_cwd {
                    info!(window_id = %window_key, sid = %new_sid, cwd = %new_cwd,
                          "session map updated window");
                    ws.session_id = new_sid;
                    ws.cwd = new_cwd;
                    changed = true;
                }
                if !new_transcript.is_empty() && ws.transcript_path != new_transcript {
                    ws.transcript_path = new_transcript;
                    changed = true;
                }
                if !new_wname.is_empty() {
                    ws.window_name = new_wname.clone();
                    if state.data.window_display_names.get(window_key) != Some(&new_wname) {
                        state
                            .data
                            .window_display_names
                            .insert(window_key.to_string(), new_wname);
                        changed = true;
                    }
                }
            }

            let stale: Vec<String> = state
                .data
                .window_states
                .iter()
                .filter(|(wid, ws)| {
                    !wid.is_empty()
                        && !valid_wids.contains(*wid)
                        && !old_format_sids.contains(&ws.session_id)
                })
                .map(|(wid, _)| wid.clone())
                .collect();
            for wid in stale {
                info!(window_id = %wid, "removing stale window_state");
                state.data.window_states.remove(&wid);
                changed = true;
            }
        }

        if !old_format_keys.is_empty() {
            for key in &old_format_keys {
                info!(key = %key, "removing old-format session_map key");
                map.remove(key);
            }
            if let Err(e) = atomic_write_json(&self.shared.session_map_file, &raw) {
                warn!(error = %e, "failed to rewrite session_map");
            }
        }

        if changed {
            self.schedule_save();
        }
    }

    /// Remove session_map entries for windows that are no longer live.
    pub fn prune_session_map(&self, live_window_ids: &HashSet<String>) {
        let Ok(content) = std::fs::read_to_string(&self.shared.session_map_file) else {
            return;
        };
        let Ok(mut raw) = serde_json::from_str::<Value>(&content) else {
            return;
        };
        let Some(map) = raw.as_object_mut() else {
            return;
        };
        let prefix = format!("{}:", self.shared.tmux_session_name);
        let dead: Vec<String> = map
            .keys()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|wk| is_window_id(wk) && !live_window_ids.contains(wk))
            })
            .cloned()
            .collect();
        if dead.is_empty() {
            return;
        }
        for key in &dead {
            info!(key = %key, "pruning dead session_map entry");
            map.remove(key);
        }
        if let Err(e) = atomic_write_json(&self.shared.session_map_file, &raw) {
            warn!(error = %e, "failed to rewrite session_map");
        }
    }

    /// Parse the session map file into the monitor's projection.
    pub fn read_session_map(&self) -> BTreeMap<String, WindowDetails> {
        let prefix = format!("{}:", self.shared.tmux_session_name);
        match std::fs::read_to_string(&self.shared.session_map_file) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(raw) => parse_session_map(&raw, &prefix),
                Err(_) => BTreeMap::new(),
            },
            Err(_) => BTreeMap::new(),
        }
    }

    /// Poll session_map.json until an entry for `window_id` appears or
    /// `timeout` elapses. Returns whether the entry was found.
    pub async fn wait_for_session_map_entry(
        &self,
        window_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        debug!(window_id, ?timeout, "waiting for session_map entry");
        let key = format!("{}:{}", self.shared.tmux_session_name, window_id);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(content) = std::fs::read_to_string(&self.shared.session_map_file) {
                if let Ok(raw) = serde_json::from_str::<Value>(&content) {
                    let has_sid = raw
                        .get(&key)
                        .and_then(|info| info.get("session_id"))
                        .and_then(Value::as_str)
                        .is_some_and(|s| !s.is_empty());
                    if has_sid {
                        debug!(window_id, "session_map entry found");
                        self.load_session_map();
                        return true;
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
        warn!(window_id, "timed out waiting for session_map entry");
        false
    }

    // -----------------------------------------------------------------------
    // Window state
    // -----------------------------------------------------------------------

    /// Get (creating if absent) the window state. Returns a copy.
    pub fn get_window_state(&self, window_id: &str) -> WindowState {
        self.lock()
            .data
            .window_states
            .entry(window_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget a window's session and cwd after its transcript disappeared.
    pub fn clear_window_association(&self, window_id: &str) {
        {
            let mut state = self.lock();
            let ws = state
                .data
                .window_states
                .entry(window_id.to_string())
                .or_default();
            ws.session_id.clear();
            ws.cwd.clear();
        }
        self.schedule_save();
    }

    /// Clear the session association for a window (after `/clear`).
    pub fn clear_window_session(&self, window_id: &str) {
        {
            let mut state = self.lock();
            let ws = state
                .data
                .window_states
                .entry(window_id.to_string())
                .or_default();
            ws.session_id.clear();
            ws.notification_mode = NotificationMode::All;
        }
        self.schedule_save();
        info!(window_id, "cleared window session");
    }

    pub fn get_notification_mode(&self, window_id: &str) -> NotificationMode {
        self.lock()
            .data
            .window_states
            .get(window_id)
            .map(|ws| ws.notification_mode)
            .unwrap_or_default()
    }

    /// Cycle all → errors_only → muted → all. Returns the new mode.
    pub fn cycle_notification_mode(&self, window_id: &str) -> NotificationMode {
        let new_mode = {
            let mut state = self.lock();
            let ws = state
                .data
                .window_states
                .entry(window_id.to_string())
                .or_default();
            ws.notification_mode = ws.notification_mode.next();
            ws.notification_mode
        };
        self.schedule_save();
        new_mode
    }

    // -----------------------------------------------------------------------
    // Display names
    // -----------------------------------------------------------------------

    /// Display name for a window_id, falling back to the id itself. Stays
    /// resolvable briefly after the window_state entry is purged.
    pub fn get_display_name(&self, window_id: &str) -> String {
        self.lock()
            .data
            .window_display_names
            .get(window_id)
            .cloned()
            .unwrap_or_else(|| window_id.to_string())
    }

    pub fn set_display_name(&self, window_id: &str, window_name: &str) {
        let changed = {
            let mut state = self.lock();
            if state.data.window_display_names.get(window_id).map(String::as_str)
                == Some(window_name)
            {
                false
            } else {
                state
                    .data
                    .window_display_names
                    .insert(window_id.to_string(), window_name.to_string());
                if let Some(ws) = state.data.window_states.get_mut(window_id) {
                    ws.window_name = window_name.to_string();
                }
                true
            }
        };
        if changed {
            self.schedule_save();
        }
    }

    // -----------------------------------------------------------------------
    // Read offsets
    // -----------------------------------------------------------------------

    /// The user's last read offset for a window; `None` on first contact.
    pub fn get_user_window_offset(&self, user_id: i64, window_id: &str) -> Option<u64> {
        self.lock()
            .data
            .user_window_offsets
            .get(&user_id)?
            .get(window_id)
            .copied()
    }

    pub fn update_user_window_offset(&self, user_id: i64, window_id: &str, offset: u64) {
        self.lock()
            .data
            .user_window_offsets
            .entry(user_id)
            .or_default()
            .insert(window_id.to_string(), offset);
        self.schedule_save();
    }

    // -----------------------------------------------------------------------
    // Thread bindings
    // -----------------------------------------------------------------------

    /// Bind a topic thread to a tmux window.
    pub fn bind_thread(&self, user_id: i64, thread_id: i32, window_id: &str, window_name: &str) {
        {
            let mut state = self.lock();
            state
                .data
                .thread_bindings
                .entry(user_id)
                .or_default()
                .insert(thread_id, window_id.to_string());
            state
                .window_to_thread
                .insert((user_id, window_id.to_string()), thread_id);
            if !window_name.is_empty() {
                state
                    .data
                    .window_display_names
                    .insert(window_id.to_string(), window_name.to_string());
            }
        }
        self.schedule_save();
        info!(user_id, thread_id, window_id, window_name, "bound thread");
    }

    /// Remove a binding. Returns the previously bound window_id, if any.
    pub fn unbind_thread(&self, user_id: i64, thread_id: i32) -> Option<String> {
        let window_id = {
            let mut state = self.lock();
            let bindings = state.data.thread_bindings.get_mut(&user_id)?;
            let window_id = bindings.remove(&thread_id)?;
            if bindings.is_empty() {
                state.data.thread_bindings.remove(&user_id);
            }
            state.window_to_thread.remove(&(user_id, window_id.clone()));
            window_id
        };
        self.schedule_save();
        info!(user_id, thread_id, window_id = %window_id, "unbound thread");
        Some(window_id)
    }

    pub fn get_window_for_thread(&self, user_id: i64, thread_id: i32) -> Option<String> {
        self.lock()
            .data
            .thread_bindings
            .get(&user_id)?
            .get(&thread_id)
            .cloned()
    }

    /// Reverse lookup via the in-memory index.
    pub fn get_thread_for_window(&self, user_id: i64, window_id: &str) -> Option<i32> {
        self.lock()
            .window_to_thread
            .get(&(user_id, window_id.to_string()))
            .copied()
    }

    /// Resolve the window for a user's thread; `None` outside named topics.
    pub fn resolve_window_for_thread(
        &self,
        user_id: i64,
        thread_id: Option<i32>,
    ) -> Option<String> {
        self.get_window_for_thread(user_id, thread_id?)
    }

    /// All bindings as (user_id, thread_id, window_id) copies.
    pub fn iter_thread_bindings(&self) -> Vec<(i64, i32, String)> {
        let state = self.lock();
        let mut out = Vec::new();
        for (uid, bindings) in &state.data.thread_bindings {
            for (tid, wid) in bindings {
                out.push((*uid, *tid, wid.clone()));
            }
        }
        out
    }

    /// All users whose thread-bound window maps to `session_id`, as
    /// (user_id, window_id, thread_id). In-memory scan, O(bindings).
    pub fn find_users_for_session(&self, session_id: &str) -> Vec<(i64, String, i32)> {
        let state = self.lock();
        let mut out = Vec::new();
        for (uid, bindings) in &state.data.thread_bindings {
            for (tid, wid) in bindings {
                if state
                    .data
                    .window_states
                    .get(wid)
                    .is_some_and(|ws| ws.session_id == session_id)
                {
                    out.push((*uid, wid.clone(), *tid));
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Group chat routing
    // -----------------------------------------------------------------------

    /// Remember the group chat that owns a user's topic. Telegram requires
    /// the group chat_id (not the user id) to address a forum thread.
    pub fn set_group_chat_id(&self, user_id: i64, thread_id: Option<i32>, chat_id: i64) {
        let key = group_key(user_id, thread_id);
        let changed = {
            let mut state = self.lock();
            if state.data.group_chat_ids.get(&key) == Some(&chat_id) {
                false
            } else {
                state.data.group_chat_ids.insert(key, chat_id);
                true
            }
        };
        if changed {
            self.schedule_save();
            info!(user_id, ?thread_id, chat_id, "stored group chat id");
        }
    }

    /// Resolve where to send messages for a user's thread: the owning group
    /// chat for forum topics, the user id for DMs.
    pub fn resolve_chat_id(&self, user_id: i64, thread_id: Option<i32>) -> i64 {
        if let Some(tid) = thread_id {
            let key = group_key(user_id, Some(tid));
            if let Some(chat_id) = self.lock().data.group_chat_ids.get(&key) {
                return *chat_id;
            }
        }
        user_id
    }

    // -----------------------------------------------------------------------
    // Directory favorites
    // -----------------------------------------------------------------------

    pub fn get_user_starred(&self, user_id: i64) -> Vec<String> {
        self.lock()
            .data
            .user_dir_favorites
            .get(&user_id)
            .map(|f| f.starred.clone())
            .unwrap_or_default()
    }

    pub fn get_user_mru(&self, user_id: i64) -> Vec<String> {
        self.lock()
            .data
            .user_dir_favorites
            .get(&user_id)
            .map(|f| f.mru.clone())
            .unwrap_or_default()
    }

    /// Insert at the MRU front, dedupe, cap.
    pub fn update_user_mru(&self, user_id: i64, path: &str) {
        let resolved = canonical(path);
        {
            let mut state = self.lock();
            let favs = state.data.user_dir_favorites.entry(user_id).or_default();
            favs.mru.retain(|p| p != &resolved);
            favs.mru.insert(0, resolved);
            favs.mru.truncate(MRU_CAP);
        }
        self.schedule_save();
    }

    /// Toggle a directory in/out of the starred list; returns whether it is
    /// now starred.
    pub fn toggle_user_star(&self, user_id: i64, path: &str) -> bool {
        let resolved = canonical(path);
        let now_starred = {
            let mut state = self.lock();
            let favs = state.data.user_dir_favorites.entry(user_id).or_default();
            if let Some(pos) = favs.starred.iter().position(|p| p == &resolved) {
                favs.starred.remove(pos);
                false
            } else {
                favs.starred.push(resolved);
                true
            }
        };
        self.schedule_save();
        now_starred
    }
}

fn canonical(path: &str) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| path.to_string())
}

fn group_key(user_id: i64, thread_id: Option<i32>) -> String {
    match thread_id {
        Some(tid) => format!("{user_id}:{tid}"),
        None => format!("{user_id}:"),
    }
}

fn build_reverse_index(data: &StoreData) -> HashMap<(i64, String), i32> {
    let mut index = HashMap::new();
    for (uid, bindings) in &data.thread_bindings {
        for (tid, wid) in bindings {
            index.insert((*uid, wid.clone()), *tid);
        }
    }
    index
}

fn detect_old_format(data: &StoreData) -> bool {
    if data.window_states.keys().any(|k| !is_window_id(k)) {
        return true;
    }
    data.thread_bindings
        .values()
        .flat_map(|b| b.values())
        .any(|wid| !is_window_id(wid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> SessionStore {
        SessionStore::load(
            &dir.path().join("state.json"),
            &dir.path().join("session_map.json"),
            "termgram",
            &dir.path().join("projects"),
        )
    }

    fn window(id: &str, name: &str) -> TmuxWindow {
        TmuxWindow {
            window_id: id.to_string(),
            window_name: name.to_string(),
            cwd: "/tmp".to_string(),
            pane_current_command: "claude".to_string(),
        }
    }

    #[test]
    fn bind_and_reverse_lookup() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@3", "proj");

        assert_eq!(store.get_window_for_thread(100, 5).as_deref(), Some("@3"));
        assert_eq!(store.get_thread_for_window(100, "@3"), Some(5));
        assert_eq!(store.get_display_name("@3"), "proj");
        assert_eq!(store.iter_thread_bindings(), vec![(100, 5, "@3".to_string())]);
    }

    #[test]
    fn unbind_clears_reverse_index() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@3", "proj");
        assert_eq!(store.unbind_thread(100, 5).as_deref(), Some("@3"));
        assert_eq!(store.get_thread_for_window(100, "@3"), None);
        assert!(store.iter_thread_bindings().is_empty());
        assert_eq!(store.unbind_thread(100, 5), None);
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@3", "proj");
        store.bind_thread(200, 7, "@4", "other");
        store.update_user_window_offset(100, "@3", 12345);
        store.set_group_chat_id(100, Some(5), -100200);
        store.update_user_mru(100, "/tmp");
        store.flush();

        let first = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let store2 = make_store(&dir);
        assert_eq!(store2.serialize_state(), store.serialize_state());
        store2.bind_thread(999, 1, "@9", "x");
        store2.unbind_thread(999, 1);
        store2.flush();
        let second = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("state.json"), "{not json").unwrap();
        let store = make_store(&dir);
        assert!(store.iter_thread_bindings().is_empty());
        assert!(!store.needs_migration());
    }

    #[test]
    fn old_format_state_flags_migration() {
        let dir = TempDir::new().unwrap();
        let state = serde_json::json!({
            "window_states": {"myproj": {"session_id": "s1", "cwd": "/a"}},
        });
        std::fs::write(
            dir.path().join("state.json"),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
        let store = make_store(&dir);
        assert!(store.needs_migration());
    }

    #[test]
    fn resolve_stale_ids_remaps_by_display_name() {
        // Persisted @17 named "proj"; live tmux has @3 named "proj".
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@17", "proj");
        store.update_user_window_offset(100, "@17", 42);
        {
            let mut state = store.lock();
            state.data.window_states.insert(
                "@17".to_string(),
                WindowState {
                    session_id: "s1".into(),
                    cwd: "/a".into(),
                    window_name: "proj".into(),
                    ..Default::default()
                },
            );
        }

        store.resolve_stale_ids(&[window("@3", "proj")]);

        assert_eq!(store.get_window_for_thread(100, 5).as_deref(), Some("@3"));
        assert_eq!(store.get_thread_for_window(100, "@3"), Some(5));
        assert_eq!(store.get_user_window_offset(100, "@3"), Some(42));
        let state = store.lock();
        assert!(state.data.window_states.contains_key("@3"));
        assert!(!state.data.window_states.contains_key("@17"));
        assert!(!state
            .data
            .thread_bindings
            .values()
            .flat_map(|b| b.values())
            .any(|w| w == "@17"));
    }

    #[test]
    fn resolve_stale_ids_drops_unresolvable() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@17", "gone");
        store.resolve_stale_ids(&[window("@3", "unrelated")]);
        assert_eq!(store.get_window_for_thread(100, 5), None);
    }

    #[test]
    fn resolve_stale_ids_migrates_name_keys() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        {
            let mut state = store.lock();
            state.data.window_states.insert(
                "proj".to_string(),
                WindowState {
                    session_id: "s1".into(),
                    ..Default::default()
                },
            );
            state
                .data
                .thread_bindings
                .entry(100)
                .or_default()
                .insert(5, "proj".to_string());
        }
        store.resolve_stale_ids(&[window("@8", "proj")]);
        assert_eq!(store.get_window_for_thread(100, 5).as_deref(), Some("@8"));
        assert!(store.lock().data.window_states.contains_key("@8"));
    }

    #[test]
    fn load_session_map_updates_and_purges() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        {
            let mut state = store.lock();
            state.data.window_states.insert(
                "@9".to_string(),
                WindowState {
                    session_id: "dead".into(),
                    ..Default::default()
                },
            );
        }
        let map = serde_json::json!({
            "termgram:@1": {
                "session_id": "s1", "cwd": "/a", "window_name": "proj",
                "transcript_path": "/t/s1.jsonl",
            },
        });
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();

        store.load_session_map();

        let ws = store.get_window_state("@1");
        assert_eq!(ws.session_id, "s1");
        assert_eq!(ws.cwd, "/a");
        assert_eq!(ws.transcript_path, "/t/s1.jsonl");
        assert_eq!(store.get_display_name("@1"), "proj");
        // @9 is absent from the map and not protected: purged.
        assert!(!store.lock().data.window_states.contains_key("@9"));
    }

    #[test]
    fn old_format_sids_survive_purge_and_keys_are_stripped() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        {
            let mut state = store.lock();
            state.data.window_states.insert(
                "@9".to_string(),
                WindowState {
                    session_id: "legacy-sid".into(),
                    ..Default::default()
                },
            );
        }
        let map = serde_json::json!({
            "termgram:oldname": {"session_id": "legacy-sid", "cwd": "/a"},
        });
        let map_path = dir.path().join("session_map.json");
        std::fs::write(&map_path, serde_json::to_string(&map).unwrap()).unwrap();

        store.load_session_map();

        // Window state survives thanks to the old-format grace.
        assert!(store.lock().data.window_states.contains_key("@9"));
        // Old-format key is stripped from the file itself.
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_path).unwrap()).unwrap();
        assert!(rewritten.get("termgram:oldname").is_none());
    }

    #[test]
    fn prune_session_map_drops_dead_windows() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let map = serde_json::json!({
            "termgram:@1": {"session_id": "s1", "cwd": "/a"},
            "termgram:@2": {"session_id": "s2", "cwd": "/b"},
        });
        let map_path = dir.path().join("session_map.json");
        std::fs::write(&map_path, serde_json::to_string(&map).unwrap()).unwrap();

        let live: HashSet<String> = ["@1".to_string()].into_iter().collect();
        store.prune_session_map(&live);

        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&map_path).unwrap()).unwrap();
        assert!(rewritten.get("termgram:@1").is_some());
        assert!(rewritten.get("termgram:@2").is_none());
    }

    #[test]
    fn find_users_for_session_scans_bindings() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.bind_thread(100, 5, "@1", "a");
        store.bind_thread(200, 9, "@2", "b");
        {
            let mut state = store.lock();
            state.data.window_states.insert(
                "@1".to_string(),
                WindowState {
                    session_id: "sX".into(),
                    ..Default::default()
                },
            );
        }
        assert_eq!(
            store.find_users_for_session("sX"),
            vec![(100, "@1".to_string(), 5)]
        );
        assert!(store.find_users_for_session("missing").is_empty());
    }

    #[test]
    fn resolve_chat_id_prefers_group_then_user() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        store.set_group_chat_id(100, Some(5), -100900);
        assert_eq!(store.resolve_chat_id(100, Some(5)), -100900);
        assert_eq!(store.resolve_chat_id(100, Some(6)), 100);
        assert_eq!(store.resolve_chat_id(100, None), 100);
    }

    #[test]
    fn mru_dedupes_and_caps() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        for p in ["/a", "/b", "/c", "/d", "/e", "/f", "/b"] {
            store.update_user_mru(7, p);
        }
        let mru = store.get_user_mru(7);
        assert_eq!(mru.len(), 5);
        assert_eq!(mru[0], "/b");
        assert!(!mru.contains(&"/a".to_string()));
    }

    #[test]
    fn star_toggles() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        assert!(store.toggle_user_star(7, "/x"));
        assert_eq!(store.get_user_starred(7), vec!["/x".to_string()]);
        assert!(!store.toggle_user_star(7, "/x"));
        assert!(store.get_user_starred(7).is_empty());
    }

    #[test]
    fn notification_mode_cycles_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        assert_eq!(store.get_notification_mode("@1"), NotificationMode::All);
        assert_eq!(
            store.cycle_notification_mode("@1"),
            NotificationMode::ErrorsOnly
        );
        store.flush();

        let store2 = make_store(&dir);
        assert_eq!(store2.get_notification_mode("@1"), NotificationMode::ErrorsOnly);
    }

    #[tokio::test]
    async fn wait_for_session_map_entry_times_out_and_succeeds() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let found = store
            .wait_for_session_map_entry("@5", Duration::from_millis(60), Duration::from_millis(20))
            .await;
        assert!(!found);

        let map = serde_json::json!({
            "termgram:@5": {"session_id": "s5", "cwd": "/a"},
        });
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();
        let found = store
            .wait_for_session_map_entry("@5", Duration::from_millis(200), Duration::from_millis(20))
            .await;
        assert!(found);
        assert_eq!(store.get_window_state("@5").session_id, "s5");
    }
}
