//! Session registry: persistent PTY sessions keyed by browser-supplied UUID.
//! Each session owns one child process under a PTY, a virtual terminal and a
//! 512 KiB ring buffer fed with every output byte, a set of attached clients
//! with per-client terminal sizes, and the recording triple on disk. One pump
//! task per session fans PTY output out to the screen model, the recorder,
//! and every client, in order.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::agent::{self, AgentConfig};
use crate::config;
use crate::pty::{self, PtyHandle, DEFAULT_COLS, DEFAULT_ROWS};
use crate::recording::{self, Recorder, RecordingMetadata, Visitor};
use crate::term::Screen;
use crate::worktree;

/// Raw PTY output retained for late joiners.
pub const RING_CAP_BYTES: usize = 512 * 1024;

/// Input typed while the MOTD is on screen is held back this long.
pub const GRACE_WINDOW: Duration = Duration::from_secs(3);

/// Chunked-payload framing: gzipped payloads are split into frames of
/// `[0x02, index, total, payload...]`. Some mobile WebSocket stacks drop
/// large single frames silently, so chunking is not optional.
pub const CHUNK_FRAME_PREFIX: u8 = 0x02;
const CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_SIZE_MIN: usize = 512;
const MAX_CHUNKS: usize = 255;

const REAPER_TICK: Duration = Duration::from_secs(60);

/// Frames queued to one client. The per-client writer task drains these onto
/// the socket, which serializes all writes to that connection.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// Raw terminal output or a `[0x02, ...]` chunk frame.
    Binary(Bytes),
    /// JSON control message.
    Json(String),
}

pub type ClientSender = mpsc::UnboundedSender<ClientFrame>;

struct ClientHandle {
    /// Last size this client reported (rows, cols); None until the first resize.
    size: Option<(u16, u16)>,
    tx: ClientSender,
}

/// Fixed-capacity byte ring: new data appends, oldest bytes fall off.
pub struct CircularBuffer {
    data: Vec<u8>,
    cap: usize,
}

impl CircularBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.cap {
            let excess = self.data.len() - self.cap;
            self.data.drain(..excess);
        }
    }

    pub fn dump(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Gzip a snapshot or scrollback payload.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = enc.write_all(data);
    enc.finish().unwrap_or_default()
}

/// Split a gzipped payload into `[0x02, index, total, ...]` frames. Chunks
/// are at most 8 KiB; when a payload would need more than 255 of them the
/// chunk size grows to fit, and never drops below 512 B.
pub fn chunk_frames(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut size = CHUNK_SIZE;
    if payload.len().div_ceil(size) > MAX_CHUNKS {
        size = payload.len().div_ceil(MAX_CHUNKS);
    }
    size = size.max(CHUNK_SIZE_MIN);
    let total = payload.len().div_ceil(size).max(1);
    let mut frames = Vec::with_capacity(total);
    for (index, chunk) in payload.chunks(size.max(1)).enumerate() {
        let mut frame = Vec::with_capacity(chunk.len() + 3);
        frame.push(CHUNK_FRAME_PREFIX);
        frame.push(index as u8);
        frame.push(total as u8);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    if frames.is_empty() {
        frames.push(vec![CHUNK_FRAME_PREFIX, 0, 1]);
    }
    frames
}

/// Session names are short labels: at most 32 chars of `[A-Za-z0-9 ._/-]`.
/// Slashes are allowed so a name can target a hierarchical branch directly.
pub fn validate_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.' | '/'))
}

/// Componentwise minimum of all reported client sizes.
fn min_client_size<'a, I: Iterator<Item = &'a (u16, u16)>>(sizes: I) -> Option<(u16, u16)> {
    sizes.fold(None, |acc, &(r, c)| match acc {
        None => Some((r, c)),
        Some((ar, ac)) => Some((ar.min(r), ac.min(c))),
    })
}

struct SessionState {
    name: Option<String>,
    clients: HashMap<u64, ClientHandle>,
    next_client_id: u64,
    pty_size: (u16, u16),
    yolo_mode: bool,
    pending_replacement: Option<Vec<String>>,
    grace_until: Option<Instant>,
    input_buffer: Vec<u8>,
    metadata: RecordingMetadata,
    exit_code: Option<u32>,
    last_active: Instant,
}

/// VT + ring live behind their own lock: they are written on every PTY read
/// and only read on attach.
struct ScreenState {
    screen: Screen,
    ring: CircularBuffer,
}

pub struct Session {
    pub uuid: String,
    /// Recording file id; survives in-place restarts (YOLO toggle, resume).
    pub recording_uuid: String,
    pub agent: &'static AgentConfig,
    /// Branch derived from the session name; empty when unnamed.
    pub branch_name: String,
    pub work_dir: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
    recordings_dir: PathBuf,
    // Lock order: state, then screen, then recorder. Never hold across await.
    state: Mutex<SessionState>,
    screen: Mutex<ScreenState>,
    recorder: Mutex<Option<Recorder>>,
    pty: Mutex<Option<Arc<PtyHandle>>>,
}

impl Session {
    /// Current PTY handle; None only during a respawn gap.
    fn current_pty(&self) -> Option<Arc<PtyHandle>> {
        self.pty.lock().expect("pty mutex").clone()
    }

    /// Fan one output chunk into the screen model, ring buffer, recorder, and
    /// every attached client, in that order, atomically with respect to
    /// attaches so a late joiner's snapshot plus its live stream always
    /// reconstruct the producer's screen.
    pub fn emit_output(&self, bytes: &[u8]) {
        let mut state = self.state.lock().expect("state mutex");
        state.last_active = Instant::now();
        {
            let mut screen = self.screen.lock().expect("screen mutex");
            screen.screen.process(bytes);
            screen.ring.push(bytes);
        }
        if let Some(rec) = self.recorder.lock().expect("recorder mutex").as_mut() {
            rec.record(bytes);
        }
        let payload = Bytes::copy_from_slice(bytes);
        for client in state.clients.values() {
            let _ = client.tx.send(ClientFrame::Binary(payload.clone()));
        }
    }

    /// Register a client. Non-first clients are recorded as visitors. The
    /// scrollback and screen snapshot are queued on the client's channel
    /// before it joins the broadcast set, under the same lock the pump uses,
    /// so no output frame can be missed or duplicated.
    pub fn attach(&self, ip: &str, tx: ClientSender) -> u64 {
        let mut state = self.state.lock().expect("state mutex");
        let id = state.next_client_id;
        state.next_client_id += 1;

        if id > 0 {
            state.metadata.visitors.push(Visitor {
                joined_at: chrono::Utc::now().to_rfc3339(),
                ip: ip.to_string(),
            });
            self.persist_metadata(&state.metadata);
        }

        {
            // Always two chunked payloads, scrollback then snapshot, even when
            // the ring is still empty; the receiver reassembles generically.
            let screen = self.screen.lock().expect("screen mutex");
            for frame in chunk_frames(&gzip(&screen.ring.dump())) {
                let _ = tx.send(ClientFrame::Binary(Bytes::from(frame)));
            }
            for frame in chunk_frames(&gzip(&screen.screen.snapshot())) {
                let _ = tx.send(ClientFrame::Binary(Bytes::from(frame)));
            }
        }

        state.clients.insert(id, ClientHandle { size: None, tx });
        drop(state);
        self.broadcast_status();
        id
    }

    /// Remove a client and re-floor the PTY size to the remaining minimum.
    pub fn detach(&self, id: u64) {
        let mut state = self.state.lock().expect("state mutex");
        if state.clients.remove(&id).is_none() {
            return;
        }
        self.reconcile_size(&mut state);
        drop(state);
        self.broadcast_status();
    }

    /// A client reported its terminal size.
    pub fn client_resize(&self, id: u64, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let mut state = self.state.lock().expect("state mutex");
        let Some(client) = state.clients.get_mut(&id) else {
            return;
        };
        client.size = Some((rows, cols));
        if rows > state.metadata.max_rows || cols > state.metadata.max_cols {
            state.metadata.max_rows = state.metadata.max_rows.max(rows);
            state.metadata.max_cols = state.metadata.max_cols.max(cols);
            self.persist_metadata(&state.metadata);
        }
        self.reconcile_size(&mut state);
        drop(state);
        self.broadcast_status();
    }

    /// ptySize = componentwise min over attached clients; unchanged when no
    /// client is attached. Resizes the PTY and the VT only on change.
    fn reconcile_size(&self, state: &mut SessionState) {
        let Some(min) = min_client_size(state.clients.values().filter_map(|c| c.size.as_ref()))
        else {
            return;
        };
        if min == state.pty_size {
            return;
        }
        state.pty_size = min;
        if let Some(pty) = self.current_pty() {
            if let Err(e) = pty.resize(min.0, min.1) {
                log::warn!("session {}: {e}", self.uuid);
            }
        }
        let mut screen = self.screen.lock().expect("screen mutex");
        screen.screen.resize(min.0, min.1);
    }

    /// Write client input to the PTY, or buffer it while the MOTD grace
    /// window is open.
    pub fn write_input(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock().expect("state mutex");
            state.last_active = Instant::now();
            if let Some(until) = state.grace_until {
                if Instant::now() < until {
                    state.input_buffer.extend_from_slice(bytes);
                    return;
                }
                state.grace_until = None;
            }
        }
        if let Some(pty) = self.current_pty() {
            if let Err(e) = pty.write_input(bytes) {
                log::warn!("session {}: pty write: {e}", self.uuid);
            }
        }
    }

    /// Write the MOTD into the output stream and open the grace window.
    /// Called once, when the first client of a brand-new session attaches.
    pub fn begin_motd_grace(self: &Arc<Self>) {
        self.emit_output(&agent::motd(self.agent));
        {
            let mut state = self.state.lock().expect("state mutex");
            state.grace_until = Some(Instant::now() + GRACE_WINDOW);
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(GRACE_WINDOW).await;
            session.flush_grace();
        });
    }

    /// Release anything buffered during the grace window into the PTY.
    fn flush_grace(&self) {
        let buffered = {
            let mut state = self.state.lock().expect("state mutex");
            state.grace_until = None;
            std::mem::take(&mut state.input_buffer)
        };
        if buffered.is_empty() {
            return;
        }
        if let Some(pty) = self.current_pty() {
            if let Err(e) = pty.write_input(&buffered) {
                log::warn!("session {}: grace flush: {e}", self.uuid);
            }
        }
    }

    /// Queue a JSON control message to every client.
    pub fn broadcast_json(&self, value: &serde_json::Value) {
        let text = value.to_string();
        let state = self.state.lock().expect("state mutex");
        for client in state.clients.values() {
            let _ = client.tx.send(ClientFrame::Json(text.clone()));
        }
    }

    pub fn broadcast_status(&self) {
        self.broadcast_json(&self.status_json());
    }

    pub fn status_json(&self) -> serde_json::Value {
        let state = self.state.lock().expect("state mutex");
        serde_json::json!({
            "type": "status",
            "viewers": state.clients.len(),
            "rows": state.pty_size.0,
            "cols": state.pty_size.1,
            "assistant": self.agent.display_name,
            "sessionName": state.name.clone().unwrap_or_default(),
            "uuidShort": &self.uuid[..self.uuid.len().min(8)],
            "workDir": self.work_dir.to_string_lossy(),
            "yoloMode": state.yolo_mode,
            "yoloSupported": self.agent.yolo_supported(),
        })
    }

    /// Rename the session; validates, persists metadata, broadcasts status.
    pub fn rename(&self, name: &str) -> Result<()> {
        if !validate_session_name(name) {
            bail!("invalid session name");
        }
        {
            let mut state = self.state.lock().expect("state mutex");
            state.name = Some(name.to_string());
            state.metadata.name = Some(name.to_string());
            self.persist_metadata(&state.metadata);
        }
        self.broadcast_status();
        Ok(())
    }

    /// Flip YOLO mode: arm the pending replacement command, tell everyone,
    /// drop a banner into the stream, and SIGTERM the child. The pump sees
    /// the exit and respawns under the same recording UUID.
    pub fn toggle_yolo(&self) {
        if !self.agent.yolo_supported() {
            return;
        }
        let turning_on = {
            let mut state = self.state.lock().expect("state mutex");
            state.yolo_mode = !state.yolo_mode;
            let argv = if state.yolo_mode {
                self.agent.yolo_resume
            } else {
                self.agent.resume
            };
            state.pending_replacement =
                Some(argv.iter().map(|s| s.to_string()).collect());
            state.yolo_mode
        };
        self.broadcast_status();
        let banner = format!(
            "\r\n\x1b[33m[Switching YOLO mode {}, restarting agent...]\x1b[0m\r\n",
            if turning_on { "ON" } else { "OFF" }
        );
        self.emit_output(banner.as_bytes());
        if let Some(pty) = self.current_pty() {
            pty.terminate();
        }
    }

    fn take_pending_replacement(&self) -> Option<Vec<String>> {
        self.state
            .lock()
            .expect("state mutex")
            .pending_replacement
            .take()
    }

    /// Spawn the replacement child under a fresh PTY, reusing the recorder
    /// and recording UUID, and restore the current PTY size.
    fn respawn(&self, argv: &[String]) -> Result<mpsc::Receiver<Vec<u8>>> {
        let cmd = pty::command_for(self.agent, argv, &self.work_dir);
        let (handle, rx) = pty::spawn_pty(cmd)?;
        let size = self.state.lock().expect("state mutex").pty_size;
        let _ = handle.resize(size.0, size.1);
        {
            let mut state = self.state.lock().expect("state mutex");
            state.metadata.command = pty::display_argv(self.agent, argv);
            self.persist_metadata(&state.metadata);
        }
        *self.pty.lock().expect("pty mutex") = Some(Arc::new(handle));
        Ok(rx)
    }

    /// The child is gone for good: stamp metadata, compute playback
    /// dimensions from the log, banner the exit, and send the `exit` control.
    /// Runs once per session; a later call (the pump harvesting the exit of a
    /// child that `close()` already finalized) only records the exit code.
    fn finalize(&self, exit_code: u32) {
        {
            let mut state = self.state.lock().expect("state mutex");
            if state.metadata.ended_at.is_some() {
                state.exit_code.get_or_insert(exit_code);
                return;
            }
            state.exit_code = Some(exit_code);
            state.metadata.ended_at = Some(chrono::Utc::now().to_rfc3339());
        }
        self.emit_output(
            format!("\r\n[Process exited (code {exit_code})]\r\n").as_bytes(),
        );
        {
            let mut state = self.state.lock().expect("state mutex");
            if let Ok(log) =
                std::fs::read(recording::log_path(&self.recordings_dir, &self.recording_uuid))
            {
                let (cols, rows) = recording::playback_dims(&log);
                state.metadata.playback_cols = Some(cols);
                state.metadata.playback_rows = Some(rows);
            }
            self.persist_metadata(&state.metadata);
        }

        let mut exit = serde_json::json!({ "type": "exit", "exitCode": exit_code });
        if !self.branch_name.is_empty() {
            exit["worktree"] = serde_json::json!({
                "path": self.work_dir.to_string_lossy(),
                "branch": self.branch_name,
                "targetBranch": worktree_target_branch(&self.work_dir),
            });
        }
        self.broadcast_json(&exit);
    }

    fn persist_metadata(&self, meta: &RecordingMetadata) {
        if let Err(e) = recording::save_metadata(&self.recordings_dir, meta) {
            log::warn!("session {}: metadata save: {e}", self.uuid);
        }
    }

    /// Server-driven shutdown: finalize `endedAt` and persist metadata,
    /// deliver the `exit` control while clients are still attached, then
    /// close every client channel and kill the child. The pump reaps it and
    /// finds the session already finalized.
    pub fn close(&self) {
        self.finalize(0);
        {
            let mut state = self.state.lock().expect("state mutex");
            state.clients.clear();
        }
        if let Some(pty) = self.current_pty() {
            pty.kill();
        }
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().expect("state mutex").name.clone()
    }

    pub fn viewers(&self) -> usize {
        self.state.lock().expect("state mutex").clients.len()
    }

    pub fn yolo_mode(&self) -> bool {
        self.state.lock().expect("state mutex").yolo_mode
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().expect("state mutex").exit_code.is_some()
    }

    pub fn last_active(&self) -> Instant {
        self.state.lock().expect("state mutex").last_active
    }
}

/// Branch this worktree's changes would merge back into: origin's HEAD if
/// known, else `main`.
fn worktree_target_branch(work_dir: &Path) -> String {
    std::process::Command::new("git")
        .args(["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
        .current_dir(work_dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| {
            String::from_utf8(o.stdout)
                .ok()
                .map(|s| s.trim().trim_start_matches("origin/").to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "main".to_string())
}

/// Process-wide registry of live sessions. `get_or_create` holds the map
/// entry for the whole spawn so one UUID can never produce two sessions.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    recordings_dir: PathBuf,
}

impl SessionStore {
    pub fn new(recordings_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            recordings_dir,
        })
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.get(uuid).map(|s| Arc::clone(&s))
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(&s)).collect()
    }

    /// True when a live session is still writing this recording.
    pub fn is_recording_running(&self, recording_uuid: &str) -> bool {
        self.sessions
            .iter()
            .any(|s| s.recording_uuid == recording_uuid && !s.has_exited())
    }

    /// Look up or spawn the session for `uuid`. Named sessions without an
    /// inherited working directory get a worktree for their derived branch;
    /// worktree failure falls back to the plain workspace with a warning.
    pub fn get_or_create(
        self: &Arc<Self>,
        uuid: &str,
        agent_key: &str,
        name: Option<&str>,
        parent_work_dir: Option<PathBuf>,
    ) -> Result<(Arc<Session>, bool)> {
        use dashmap::mapref::entry::Entry;
        let entry = match self.sessions.entry(uuid.to_string()) {
            Entry::Occupied(e) => return Ok((Arc::clone(e.get()), false)),
            Entry::Vacant(e) => e,
        };

        let agent = agent::find(agent_key).context("unknown assistant")?;
        if !agent::detect_agents().iter().any(|a| a.key == agent.key) {
            bail!("assistant {agent_key} is not available on this host");
        }
        let name = match name {
            Some(n) if !n.is_empty() => {
                if !validate_session_name(n) {
                    bail!("invalid session name");
                }
                Some(n.to_string())
            }
            _ => None,
        };

        let cfg_work_dir = config::ensure_loaded().work_dir.clone();
        let mut branch_name = String::new();
        let work_dir = if let Some(parent) = parent_work_dir {
            parent
        } else if let Some(n) = &name {
            branch_name = worktree::derive_branch_name(n);
            if branch_name.is_empty() {
                cfg_work_dir.clone()
            } else {
                match worktree::create_worktree(
                    &cfg_work_dir,
                    &config::worktree_root(),
                    &branch_name,
                ) {
                    Ok(path) => path,
                    Err(e) => {
                        log::warn!("worktree for {branch_name}: {e}; using workspace");
                        branch_name.clear();
                        cfg_work_dir.clone()
                    }
                }
            }
        } else {
            cfg_work_dir.clone()
        };

        let startup: Vec<String> = agent.startup.iter().map(|s| s.to_string()).collect();
        let cmd = pty::command_for(agent, &startup, &work_dir);
        let (handle, rx) = pty::spawn_pty(cmd).context("spawn assistant")?;

        let recording_uuid = uuid::Uuid::new_v4().to_string();
        let recorder = match Recorder::open(&self.recordings_dir, &recording_uuid) {
            Ok(r) => Some(r),
            Err(e) => {
                log::warn!("session {uuid}: recorder: {e}");
                None
            }
        };

        let metadata = RecordingMetadata {
            uuid: recording_uuid.clone(),
            name: name.clone(),
            agent: agent.display_name.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: None,
            kept_at: None,
            command: pty::display_argv(agent, &startup),
            visitors: Vec::new(),
            max_cols: DEFAULT_COLS,
            max_rows: DEFAULT_ROWS,
            playback_cols: None,
            playback_rows: None,
            work_dir: Some(work_dir.to_string_lossy().into_owned()),
        };
        // Persist immediately so a crashed session still shows up in listings.
        if let Err(e) = recording::save_metadata(&self.recordings_dir, &metadata) {
            log::warn!("session {uuid}: metadata save: {e}");
        }

        let session = Arc::new(Session {
            uuid: uuid.to_string(),
            recording_uuid,
            agent,
            branch_name,
            work_dir,
            created_at: chrono::Utc::now(),
            recordings_dir: self.recordings_dir.clone(),
            state: Mutex::new(SessionState {
                name,
                clients: HashMap::new(),
                next_client_id: 0,
                pty_size: (DEFAULT_ROWS, DEFAULT_COLS),
                yolo_mode: false,
                pending_replacement: None,
                grace_until: None,
                input_buffer: Vec::new(),
                metadata,
                exit_code: None,
                last_active: Instant::now(),
            }),
            screen: Mutex::new(ScreenState {
                screen: Screen::new(DEFAULT_ROWS, DEFAULT_COLS),
                ring: CircularBuffer::new(RING_CAP_BYTES),
            }),
            recorder: Mutex::new(recorder),
            pty: Mutex::new(Some(Arc::new(handle))),
        });

        entry.insert(Arc::clone(&session));
        tokio::spawn(run_pump(Arc::clone(&session), rx));
        log::info!("session {uuid}: started {} in {}", agent.key, session.work_dir.display());
        Ok((session, true))
    }

    /// Minute tick: drop sessions whose child exited and was reaped, then
    /// apply recording retention.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                store
                    .sessions
                    .retain(|uuid, session| {
                        let keep = !session.has_exited();
                        if !keep {
                            log::info!("reaper: removing session {uuid}");
                        }
                        keep
                    });
                let store_ref = Arc::clone(&store);
                recording::enforce_retention(&store.recordings_dir, &move |uuid| {
                    store_ref.is_recording_running(uuid)
                });
            }
        });
    }
}

/// Per-session pump: consume PTY output until EOF, then either respawn with
/// the pending replacement command or finalize. A PTY read error with a live
/// child is treated as process death: kill, then harvest the exit code.
async fn run_pump(session: Arc<Session>, mut rx: mpsc::Receiver<Vec<u8>>) {
    loop {
        while let Some(bytes) = rx.recv().await {
            session.emit_output(&bytes);
        }

        let Some(handle) = session.current_pty() else {
            break;
        };
        if handle.is_alive() {
            handle.kill();
        }
        let waiter = Arc::clone(&handle);
        let exit_code = tokio::task::spawn_blocking(move || waiter.wait_exit())
            .await
            .unwrap_or(1);

        if let Some(argv) = session.take_pending_replacement() {
            match session.respawn(&argv) {
                Ok(new_rx) => {
                    rx = new_rx;
                    continue;
                }
                Err(e) => {
                    log::warn!("session {}: respawn failed: {e}", session.uuid);
                }
            }
        }
        session.finalize(exit_code);
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut ring = CircularBuffer::new(8);
        ring.push(b"abcdef");
        ring.push(b"ghij");
        assert_eq!(ring.dump(), b"cdefghij");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn chunk_frames_respect_size_and_index() {
        let payload = vec![7u8; 20_000];
        let frames = chunk_frames(&payload);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], CHUNK_FRAME_PREFIX);
            assert_eq!(frame[1] as usize, i);
            assert_eq!(frame[2] as usize, frames.len());
            assert!(frame.len() - 3 <= CHUNK_SIZE);
        }
        let rejoined: Vec<u8> = frames.iter().flat_map(|f| f[3..].to_vec()).collect();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn chunk_frames_grow_past_255() {
        let payload = vec![1u8; 3 * 1024 * 1024];
        let frames = chunk_frames(&payload);
        assert!(frames.len() <= 255, "got {} chunks", frames.len());
        let rejoined: Vec<u8> = frames.iter().flat_map(|f| f[3..].to_vec()).collect();
        assert_eq!(rejoined.len(), payload.len());
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"some terminal bytes \x1b[31mred\x1b[0m";
        assert_eq!(gunzip(&gzip(data)), data);
    }

    #[test]
    fn name_validation() {
        assert!(validate_session_name("fix login_bug-2"));
        assert!(validate_session_name("feature/x"));
        assert!(!validate_session_name(""));
        assert!(!validate_session_name(&"x".repeat(33)));
        assert!(!validate_session_name("emoji 🚀"));
        assert!(!validate_session_name("semi;colon"));
    }

    #[test]
    fn min_size_is_componentwise() {
        let sizes = [(30u16, 100u16), (24, 120)];
        assert_eq!(min_client_size(sizes.iter()), Some((24, 100)));
        let empty: [(u16, u16); 0] = [];
        assert_eq!(min_client_size(empty.iter()), None);
    }

    async fn shell_session(
        store: &Arc<SessionStore>,
        uuid: &str,
    ) -> Arc<Session> {
        let (session, is_new) = store.get_or_create(uuid, "shell", None, None).unwrap();
        assert!(is_new);
        session
    }

    #[tokio::test]
    async fn late_joiner_gets_scrollback_then_snapshot_then_live() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let session = shell_session(&store, "late-joiner").await;

        session.emit_output(b"hello\r\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach("127.0.0.1", tx);

        // First frames are chunked gzip payloads: scrollback, then snapshot.
        let mut chunked: Vec<Bytes> = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ClientFrame::Binary(bytes) = frame {
                if bytes.first() == Some(&CHUNK_FRAME_PREFIX) {
                    chunked.push(bytes);
                }
            }
        }
        assert!(chunked.len() >= 2);
        // The first frame announces how many chunks the scrollback payload has;
        // the snapshot payload follows immediately after.
        let first_total = chunked[0][2] as usize;
        let scrollback_payload: Vec<u8> = chunked[..first_total]
            .iter()
            .flat_map(|f| f[3..].to_vec())
            .collect();
        let scrollback = gunzip(&scrollback_payload);
        let text = String::from_utf8_lossy(&scrollback);
        assert!(text.contains("hello"), "scrollback: {text:?}");

        let snapshot_payload: Vec<u8> = chunked[first_total..]
            .iter()
            .flat_map(|f| f[3..].to_vec())
            .collect();
        let snapshot = gunzip(&snapshot_payload);
        assert!(snapshot.starts_with(b"\x1b[2J\x1b[H"));

        // Live bytes flow after the snapshot.
        session.emit_output(b"more");
        let mut saw_live = false;
        while let Ok(frame) = rx.try_recv() {
            if let ClientFrame::Binary(bytes) = frame {
                if bytes.as_ref() == b"more" {
                    saw_live = true;
                }
            }
        }
        assert!(saw_live);
        session.close();
    }

    #[tokio::test]
    async fn resize_floor_follows_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let session = shell_session(&store, "resize-floor").await;

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = session.attach("10.0.0.1", tx_a);
        let b = session.attach("10.0.0.2", tx_b);

        session.client_resize(a, 30, 100);
        session.client_resize(b, 24, 80);
        assert_eq!(session.status_json()["rows"], 24);
        assert_eq!(session.status_json()["cols"], 80);

        session.detach(b);
        assert_eq!(session.status_json()["rows"], 30);
        assert_eq!(session.status_json()["cols"], 100);

        let meta = recording::load_metadata(dir.path(), &session.recording_uuid).unwrap();
        assert!(meta.max_cols >= 100);
        assert!(meta.max_rows >= 30);
        session.close();
    }

    #[tokio::test]
    async fn duplicate_uuid_returns_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let first = shell_session(&store, "dup").await;
        let (second, is_new) = store.get_or_create("dup", "shell", None, None).unwrap();
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        first.close();
    }

    #[tokio::test]
    async fn unknown_assistant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        assert!(store.get_or_create("nope", "emacs", None, None).is_err());
        assert!(store.get("nope").is_none());
    }

    #[tokio::test]
    async fn grace_window_buffers_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let session = shell_session(&store, "grace").await;
        session.begin_motd_grace();
        session.write_input(b"buffered");
        {
            let state = session.state.lock().unwrap();
            assert_eq!(state.input_buffer, b"buffered");
        }
        session.close();
    }
}
