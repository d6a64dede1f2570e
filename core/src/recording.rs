//! Session recordings: a triple of `session-{uuid}.log` (raw terminal
//! output), `session-{uuid}.timing` (`delay bytes` lines), and
//! `session-{uuid}.metadata.json` per recording. The recorder tees every PTY
//! read; metadata is persisted at creation and on every change so a crashed
//! session still shows up in listings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::agent;

/// One browser that joined an already-running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub joined_at: String,
    pub ip: String,
}

/// On-disk metadata for one recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Assistant display name (retention maps it back to the binary key).
    pub agent: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_at: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub visitors: Vec<Visitor>,
    #[serde(default)]
    pub max_cols: u16,
    #[serde(default)]
    pub max_rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

pub fn log_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("session-{uuid}.log"))
}

pub fn timing_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("session-{uuid}.timing"))
}

pub fn metadata_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("session-{uuid}.metadata.json"))
}

/// Write metadata atomically: tmp file then rename.
pub fn save_metadata(dir: &Path, meta: &RecordingMetadata) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = metadata_path(dir, &meta.uuid);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(meta)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn load_metadata(dir: &Path, uuid: &str) -> Option<RecordingMetadata> {
    let data = std::fs::read_to_string(metadata_path(dir, uuid)).ok()?;
    serde_json::from_str(&data).ok()
}

/// In-process stand-in for a script(1) wrapper: owns the log and timing files
/// and duplicates every PTY read into them. Single writer: the session pump.
pub struct Recorder {
    log: std::fs::File,
    timing: std::fs::File,
    last: Instant,
}

impl Recorder {
    /// Open (or reopen, after a YOLO respawn) the log/timing pair in append
    /// mode so one recording spans agent restarts.
    pub fn open(dir: &Path, uuid: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(dir, uuid))
            .context("open recording log")?;
        let timing = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(timing_path(dir, uuid))
            .context("open recording timing")?;
        Ok(Self {
            log,
            timing,
            last: Instant::now(),
        })
    }

    /// Append one PTY chunk: raw bytes to the log, `delay bytes` to timing.
    pub fn record(&mut self, bytes: &[u8]) {
        let delay = self.last.elapsed().as_secs_f64();
        self.last = Instant::now();
        if let Err(e) = self.log.write_all(bytes) {
            log::warn!("recording log write failed: {e}");
            return;
        }
        let line = format!("{delay:.6} {}\n", bytes.len());
        if let Err(e) = self.timing.write_all(line.as_bytes()) {
            log::warn!("recording timing write failed: {e}");
        }
    }
}

/// One row of `GET /api/recording/list`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub agent: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept_at: Option<String>,
    pub has_timing: bool,
    pub size_bytes: u64,
}

/// Scan the recordings directory. `is_running(uuid)` filters out recordings
/// whose session is still live; a session with metadata but a dead child is
/// listed. Sorted by `started_at` descending (RFC3339 sorts lexically).
pub fn list_recordings(dir: &Path, is_running: &dyn Fn(&str) -> bool) -> Vec<RecordingEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(uuid) = name
            .strip_prefix("session-")
            .and_then(|r| r.strip_suffix(".log"))
        else {
            continue;
        };
        if is_running(uuid) {
            continue;
        }
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let meta = load_metadata(dir, uuid);
        let has_timing = timing_path(dir, uuid).exists();
        let (name, agent, started_at, ended_at, kept_at) = match meta {
            Some(m) => (m.name, m.agent, m.started_at, m.ended_at, m.kept_at),
            None => (None, String::new(), String::new(), None, None),
        };
        out.push(RecordingEntry {
            uuid: uuid.to_string(),
            name,
            agent,
            started_at,
            ended_at,
            kept_at,
            has_timing,
            size_bytes,
        });
    }
    out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    out
}

/// Delete the triple for one recording. Missing members are ignored.
pub fn delete_recording(dir: &Path, uuid: &str) {
    for path in [
        log_path(dir, uuid),
        timing_path(dir, uuid),
        metadata_path(dir, uuid),
    ] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("delete {}: {e}", path.display());
            }
        }
    }
}

/// Mark a recording kept. Idempotent; returns `true` when it was already kept.
pub fn keep_recording(dir: &Path, uuid: &str) -> Result<bool> {
    let mut meta = load_metadata(dir, uuid).context("recording metadata not found")?;
    if meta.kept_at.is_some() {
        return Ok(true);
    }
    meta.kept_at = Some(chrono::Utc::now().to_rfc3339());
    save_metadata(dir, &meta)?;
    Ok(false)
}

/// How many unkept recordings each agent keeps around.
const RETAIN_PER_AGENT: usize = 5;

/// Recordings that ended within this window survive regardless of count.
const RETAIN_FRESH_SECS: i64 = 3600;

/// Retention pass, run on every reaper tick: group by binary agent key, keep
/// each group's five most recent unkept recordings plus anything that ended
/// less than an hour ago; delete the files of all others. `keptAt` exempts a
/// recording entirely.
pub fn enforce_retention(dir: &Path, is_running: &dyn Fn(&str) -> bool) {
    let now = chrono::Utc::now();
    let entries = list_recordings(dir, is_running);

    let mut by_agent: std::collections::HashMap<&str, Vec<&RecordingEntry>> =
        std::collections::HashMap::new();
    for entry in &entries {
        if entry.kept_at.is_some() {
            continue;
        }
        let key = agent::find_by_display_name(&entry.agent)
            .map(|a| a.key)
            .unwrap_or("unknown");
        by_agent.entry(key).or_default().push(entry);
    }

    for group in by_agent.values() {
        // `entries` is already sorted newest-first.
        for entry in group.iter().skip(RETAIN_PER_AGENT) {
            let reference = entry.ended_at.as_deref().unwrap_or(&entry.started_at);
            let fresh = chrono::DateTime::parse_from_rfc3339(reference)
                .map(|t| {
                    now.signed_duration_since(t.with_timezone(&chrono::Utc)).num_seconds()
                        < RETAIN_FRESH_SECS
                })
                .unwrap_or(false);
            if fresh {
                continue;
            }
            log::info!("retention: deleting recording {}", entry.uuid);
            delete_recording(dir, &entry.uuid);
        }
    }
}

/// Terminal dimensions for playback, derived by scanning the raw log:
/// columns from the longest printed line (clamped to 80..=240), rows from the
/// deepest cursor row / newline count (floor 24, cap 10000). Used for older
/// recordings whose metadata predates `playbackCols`.
pub fn playback_dims(log: &[u8]) -> (u16, u16) {
    let mut max_line = 0usize;
    let mut col = 0usize;
    let mut newlines = 0usize;
    let mut max_cursor_row = 0usize;

    let mut i = 0;
    while i < log.len() {
        let b = log[i];
        if b == 0x1b {
            // CSI sequence: skip to the final byte; mine CUP rows for depth.
            if log.get(i + 1) == Some(&b'[') {
                let mut j = i + 2;
                while j < log.len() && !(0x40..=0x7e).contains(&log[j]) {
                    j += 1;
                }
                if j < log.len() && (log[j] == b'H' || log[j] == b'f') {
                    let params = &log[i + 2..j];
                    let row = params
                        .split(|&c| c == b';')
                        .next()
                        .and_then(|p| std::str::from_utf8(p).ok())
                        .and_then(|p| p.parse::<usize>().ok())
                        .unwrap_or(1);
                    max_cursor_row = max_cursor_row.max(row);
                }
                i = j + 1;
            } else {
                i += 2;
            }
            continue;
        }
        match b {
            b'\n' => {
                newlines += 1;
                col = 0;
            }
            b'\r' => col = 0,
            0x20..=0x7e => {
                col += 1;
                max_line = max_line.max(col);
            }
            0xc0..=0xff => {
                // Leading UTF-8 byte counts as one column; continuations don't.
                col += 1;
                max_line = max_line.max(col);
            }
            _ => {}
        }
        i += 1;
    }

    let cols = max_line.clamp(80, 240) as u16;
    let rows = max_cursor_row.max(newlines).max(24).min(10_000) as u16;
    (cols, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(uuid: &str, agent: &str, started_at: &str) -> RecordingMetadata {
        RecordingMetadata {
            uuid: uuid.to_string(),
            name: None,
            agent: agent.to_string(),
            started_at: started_at.to_string(),
            ended_at: Some(started_at.to_string()),
            kept_at: None,
            command: vec!["claude".to_string()],
            visitors: Vec::new(),
            max_cols: 80,
            max_rows: 24,
            playback_cols: None,
            playback_rows: None,
            work_dir: None,
        }
    }

    fn write_triple(dir: &Path, uuid: &str, agent: &str, started_at: &str) {
        std::fs::write(log_path(dir, uuid), b"output").unwrap();
        std::fs::write(timing_path(dir, uuid), b"0.1 6\n").unwrap();
        save_metadata(dir, &meta(uuid, agent, started_at)).unwrap();
    }

    #[test]
    fn metadata_uuid_matches_filenames() {
        let dir = tempfile::tempdir().unwrap();
        write_triple(dir.path(), "abc-123", "Claude Code", "2026-01-01T00:00:00Z");
        let loaded = load_metadata(dir.path(), "abc-123").unwrap();
        assert_eq!(loaded.uuid, "abc-123");
        assert!(log_path(dir.path(), &loaded.uuid).exists());
    }

    #[test]
    fn list_skips_running_and_sorts_desc() {
        let dir = tempfile::tempdir().unwrap();
        write_triple(dir.path(), "old", "Claude Code", "2026-01-01T00:00:00Z");
        write_triple(dir.path(), "new", "Claude Code", "2026-02-01T00:00:00Z");
        write_triple(dir.path(), "live", "Claude Code", "2026-03-01T00:00:00Z");
        let list = list_recordings(dir.path(), &|uuid| uuid == "live");
        let uuids: Vec<_> = list.iter().map(|e| e.uuid.as_str()).collect();
        assert_eq!(uuids, ["new", "old"]);
        assert!(list[0].has_timing);
        assert_eq!(list[0].size_bytes, 6);
    }

    #[test]
    fn keep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_triple(dir.path(), "k1", "Claude Code", "2026-01-01T00:00:00Z");
        assert!(!keep_recording(dir.path(), "k1").unwrap());
        let first = load_metadata(dir.path(), "k1").unwrap().kept_at.unwrap();
        assert!(keep_recording(dir.path(), "k1").unwrap());
        let second = load_metadata(dir.path(), "k1").unwrap().kept_at.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn retention_keeps_top_five_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            let uuid = format!("r{i}");
            write_triple(
                dir.path(),
                &uuid,
                "Claude Code",
                &format!("2026-01-0{}T00:00:00Z", i + 1),
            );
        }
        // r0 is oldest; keep it explicitly so retention must spare it.
        keep_recording(dir.path(), "r0").unwrap();
        enforce_retention(dir.path(), &|_| false);
        let left: Vec<_> = list_recordings(dir.path(), &|_| false)
            .into_iter()
            .map(|e| e.uuid)
            .collect();
        // Newest five unkept (r7..r3) plus the kept r0 survive.
        assert_eq!(left, ["r7", "r6", "r5", "r4", "r3", "r0"]);
    }

    #[test]
    fn retention_spares_recent_endings() {
        let dir = tempfile::tempdir().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        for i in 0..7 {
            let uuid = format!("f{i}");
            write_triple(dir.path(), &uuid, "Claude Code", &now);
        }
        enforce_retention(dir.path(), &|_| false);
        assert_eq!(list_recordings(dir.path(), &|_| false).len(), 7);
    }

    #[test]
    fn recorder_writes_log_and_timing() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::open(dir.path(), "t1").unwrap();
        rec.record(b"hello");
        rec.record(b"world!");
        let log = std::fs::read(log_path(dir.path(), "t1")).unwrap();
        assert_eq!(log, b"helloworld!");
        let timing = std::fs::read_to_string(timing_path(dir.path(), "t1")).unwrap();
        let lines: Vec<_> = timing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" 5"));
        assert!(lines[1].ends_with(" 6"));
    }

    #[test]
    fn playback_dims_defaults() {
        assert_eq!(playback_dims(b""), (80, 24));
        assert_eq!(playback_dims(b"short\n"), (80, 24));
    }

    #[test]
    fn playback_dims_tracks_lines_and_cursor() {
        let mut log = Vec::new();
        log.extend_from_slice(&vec![b'x'; 120]);
        log.push(b'\n');
        log.extend_from_slice(b"\x1b[42;1Hbottom");
        let (cols, rows) = playback_dims(&log);
        assert_eq!(cols, 120);
        assert_eq!(rows, 42);
    }

    #[test]
    fn playback_dims_clamps_cols() {
        let log = vec![b'y'; 500];
        assert_eq!(playback_dims(&log).0, 240);
    }
}
