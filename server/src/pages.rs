//! Server-rendered HTML: homepage, session page, playback pages, and the
//! proxy retry page. Templates are plain strings with token substitution;
//! xterm.js comes from a CDN and the session client script speaks the binary
//! wire protocol (chunk reassembly, resize frames, file drop uploads).

use base64::Engine;
use common::recording::RecordingEntry;
use common::session::Session;
use std::collections::BTreeMap;
use std::sync::Arc;

const XTERM_CSS: &str = "https://cdn.jsdelivr.net/npm/@xterm/xterm@5.5.0/css/xterm.css";
const XTERM_JS: &str = "https://cdn.jsdelivr.net/npm/@xterm/xterm@5.5.0/lib/xterm.js";
const XTERM_FIT_JS: &str =
    "https://cdn.jsdelivr.net/npm/@xterm/addon-fit@0.10.0/lib/addon-fit.js";

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── Homepage ──────────────────────────────────────────────────────────────────

/// Grouped landing page: one card per detected agent with its live sessions,
/// plus kept and recent recordings.
pub fn homepage(
    agents: &[&'static common::agent::AgentConfig],
    sessions: &[Arc<Session>],
    recordings: &[RecordingEntry],
) -> String {
    let mut cards = String::new();
    for agent in agents {
        let mut rows = String::new();
        for session in sessions.iter().filter(|s| s.agent.key == agent.key) {
            let label = session
                .name()
                .unwrap_or_else(|| session.uuid[..session.uuid.len().min(8)].to_string());
            rows.push_str(&format!(
                r#"<li><a href="/session/{uuid}?assistant={key}">{label}</a> <span class="dim">{viewers} viewer(s) · {dir}</span></li>"#,
                uuid = session.uuid,
                key = agent.key,
                label = html_escape(&label),
                viewers = session.viewers(),
                dir = html_escape(&session.work_dir.to_string_lossy()),
            ));
        }
        if rows.is_empty() {
            rows.push_str(r#"<li class="dim">no live sessions</li>"#);
        }

        let mut recording_rows = String::new();
        for rec in recordings
            .iter()
            .filter(|r| {
                common::agent::find_by_display_name(&r.agent)
                    .map(|a| a.key)
                    .unwrap_or("unknown")
                    == agent.key
            })
            .take(10)
        {
            let label = rec.name.clone().unwrap_or_else(|| rec.uuid[..8.min(rec.uuid.len())].to_string());
            let kept = if rec.kept_at.is_some() { " ★" } else { "" };
            recording_rows.push_str(&format!(
                r#"<li><a href="/recording/{uuid}">{label}</a>{kept} <span class="dim">{started}</span></li>"#,
                uuid = rec.uuid,
                label = html_escape(&label),
                started = html_escape(&rec.started_at),
            ));
        }
        if recording_rows.is_empty() {
            recording_rows.push_str(r#"<li class="dim">no recordings</li>"#);
        }

        cards.push_str(&format!(
            r#"<section class="card">
<h2>{name}</h2>
<p class="dim">{blurb}</p>
<p><a class="new" href="/session/{new_uuid}?assistant={key}">New session</a></p>
<h3>Live</h3><ul>{rows}</ul>
<h3>Recordings</h3><ul>{recording_rows}</ul>
</section>"#,
            name = html_escape(agent.display_name),
            blurb = html_escape(agent.homepage),
            new_uuid = uuid::Uuid::new_v4(),
            key = agent.key,
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>swe-swe</title>
<style>
body{{font-family:system-ui,sans-serif;background:#111;color:#ddd;margin:2rem}}
a{{color:#6cf}}.dim{{color:#888;font-size:0.85em}}
.card{{border:1px solid #333;border-radius:8px;padding:1rem;margin-bottom:1rem;max-width:48rem}}
h2{{margin-top:0}}ul{{margin:0.25rem 0;padding-left:1.25rem}}
.new{{font-weight:bold}}
</style></head>
<body><h1>swe-swe</h1>{cards}</body></html>"#,
    )
}

// ── Session page ─────────────────────────────────────────────────────────────

const SESSION_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>__TITLE__</title>
<link rel="stylesheet" href="__XTERM_CSS__">
<style>
html,body{height:100%;margin:0;background:#111;color:#ddd;font-family:system-ui,sans-serif}
#bar{display:flex;gap:1rem;align-items:center;padding:0.35rem 0.75rem;background:#1b1b1b;font-size:0.85rem}
#bar .dim{color:#888}
#term{position:absolute;top:2rem;bottom:0;left:0;right:0}
button{background:#333;color:#ddd;border:1px solid #555;border-radius:4px;cursor:pointer}
</style></head>
<body>
<div id="bar">
  <span id="status" class="dim">connecting…</span>
  <button id="yolo" hidden>YOLO</button>
</div>
<div id="term"></div>
<script src="__XTERM_JS__"></script>
<script src="__XTERM_FIT_JS__"></script>
<script>
(function () {
  var term = new Terminal({ fontSize: 14, scrollback: 5000 });
  var fit = new FitAddon.FitAddon();
  term.loadAddon(fit);
  term.open(document.getElementById("term"));
  fit.fit();

  var scheme = location.protocol === "https:" ? "wss:" : "ws:";
  var ws = new WebSocket(scheme + "//" + location.host + "/ws/__UUID__" + location.search);
  ws.binaryType = "arraybuffer";

  var chunks = null;

  function sendResize() {
    if (ws.readyState !== WebSocket.OPEN) return;
    var frame = new Uint8Array(5);
    frame[0] = 0x00;
    frame[1] = term.rows >> 8; frame[2] = term.rows & 0xff;
    frame[3] = term.cols >> 8; frame[4] = term.cols & 0xff;
    ws.send(frame);
  }

  function feedChunked(bytes) {
    var index = bytes[1], total = bytes[2];
    if (!chunks || chunks.total !== total) chunks = { total: total, parts: [], seen: 0 };
    if (!chunks.parts[index]) { chunks.parts[index] = bytes.subarray(3); chunks.seen++; }
    if (chunks.seen < total) return;
    var payload = new Blob(chunks.parts);
    chunks = null;
    var stream = payload.stream().pipeThrough(new DecompressionStream("gzip"));
    new Response(stream).arrayBuffer().then(function (buf) {
      term.write(new Uint8Array(buf));
    });
  }

  ws.onopen = function () { sendResize(); };
  ws.onmessage = function (event) {
    if (typeof event.data === "string") {
      var msg = JSON.parse(event.data);
      if (msg.type === "status") {
        document.getElementById("status").textContent =
          msg.assistant + " · " + (msg.sessionName || msg.uuidShort) + " · " +
          msg.viewers + " viewer(s) · " + msg.cols + "x" + msg.rows +
          (msg.yoloMode ? " · YOLO" : "");
        var yolo = document.getElementById("yolo");
        yolo.hidden = !msg.yoloSupported;
      } else if (msg.type === "exit") {
        document.getElementById("status").textContent = "exited (" + msg.exitCode + ")";
      }
      return;
    }
    var bytes = new Uint8Array(event.data);
    if (bytes.length >= 3 && bytes[0] === 0x02) { feedChunked(bytes); return; }
    term.write(bytes);
  };
  ws.onclose = function () {
    document.getElementById("status").textContent = "disconnected";
  };

  term.onData(function (data) {
    if (ws.readyState === WebSocket.OPEN) ws.send(new TextEncoder().encode(data));
  });
  window.addEventListener("resize", function () { fit.fit(); sendResize(); });
  term.onResize(sendResize);

  document.getElementById("yolo").addEventListener("click", function () {
    ws.send(JSON.stringify({ type: "toggle_yolo" }));
  });

  document.body.addEventListener("dragover", function (e) { e.preventDefault(); });
  document.body.addEventListener("drop", function (e) {
    e.preventDefault();
    var file = e.dataTransfer.files[0];
    if (!file) return;
    file.arrayBuffer().then(function (buf) {
      var name = new TextEncoder().encode(file.name);
      var frame = new Uint8Array(3 + name.length + buf.byteLength);
      frame[0] = 0x01;
      frame[1] = name.length >> 8; frame[2] = name.length & 0xff;
      frame.set(name, 3);
      frame.set(new Uint8Array(buf), 3 + name.length);
      ws.send(frame);
    });
  });
})();
</script>
</body></html>
"#;

pub fn session_page(uuid: &str, title: &str) -> String {
    SESSION_PAGE
        .replace("__TITLE__", &html_escape(title))
        .replace("__UUID__", uuid)
        .replace("__XTERM_CSS__", XTERM_CSS)
        .replace("__XTERM_JS__", XTERM_JS)
        .replace("__XTERM_FIT_JS__", XTERM_FIT_JS)
}

// ── Playback ─────────────────────────────────────────────────────────────────

fn replace_all_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Prepare a raw log for the embedded scrollable view: drop a script(1)-style
/// header line if present and replace clear-screen/home sequences with line
/// breaks so nothing overwrites earlier output.
pub fn neutralize_log(log: &[u8]) -> Vec<u8> {
    let mut log = log;
    if log.starts_with(b"Script started") {
        if let Some(pos) = log.iter().position(|&b| b == b'\n') {
            log = &log[pos + 1..];
        }
    }
    let mut out = log.to_vec();
    for seq in [&b"\x1bc"[..], b"\x1b[2J", b"\x1b[3J", b"\x1b[H"] {
        out = replace_all_bytes(&out, seq, b"\r\n");
    }
    out
}

const PLAYBACK_EMBEDDED: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>recording __UUID__</title>
<link rel="stylesheet" href="__XTERM_CSS__">
<style>html,body{height:100%;margin:0;background:#111}#term{height:100%}</style>
</head><body><div id="term"></div>
<script src="__XTERM_JS__"></script>
<script>
(function () {
  var term = new Terminal({ cols: __COLS__, rows: __ROWS__, scrollback: 100000, convertEol: false });
  term.open(document.getElementById("term"));
  var b64 = "__B64__";
  var raw = atob(b64);
  var bytes = new Uint8Array(raw.length);
  for (var i = 0; i < raw.length; i++) bytes[i] = raw.charCodeAt(i);
  term.write(bytes);
})();
</script></body></html>
"#;

/// Self-contained playback page with the whole neutralized log embedded.
pub fn playback_embedded(uuid: &str, cols: u16, rows: u16, log: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(neutralize_log(log));
    PLAYBACK_EMBEDDED
        .replace("__UUID__", uuid)
        .replace("__XTERM_CSS__", XTERM_CSS)
        .replace("__XTERM_JS__", XTERM_JS)
        .replace("__COLS__", &cols.to_string())
        .replace("__ROWS__", &rows.to_string())
        .replace("__B64__", &b64)
}

const PLAYBACK_STREAMING: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>recording __UUID__</title>
<link rel="stylesheet" href="__XTERM_CSS__">
<style>html,body{height:100%;margin:0;background:#111}#term{height:100%}</style>
</head><body><div id="term"></div>
<script src="__XTERM_JS__"></script>
<script>
(function () {
  var term = new Terminal({ cols: __COLS__, rows: __ROWS__, scrollback: 10000 });
  term.open(document.getElementById("term"));
  var timing = __TIMING__;
  fetch("/recording/__UUID__/session.log").then(function (r) {
    return r.arrayBuffer();
  }).then(function (buf) {
    var bytes = new Uint8Array(buf);
    var offset = 0, step = 0;
    function next() {
      if (step >= timing.length) {
        if (offset < bytes.length) term.write(bytes.subarray(offset));
        return;
      }
      var frame = timing[step++];
      term.write(bytes.subarray(offset, offset + frame[1]));
      offset += frame[1];
      setTimeout(next, Math.min(frame[0] * 1000, 2000));
    }
    next();
  });
})();
</script></body></html>
"#;

/// Streaming playback: fetches the raw log and replays it frame-by-frame with
/// the recorded delays (capped so idle stretches don't stall the view).
pub fn playback_streaming(uuid: &str, cols: u16, rows: u16, timing: &str) -> String {
    let frames: Vec<(f64, usize)> = timing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let delay = parts.next()?.parse().ok()?;
            let bytes = parts.next()?.parse().ok()?;
            Some((delay, bytes))
        })
        .collect();
    let timing_json = serde_json::to_string(&frames).unwrap_or_else(|_| "[]".to_string());
    PLAYBACK_STREAMING
        .replace("__UUID__", uuid)
        .replace("__XTERM_CSS__", XTERM_CSS)
        .replace("__XTERM_JS__", XTERM_JS)
        .replace("__COLS__", &cols.to_string())
        .replace("__ROWS__", &rows.to_string())
        .replace("__TIMING__", &timing_json)
}

// ── Proxy error page ─────────────────────────────────────────────────────────

const PROXY_ERROR: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>preview unavailable</title>
<style>body{font-family:system-ui,sans-serif;background:#111;color:#ddd;margin:4rem auto;max-width:32rem;text-align:center}
code{color:#f88}</style></head>
<body><h1>Preview not responding</h1>
<p><code>__ERROR__</code></p>
<p>Retrying automatically…</p>
<script>
setInterval(function () {
  fetch(location.href, { method: "HEAD" }).then(function (r) {
    if (r.ok) location.reload();
  }).catch(function () {});
}, 3000);
</script></body></html>
"#;

/// 502 body for HTML requests: polls the same URL with HEAD every 3 s and
/// reloads once the upstream answers 2xx.
pub fn proxy_error_page(error: &str) -> String {
    PROXY_ERROR.replace("__ERROR__", &html_escape(error))
}

// ── Grouping helper for the worktrees API ────────────────────────────────────

/// Map of branch -> session UUID for annotating worktree listings.
pub fn sessions_by_branch(sessions: &[Arc<Session>]) -> BTreeMap<String, String> {
    sessions
        .iter()
        .filter(|s| !s.branch_name.is_empty())
        .map(|s| (s.branch_name.clone(), s.uuid.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_covers_html_metachars() {
        assert_eq!(html_escape(r#"<b a="1">&"#), "&lt;b a=&quot;1&quot;&gt;&amp;");
    }

    #[test]
    fn neutralize_replaces_clear_sequences() {
        let log = b"first\x1b[2Jsecond\x1b[Hthird\x1bc";
        let out = neutralize_log(log);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "first\r\nsecond\r\nthird\r\n");
    }

    #[test]
    fn neutralize_strips_script_header() {
        let log = b"Script started on 2026-01-01\nreal output";
        assert_eq!(neutralize_log(log), b"real output");
    }

    #[test]
    fn embedded_page_carries_dimensions_and_payload() {
        let html = playback_embedded("abc", 120, 40, b"hello");
        assert!(html.contains("cols: 120"));
        assert!(html.contains("rows: 40"));
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"hello");
        assert!(html.contains(&b64));
    }

    #[test]
    fn streaming_page_parses_timing() {
        let html = playback_streaming("abc", 80, 24, "0.5 10\n1.25 20\nbroken line\n");
        assert!(html.contains("[[0.5,10],[1.25,20]]"));
        assert!(html.contains("/recording/abc/session.log"));
    }

    #[test]
    fn session_page_substitutes_uuid() {
        let html = session_page("deadbeef", "claude — swe-swe");
        assert!(html.contains("/ws/deadbeef"));
        assert!(!html.contains("__UUID__"));
    }

    #[test]
    fn proxy_error_page_embeds_reason() {
        let html = proxy_error_page("connection refused");
        assert!(html.contains("connection refused"));
        assert!(html.contains("HEAD"));
    }
}
