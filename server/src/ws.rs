//! WebSocket endpoint for terminal sessions: `/ws/{uuid}`.
//!
//! One binary sub-protocol multiplexes everything a browser needs:
//! client frames starting `0x00` are resizes, `0x01` file uploads, anything
//! else raw terminal input; server binary frames starting `0x02` are chunks
//! of a gzipped scrollback/snapshot payload and all others raw PTY output.
//! Text frames carry JSON control messages both ways. All writes to one
//! socket go through a single writer task, so frames never interleave.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;

use common::config;
use common::session::{ClientFrame, ClientSender, Session};

use crate::web_server::AppState;

/// Client frame prefixes.
const FRAME_RESIZE: u8 = 0x00;
const FRAME_UPLOAD: u8 = 0x01;

#[derive(serde::Deserialize)]
pub struct WsQuery {
    assistant: Option<String>,
    name: Option<String>,
    parent: Option<String>,
}

/// Control messages a client may send.
#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Ping {
        #[serde(default)]
        data: serde_json::Value,
    },
    Chat {
        #[serde(rename = "userName", default)]
        user_name: String,
        #[serde(default)]
        text: String,
    },
    RenameSession {
        name: String,
    },
    ToggleYolo,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(assistant) = query.assistant.filter(|a| !a.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "assistant is required").into_response();
    };

    // Ad-hoc sessions spawned beside a named one inherit its working directory.
    let parent_work_dir = query
        .parent
        .as_deref()
        .and_then(|p| state.store.get(p))
        .map(|parent| parent.work_dir.clone());

    let created = state.store.get_or_create(
        &uuid,
        &assistant,
        query.name.as_deref(),
        parent_work_dir,
    );
    let (session, is_new) = match created {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("ws {uuid}: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session, is_new, addr))
}

async fn handle_socket(
    socket: WebSocket,
    session: std::sync::Arc<Session>,
    is_new: bool,
    addr: SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();

    let client_id = session.attach(&addr.ip().to_string(), tx.clone());
    if is_new {
        session.begin_motd_grace();
    }

    // Sole writer for this socket: everything queued on the channel (the
    // attach snapshot, broadcast output, control replies) leaves in order.
    let writer = async {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                ClientFrame::Binary(bytes) => {
                    ws_tx.send(Message::Binary(bytes.into())).await
                }
                ClientFrame::Json(text) => ws_tx.send(Message::Text(text.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    };

    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Binary(bytes) => handle_binary(&session, client_id, &tx, &bytes),
                Message::Text(text) => handle_control(&session, &tx, &text),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    session.detach(client_id);
    log::info!("session {}: client {} detached", session.uuid, addr);
}

fn handle_binary(session: &Session, client_id: u64, tx: &ClientSender, bytes: &[u8]) {
    match bytes.first() {
        Some(&FRAME_RESIZE) if bytes.len() >= 5 => {
            let rows = u16::from_be_bytes([bytes[1], bytes[2]]);
            let cols = u16::from_be_bytes([bytes[3], bytes[4]]);
            session.client_resize(client_id, rows, cols);
        }
        Some(&FRAME_UPLOAD) if bytes.len() >= 3 => handle_upload(session, tx, bytes),
        Some(_) => session.write_input(bytes),
        None => {}
    }
}

/// `0x01 LH LL <name> <contents>`: save under the uploads directory and type
/// the absolute path into the PTY so the running agent can read the file.
fn handle_upload(session: &Session, tx: &ClientSender, bytes: &[u8]) {
    let name_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let reply_err = |error: String| {
        let _ = tx.send(ClientFrame::Json(
            serde_json::json!({ "type": "file_upload", "success": false, "error": error })
                .to_string(),
        ));
    };
    if bytes.len() < 3 + name_len {
        reply_err("truncated upload frame".to_string());
        return;
    }
    let Ok(raw_name) = std::str::from_utf8(&bytes[3..3 + name_len]) else {
        reply_err("filename is not valid UTF-8".to_string());
        return;
    };
    let Some(filename) = sanitize_filename(raw_name) else {
        reply_err(format!("invalid filename {raw_name:?}"));
        return;
    };
    let contents = &bytes[3 + name_len..];

    let dir = config::uploads_dir();
    let path = dir.join(&filename);
    let saved = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, contents));
    if let Err(e) = saved {
        log::warn!("session {}: upload {filename}: {e}", session.uuid);
        reply_err(e.to_string());
        return;
    }

    let _ = tx.send(ClientFrame::Json(
        serde_json::json!({ "type": "file_upload", "success": true, "filename": filename })
            .to_string(),
    ));
    let absolute = absolute_path(&path);
    session.write_input(absolute.to_string_lossy().as_bytes());
}

fn absolute_path(path: &std::path::Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        config::ensure_loaded()
            .work_dir
            .join(path.strip_prefix(".").unwrap_or(path))
    })
}

fn handle_control(session: &Session, tx: &ClientSender, text: &str) {
    let parsed: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("session {}: bad control message: {e}", session.uuid);
            return;
        }
    };
    match parsed {
        ControlMessage::Ping { data } => {
            let _ = tx.send(ClientFrame::Json(
                serde_json::json!({ "type": "pong", "data": data }).to_string(),
            ));
        }
        ControlMessage::Chat { user_name, text } => {
            session.broadcast_json(&serde_json::json!({
                "type": "chat",
                "userName": user_name,
                "text": text,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }));
        }
        ControlMessage::RenameSession { name } => {
            if let Err(e) = session.rename(&name) {
                log::warn!("session {}: rename: {e}", session.uuid);
            }
        }
        ControlMessage::ToggleYolo => session.toggle_yolo(),
    }
}

/// Strip path components and reject names that could escape the uploads
/// directory: empty, `.`, `..`, and anything starting with `..`.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = std::path::Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())?;
    if name.is_empty() || name == "." || name.starts_with("..") {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("hello.txt").as_deref(), Some("hello.txt"));
        assert_eq!(
            sanitize_filename("/etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename("a/b/../c/notes.md").as_deref(),
            Some("notes.md")
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("."), None);
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("..hidden"), None);
        assert_eq!(sanitize_filename("a/.."), None);
    }

    #[test]
    fn resize_frame_layout() {
        let frame = [FRAME_RESIZE, 0x00, 0x18, 0x00, 0x50];
        let rows = u16::from_be_bytes([frame[1], frame[2]]);
        let cols = u16::from_be_bytes([frame[3], frame[4]]);
        assert_eq!((rows, cols), (24, 80));
    }

    #[test]
    fn upload_frame_layout() {
        let mut frame = vec![FRAME_UPLOAD, 0x00, 0x09];
        frame.extend_from_slice(b"hello.txt");
        frame.extend_from_slice(b"world");
        let name_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        assert_eq!(name_len, 9);
        assert_eq!(&frame[3..3 + name_len], b"hello.txt");
        assert_eq!(&frame[3 + name_len..], b"world");
    }

    #[test]
    fn control_messages_parse() {
        assert!(matches!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"ping","data":42}"#).unwrap(),
            ControlMessage::Ping { .. }
        ));
        assert!(matches!(
            serde_json::from_str::<ControlMessage>(
                r#"{"type":"chat","userName":"ann","text":"hi"}"#
            )
            .unwrap(),
            ControlMessage::Chat { .. }
        ));
        assert!(matches!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"toggle_yolo"}"#).unwrap(),
            ControlMessage::ToggleYolo
        ));
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"nope"}"#).is_err());
    }
}
