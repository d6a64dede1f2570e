//! Axum HTTP server: homepage, session pages, the terminal WebSocket,
//! recording APIs (list/keep/delete/download/playback), worktree APIs, and
//! the CA certificate download. The preview proxy runs on its own listener
//! (see `proxy`).

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use common::session::SessionStore;
use common::{agent, config, recording, worktree};

use crate::pages;
use crate::ws;

/// Shared app state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
}

/// Runs the main HTTP server. Binds all interfaces; authentication is the
/// upstream reverse proxy's job.
pub async fn run_web_server(port: u16, store: Arc<SessionStore>) -> anyhow::Result<()> {
    let state = AppState { store };
    let app = Router::new()
        .route("/", get(homepage_handler))
        .route("/session/{uuid}", get(session_page_handler))
        .route("/ws/{uuid}", get(ws::ws_handler))
        .route("/recording/{uuid}", get(playback_handler))
        .route("/recording/{uuid}/session.log", get(raw_log_handler))
        .route("/api/recording/list", get(list_recordings_handler))
        .route("/api/recording/{uuid}", delete(delete_recording_handler))
        .route("/api/recording/{uuid}/keep", post(keep_recording_handler))
        .route("/api/recording/{uuid}/download", get(download_recording_handler))
        .route("/api/worktrees", get(list_worktrees_handler))
        .route("/api/worktree/check", get(worktree_check_handler))
        .route("/ssl/ca.crt", get(ca_cert_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("swe-swe listening on http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn html(body: String) -> Response {
    (
        [("Content-Type", "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn homepage_handler(State(state): State<AppState>) -> Response {
    let agents = agent::detect_agents();
    let sessions = state.store.all();
    let store = Arc::clone(&state.store);
    let recordings =
        recording::list_recordings(state.store.recordings_dir(), &move |uuid| {
            store.is_recording_running(uuid)
        });
    html(pages::homepage(&agents, &sessions, &recordings))
}

#[derive(serde::Deserialize)]
struct SessionPageQuery {
    assistant: Option<String>,
    #[allow(dead_code)]
    name: Option<String>,
}

/// Session page. Validates the assistant and redirects when the session
/// already runs a different one, so a stale link can't mislabel a terminal.
async fn session_page_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<SessionPageQuery>,
) -> Response {
    let Some(assistant) = query.assistant.filter(|a| !a.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "assistant is required").into_response();
    };
    if agent::find(&assistant).is_none() {
        return (StatusCode::BAD_REQUEST, format!("unknown assistant {assistant}"))
            .into_response();
    }
    if let Some(existing) = state.store.get(&uuid) {
        if existing.agent.key != assistant {
            return Redirect::to(&format!(
                "/session/{uuid}?assistant={}",
                existing.agent.key
            ))
            .into_response();
        }
    }
    let title = format!("{assistant} — swe-swe");
    html(pages::session_page(&uuid, &title))
}

// ── Recordings ───────────────────────────────────────────────────────────────

async fn list_recordings_handler(State(state): State<AppState>) -> Response {
    let store = Arc::clone(&state.store);
    let list = recording::list_recordings(state.store.recordings_dir(), &move |uuid| {
        store.is_recording_running(uuid)
    });
    Json(list).into_response()
}

async fn playback_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> Response {
    let dir = state.store.recordings_dir();
    let Ok(log) = std::fs::read(recording::log_path(dir, &uuid)) else {
        return (StatusCode::NOT_FOUND, "recording not found").into_response();
    };
    let meta = recording::load_metadata(dir, &uuid);
    let (cols, rows) = meta
        .as_ref()
        .and_then(|m| Some((m.playback_cols?, m.playback_rows?)))
        .unwrap_or_else(|| recording::playback_dims(&log));

    if query.get("render").map(String::as_str) == Some("streaming") {
        let timing = std::fs::read_to_string(recording::timing_path(dir, &uuid))
            .unwrap_or_default();
        return html(pages::playback_streaming(&uuid, cols, rows, &timing));
    }
    html(pages::playback_embedded(&uuid, cols, rows, &log))
}

async fn raw_log_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Response {
    match std::fs::read(recording::log_path(state.store.recordings_dir(), &uuid)) {
        Ok(log) => (
            [("Content-Type", "application/octet-stream")],
            log,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "recording not found").into_response(),
    }
}

/// Delete the triple; 409 while the session is still live.
async fn delete_recording_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Response {
    if state.store.is_recording_running(&uuid) {
        return (StatusCode::CONFLICT, "recording is active").into_response();
    }
    let dir = state.store.recordings_dir();
    if !recording::log_path(dir, &uuid).exists()
        && recording::load_metadata(dir, &uuid).is_none()
    {
        return (StatusCode::NOT_FOUND, "recording not found").into_response();
    }
    recording::delete_recording(dir, &uuid);
    StatusCode::NO_CONTENT.into_response()
}

async fn keep_recording_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Response {
    match recording::keep_recording(state.store.recordings_dir(), &uuid) {
        Ok(already_kept) => Json(serde_json::json!({
            "kept": true,
            "already_kept": already_kept,
        }))
        .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// Zip the recording triple, including only the files that exist.
pub fn zip_recording(dir: &std::path::Path, uuid: &str) -> anyhow::Result<Vec<u8>> {
    let sources = [
        (recording::log_path(dir, uuid), "session.log"),
        (recording::timing_path(dir, uuid), "session.timing"),
        (recording::metadata_path(dir, uuid), "session.metadata.json"),
    ];
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options: zip::write::SimpleFileOptions = zip::write::SimpleFileOptions::default();
    let mut wrote_any = false;
    for (path, archive_name) in sources {
        let Ok(contents) = std::fs::read(&path) else {
            continue;
        };
        writer.start_file(archive_name, options)?;
        writer.write_all(&contents)?;
        wrote_any = true;
    }
    if !wrote_any {
        anyhow::bail!("recording not found");
    }
    Ok(writer.finish()?.into_inner())
}

async fn download_recording_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Response {
    match zip_recording(state.store.recordings_dir(), &uuid) {
        Ok(archive) => Response::builder()
            .header("Content-Type", "application/zip")
            .header(
                "Content-Disposition",
                format!("attachment; filename=\"session-{uuid}.zip\""),
            )
            .body(Body::from(archive))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

// ── Worktrees ────────────────────────────────────────────────────────────────

async fn list_worktrees_handler(State(state): State<AppState>) -> Response {
    let worktrees = worktree::list_worktrees(&config::worktree_root());
    let by_branch = pages::sessions_by_branch(&state.store.all());
    let annotated: Vec<serde_json::Value> = worktrees
        .into_iter()
        .map(|w| {
            serde_json::json!({
                "dir_name": w.dir_name,
                "path": w.path,
                "branch": w.branch,
                "session_uuid": by_branch.get(&w.branch),
            })
        })
        .collect();
    Json(annotated).into_response()
}

#[derive(serde::Deserialize)]
struct WorktreeCheckQuery {
    name: Option<String>,
}

async fn worktree_check_handler(Query(query): Query<WorktreeCheckQuery>) -> Response {
    let name = query.name.unwrap_or_default();
    let branch = worktree::derive_branch_name(&name);
    let conflict = worktree::check_conflict(
        &config::ensure_loaded().work_dir,
        &config::worktree_root(),
        &branch,
    );
    Json(serde_json::json!({
        "name": name,
        "branch": branch,
        "conflict": conflict,
    }))
    .into_response()
}

// ── SSL ──────────────────────────────────────────────────────────────────────

/// Serve the local CA certificate for mobile trust-store install.
async fn ca_cert_handler() -> Response {
    let Some(path) = config::ensure_loaded().tls_cert_path.as_ref() else {
        return (StatusCode::NOT_FOUND, "TLS_CERT_PATH not configured").into_response();
    };
    match tokio::fs::read(path).await {
        Ok(cert) => (
            [("Content-Type", "application/x-x509-ca-cert")],
            cert,
        )
            .into_response(),
        Err(e) => {
            log::warn!("ca.crt read {}: {e}", path.display());
            (StatusCode::NOT_FOUND, "certificate unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn zip_contains_only_existing_members() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(recording::log_path(dir.path(), "z1"), b"logdata").unwrap();
        std::fs::write(recording::timing_path(dir.path(), "z1"), b"0.1 7\n").unwrap();
        // no metadata on purpose
        let bytes = zip_recording(dir.path(), "z1").unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["session.log", "session.timing"]);

        let mut log = String::new();
        archive
            .by_name("session.log")
            .unwrap()
            .read_to_string(&mut log)
            .unwrap();
        assert_eq!(log, "logdata");
    }

    #[test]
    fn zip_missing_recording_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(zip_recording(dir.path(), "nope").is_err());
    }
}
