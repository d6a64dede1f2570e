//! Global config singleton. Read the environment once; the server and the
//! preview proxy both call `ensure_loaded()` so the first caller does the work,
//! later callers get the same instance.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached process configuration from the environment.
pub struct Config {
    /// Login shell used by the `shell` assistant (`$SHELL`, fallback /bin/bash).
    pub shell: String,
    /// Preview proxy upstream port. The proxy listener only starts when set.
    pub preview_target_port: Option<u16>,
    /// Location of the local CA certificate served at /ssl/ca.crt.
    pub tls_cert_path: Option<PathBuf>,
    /// Startup command for the `custom` assistant; the assistant is hidden when unset.
    pub custom_agent_command: Option<String>,
    /// Server working directory. Sessions without a worktree run here.
    pub work_dir: PathBuf,
}

/// Ensure config is loaded (idempotent). Reads the environment on first call;
/// returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load_from_env)
}

fn load_from_env() -> Config {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string());

    let preview_target_port = std::env::var("PREVIEW_TARGET_PORT")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok());

    let tls_cert_path = std::env::var("TLS_CERT_PATH")
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty());

    let custom_agent_command = std::env::var("SWE_SWE_CUSTOM_COMMAND")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let work_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/workspace"));

    Config {
        shell,
        preview_target_port,
        tls_cert_path,
        custom_agent_command,
        work_dir,
    }
}

/// Directory holding recording triples (`session-{uuid}.{log,timing,metadata.json}`).
pub fn recordings_dir() -> PathBuf {
    ensure_loaded().work_dir.join(".swe-swe").join("recordings")
}

/// Directory receiving browser file uploads.
pub fn uploads_dir() -> PathBuf {
    ensure_loaded().work_dir.join(".swe-swe").join("uploads")
}

/// Root directory for session worktrees: a sibling of the repo so git never
/// sees nested worktrees (`/workspace` -> `/workspace-worktrees`).
pub fn worktree_root() -> PathBuf {
    let work = &ensure_loaded().work_dir;
    let name = work
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());
    work.parent()
        .map(|p| p.join(format!("{name}-worktrees")))
        .unwrap_or_else(|| PathBuf::from(format!("/{name}-worktrees")))
}
