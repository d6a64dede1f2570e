//! Portable PTY layer: spawn an assistant (or shell) under a pseudoterminal
//! and bridge its output to the async side. One blocking reader thread per
//! child feeds an mpsc channel; the session pump consumes it. Input goes
//! through a mutex-guarded writer so concurrent clients cannot interleave
//! partial writes.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::agent::AgentConfig;
use crate::config;

/// Default terminal size applied before any client reports its own.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Scratch size for each PTY read.
const READ_BUF_BYTES: usize = 4096;

/// Build the spawn command for an assistant from the chosen argv variant.
/// `shell` substitutes `$SHELL -l` at spawn time; `custom` runs its configured
/// command line through `$SHELL -c`.
pub fn command_for(agent: &AgentConfig, argv: &[String], cwd: &Path) -> CommandBuilder {
    let cfg = config::ensure_loaded();
    let mut cmd = match agent.key {
        "shell" => {
            let mut c = CommandBuilder::new(&cfg.shell);
            c.arg("-l");
            c
        }
        "custom" => {
            let line = cfg
                .custom_agent_command
                .clone()
                .unwrap_or_else(|| cfg.shell.clone());
            let mut c = CommandBuilder::new(&cfg.shell);
            c.arg("-c");
            c.arg(line);
            c
        }
        _ => {
            let mut it = argv.iter();
            let mut c = match it.next() {
                Some(bin) => CommandBuilder::new(bin),
                None => CommandBuilder::new(&cfg.shell),
            };
            for arg in it {
                c.arg(arg);
            }
            c
        }
    };
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd
}

/// The argv a spawn will actually use, for recording metadata.
pub fn display_argv(agent: &AgentConfig, argv: &[String]) -> Vec<String> {
    let cfg = config::ensure_loaded();
    match agent.key {
        "shell" => vec![cfg.shell.clone(), "-l".to_string()],
        "custom" => vec![
            cfg.shell.clone(),
            "-c".to_string(),
            cfg.custom_agent_command.clone().unwrap_or_default(),
        ],
        _ => argv.to_vec(),
    }
}

/// One spawned child under a PTY: writer for stdin, master kept for resize,
/// child handle for kill/wait. The reader thread owns the master's read half.
pub struct PtyHandle {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Resize the PTY (rows, cols). Clamped to at least 1x1.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self.master.lock().expect("master mutex");
        master
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("pty resize: {e}"))
    }

    /// Write bytes to the child's terminal input.
    pub fn write_input(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().expect("writer mutex");
        w.write_all(bytes)?;
        w.flush()
    }

    /// True while the child has not exited.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().expect("child mutex");
        matches!(child.try_wait(), Ok(None))
    }

    /// Hard-kill the child (SIGKILL).
    pub fn kill(&self) {
        let mut child = self.child.lock().expect("child mutex");
        let _ = child.kill();
    }

    /// Deliver SIGTERM so the agent can shut down cleanly before a respawn.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        } else {
            self.kill();
        }
    }

    /// Block until the child is reaped; returns its exit code.
    /// Call from `spawn_blocking`; this parks the thread.
    pub fn wait_exit(&self) -> u32 {
        let mut child = self.child.lock().expect("child mutex");
        match child.wait() {
            Ok(status) => status.exit_code(),
            Err(_) => 1,
        }
    }
}

/// Spawn `cmd` under a fresh PTY sized 24x80. Returns the handle and the
/// output byte stream; the blocking reader thread ends at child EOF.
pub fn spawn_pty(cmd: CommandBuilder) -> Result<(PtyHandle, mpsc::Receiver<Vec<u8>>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("openpty: {e}"))?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("spawn: {e}"))?;
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("clone reader: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow::anyhow!("take writer: {e}"))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);

    // Blocking thread: read PTY output and hand chunks to the async pump.
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle = PtyHandle {
        writer: Arc::new(Mutex::new(writer)),
        master: Mutex::new(pair.master),
        child: Arc::new(Mutex::new(child)),
        pid,
    };
    Ok((handle, rx))
}

/// Convenience used by tests and ad-hoc spawns: run an argv in `cwd`.
pub fn spawn_argv(argv: &[&str], cwd: &Path) -> Result<(PtyHandle, mpsc::Receiver<Vec<u8>>)> {
    let mut it = argv.iter();
    let mut cmd = CommandBuilder::new(it.next().context("empty argv")?);
    for arg in it {
        cmd.arg(arg);
    }
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    spawn_pty(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent;

    #[tokio::test]
    async fn spawn_echo_and_collect_output() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut rx) = spawn_argv(&["echo", "hello-pty"], dir.path()).unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hello-pty"), "got: {text:?}");
        let _ = tokio::task::spawn_blocking(move || handle.wait_exit()).await;
    }

    #[tokio::test]
    async fn kill_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut rx) = spawn_argv(&["sleep", "60"], dir.path()).unwrap();
        handle.kill();
        while rx.recv().await.is_some() {}
        let code = tokio::task::spawn_blocking(move || handle.wait_exit())
            .await
            .unwrap();
        assert_ne!(code, 0);
    }

    #[test]
    fn display_argv_substitutes_shell() {
        let shell = agent::find("shell").unwrap();
        let argv = display_argv(shell, &[]);
        assert_eq!(argv[1], "-l");
    }
}
