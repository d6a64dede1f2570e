//! swe-swe server binary. Run with --port / --preview-port, or use defaults.

use common::session::SessionStore;
use common::{agent, config};

const DEFAULT_PORT: u16 = 9898;
const DEFAULT_PREVIEW_PORT: u16 = 9899;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = config::ensure_loaded();

    let mut port = DEFAULT_PORT;
    let mut preview_port = DEFAULT_PREVIEW_PORT;
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
            i += 2;
            continue;
        }
        if args[i] == "--preview-port" && i + 1 < args.len() {
            preview_port = args[i + 1].parse().unwrap_or(DEFAULT_PREVIEW_PORT);
            i += 2;
            continue;
        }
        i += 1;
    }

    let agents = agent::detect_agents();
    if agents.is_empty() {
        log::error!("no assistants detected on this host");
        std::process::exit(1);
    }
    log::info!(
        "assistants: {}",
        agents.iter().map(|a| a.key).collect::<Vec<_>>().join(", ")
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = SessionStore::new(config::recordings_dir());
        store.spawn_reaper();

        if let Some(target_port) = cfg.preview_target_port {
            tokio::spawn(async move {
                if let Err(e) = server::run_preview_proxy(preview_port, target_port).await {
                    log::error!("preview proxy: {e}");
                }
            });
        }

        if let Err(e) = server::run_web_server(port, store).await {
            log::error!("server: {e}");
            std::process::exit(1);
        }
        Ok(())
    })
}
