//! Assistant registry: the static table of supported coding agents, filtered
//! at startup by which binaries are actually installed. Each entry carries the
//! argv variants a session may need (startup, fresh start, resume, YOLO resume)
//! plus display metadata for the homepage and MOTD.

use crate::config;

/// One supported assistant. A sum-of-products record, not a trait object:
/// sessions only ever need the argv for the current mode plus display strings.
#[derive(Debug)]
pub struct AgentConfig {
    /// Binary key used in URLs, metadata, and recording grouping.
    pub key: &'static str,
    /// Human name shown on the homepage and in status messages.
    pub display_name: &'static str,
    /// Executable probed on PATH to decide availability.
    pub binary: &'static str,
    /// Default startup argv.
    pub startup: &'static [&'static str],
    /// Fresh-start argv (never resumes a prior conversation).
    pub fresh: &'static [&'static str],
    /// Resume argv used when respawning in place.
    pub resume: &'static [&'static str],
    /// Permission-bypass resume argv; empty slice means YOLO is unsupported.
    pub yolo_resume: &'static [&'static str],
    /// Where the agent discovers project slash commands; empty if it has none.
    pub slash_format: &'static str,
    /// One-line blurb for the homepage card.
    pub homepage: &'static str,
}

impl AgentConfig {
    /// Whether this assistant has a permission-bypass resume command.
    pub fn yolo_supported(&self) -> bool {
        !self.yolo_resume.is_empty()
    }
}

static AGENTS: &[AgentConfig] = &[
    AgentConfig {
        key: "claude",
        display_name: "Claude Code",
        binary: "claude",
        startup: &["claude"],
        fresh: &["claude"],
        resume: &["claude", "--continue"],
        yolo_resume: &["claude", "--dangerously-skip-permissions", "--continue"],
        slash_format: ".claude/commands/*.md",
        homepage: "Anthropic's terminal coding agent",
    },
    AgentConfig {
        key: "gemini",
        display_name: "Gemini CLI",
        binary: "gemini",
        startup: &["gemini"],
        fresh: &["gemini"],
        resume: &["gemini"],
        yolo_resume: &["gemini", "--yolo"],
        slash_format: ".gemini/commands/*.toml",
        homepage: "Google's terminal coding agent",
    },
    AgentConfig {
        key: "codex",
        display_name: "Codex CLI",
        binary: "codex",
        startup: &["codex"],
        fresh: &["codex"],
        resume: &["codex", "resume", "--last"],
        yolo_resume: &["codex", "--dangerously-bypass-approvals-and-sandbox", "resume", "--last"],
        slash_format: ".codex/prompts/*.md",
        homepage: "OpenAI's terminal coding agent",
    },
    AgentConfig {
        key: "aider",
        display_name: "Aider",
        binary: "aider",
        startup: &["aider"],
        fresh: &["aider"],
        resume: &["aider", "--restore-chat-history"],
        yolo_resume: &["aider", "--yes-always", "--restore-chat-history"],
        slash_format: "",
        homepage: "AI pair programming in your terminal",
    },
    AgentConfig {
        key: "goose",
        display_name: "Goose",
        binary: "goose",
        startup: &["goose", "session"],
        fresh: &["goose", "session"],
        resume: &["goose", "session", "--resume"],
        yolo_resume: &[],
        slash_format: "",
        homepage: "Block's open-source coding agent",
    },
    AgentConfig {
        key: "opencode",
        display_name: "OpenCode",
        binary: "opencode",
        startup: &["opencode"],
        fresh: &["opencode"],
        resume: &["opencode", "--continue"],
        yolo_resume: &[],
        slash_format: ".opencode/command/*.md",
        homepage: "Open-source terminal coding agent",
    },
    AgentConfig {
        key: "shell",
        display_name: "Shell",
        binary: "",
        startup: &[],
        fresh: &[],
        resume: &[],
        yolo_resume: &[],
        slash_format: "",
        homepage: "Plain login shell",
    },
    AgentConfig {
        key: "custom",
        display_name: "Custom",
        binary: "",
        startup: &[],
        fresh: &[],
        resume: &[],
        yolo_resume: &[],
        slash_format: "",
        homepage: "Command from SWE_SWE_CUSTOM_COMMAND",
    },
];

/// True if `binary` resolves to an executable file on PATH.
fn binary_on_path(binary: &str) -> bool {
    if binary.is_empty() {
        return false;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file()
    })
}

/// All assistants usable on this host: `shell` always, `custom` when a command
/// is configured, everything else when its binary is installed.
pub fn detect_agents() -> Vec<&'static AgentConfig> {
    AGENTS
        .iter()
        .filter(|a| match a.key {
            "shell" => true,
            "custom" => config::ensure_loaded().custom_agent_command.is_some(),
            _ => binary_on_path(a.binary),
        })
        .collect()
}

/// Look up an assistant by its binary key, detected or not.
pub fn find(key: &str) -> Option<&'static AgentConfig> {
    AGENTS.iter().find(|a| a.key == key)
}

/// Look up an assistant by display name (recording metadata stores the
/// display name; retention groups by binary key).
pub fn find_by_display_name(name: &str) -> Option<&'static AgentConfig> {
    AGENTS.iter().find(|a| a.display_name == name)
}

/// Colorized one-screen banner written into the PTY stream when a session
/// starts, advertising the assistant's slash-command discovery.
pub fn motd(agent: &AgentConfig) -> Vec<u8> {
    let mut banner = String::new();
    banner.push_str("\r\n\x1b[1;36m");
    banner.push_str(agent.display_name);
    banner.push_str("\x1b[0m \x1b[90m— shared terminal session\x1b[0m\r\n");
    if !agent.slash_format.is_empty() {
        banner.push_str("\x1b[90mProject slash commands are read from \x1b[33m");
        banner.push_str(agent.slash_format);
        banner.push_str("\x1b[90m — type \x1b[33m/\x1b[90m to discover them.\x1b[0m\r\n");
    }
    if agent.yolo_supported() {
        banner.push_str(
            "\x1b[90mToggle YOLO in the toolbar to restart with permission prompts bypassed.\x1b[0m\r\n",
        );
    }
    banner.push_str("\r\n");
    banner.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_known_keys() {
        for key in ["claude", "gemini", "codex", "aider", "goose", "opencode", "shell", "custom"] {
            assert!(find(key).is_some(), "missing agent {key}");
        }
        assert!(find("vim").is_none());
    }

    #[test]
    fn display_name_roundtrip() {
        let claude = find("claude").unwrap();
        assert_eq!(
            find_by_display_name(claude.display_name).unwrap().key,
            "claude"
        );
    }

    #[test]
    fn yolo_support_matches_table() {
        assert!(find("claude").unwrap().yolo_supported());
        assert!(!find("shell").unwrap().yolo_supported());
        assert!(!find("goose").unwrap().yolo_supported());
    }

    #[test]
    fn motd_mentions_slash_discovery() {
        let banner = motd(find("claude").unwrap());
        let text = String::from_utf8(banner).unwrap();
        assert!(text.contains("Claude Code"));
        assert!(text.contains(".claude/commands"));
    }

    #[test]
    fn shell_always_detected() {
        assert!(detect_agents().iter().any(|a| a.key == "shell"));
    }
}
