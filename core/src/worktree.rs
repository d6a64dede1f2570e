//! Git worktree management: derive a branch name from a session name, create
//! or re-enter the worktree for it, and seed fresh worktrees with the repo's
//! untracked config files. All git operations shell out to the `git` CLI;
//! failures are warnings; a session starts in the plain workspace rather
//! than not at all.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Derive a git branch name from a human session name.
///
/// NFD-decomposes and strips diacritics, lowercases, maps spaces to `-`,
/// replaces anything outside `[a-z0-9_./-]` with `-`, collapses runs of
/// `-`/`.`/`/`, strips leading dots per path segment and a trailing `.lock`,
/// then trims `-`, `/`, `.` from both ends. Idempotent and empty-safe.
pub fn derive_branch_name(name: &str) -> String {
    let mut mapped = String::with_capacity(name.len());
    for c in name.nfd().filter(|c| !is_combining_mark(*c)) {
        for lower in c.to_lowercase() {
            let replaced = match lower {
                ' ' => '-',
                'a'..='z' | '0'..='9' | '_' | '.' | '/' | '-' => lower,
                _ => '-',
            };
            // Collapse runs of separators as they are produced.
            if matches!(replaced, '-' | '.' | '/') && mapped.ends_with(replaced) {
                continue;
            }
            mapped.push(replaced);
        }
    }

    // Leading dots are invalid per path segment.
    let mut joined = mapped
        .split('/')
        .map(|seg| seg.trim_start_matches('.'))
        .collect::<Vec<_>>()
        .join("/");

    while let Some(stripped) = joined.strip_suffix(".lock") {
        joined = stripped.to_string();
    }

    joined
        .trim_matches(|c| matches!(c, '-' | '/' | '.'))
        .to_string()
}

/// Directory name for a branch's worktree: `/` becomes `--` to keep the
/// worktree root flat.
pub fn branch_dir_name(branch: &str) -> String {
    branch.replace('/', "--")
}

fn run_git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    std::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("git {}", args.join(" ")))
}

fn git_ok(repo: &Path, args: &[&str]) -> bool {
    run_git(repo, args).is_ok_and(|o| o.status.success())
}

/// Whether a local branch of this name exists.
pub fn local_branch_exists(repo: &Path, branch: &str) -> bool {
    git_ok(
        repo,
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
}

/// Whether `origin/{branch}` exists.
pub fn remote_branch_exists(repo: &Path, branch: &str) -> bool {
    git_ok(
        repo,
        &[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/remotes/origin/{branch}"),
        ],
    )
}

/// Conflict classification for `GET /api/worktree/check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchConflict {
    Worktree,
    Local,
    Remote,
    None,
}

pub fn check_conflict(repo: &Path, root: &Path, branch: &str) -> BranchConflict {
    if branch.is_empty() {
        return BranchConflict::None;
    }
    if root.join(branch_dir_name(branch)).exists() {
        BranchConflict::Worktree
    } else if local_branch_exists(repo, branch) {
        BranchConflict::Local
    } else if remote_branch_exists(repo, branch) {
        BranchConflict::Remote
    } else {
        BranchConflict::None
    }
}

/// Create or re-enter the worktree for `branch` under `root`.
///
/// Priority: existing directory is re-entered without touching git; an
/// existing local branch is attached; an `origin/` branch gets a tracking
/// worktree; otherwise a fresh branch is created. Fresh worktrees are seeded
/// with the repo's untracked config files afterwards.
pub fn create_worktree(repo: &Path, root: &Path, branch: &str) -> Result<PathBuf> {
    if branch.is_empty() {
        bail!("empty branch name");
    }
    let path = root.join(branch_dir_name(branch));
    if path.exists() {
        log::info!("re-entering worktree {}", path.display());
        return Ok(path);
    }
    std::fs::create_dir_all(root)?;
    let path_str = path.to_string_lossy().into_owned();

    let output = if local_branch_exists(repo, branch) {
        log::info!("worktree for existing branch {branch}");
        run_git(repo, &["worktree", "add", &path_str, branch])?
    } else if remote_branch_exists(repo, branch) {
        log::info!("tracking worktree for origin/{branch}");
        run_git(
            repo,
            &[
                "worktree",
                "add",
                "--track",
                "-b",
                branch,
                &path_str,
                &format!("origin/{branch}"),
            ],
        )?
    } else {
        log::info!("worktree with fresh branch {branch}");
        run_git(repo, &["worktree", "add", &path_str, "-b", branch])?
    };

    if !output.status.success() {
        bail!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    propagate_untracked(repo, &path);
    Ok(path)
}

/// Entries never propagated from the repo root.
const PROPAGATE_EXCLUDE: &[&str] = &[".git", ".swe-swe"];

/// Named files/directories propagated when untracked, in addition to `.env*`.
const PROPAGATE_NAMES: &[&str] = &[".claude", ".codex", ".aider.conf.yml", "CLAUDE.md", "AGENTS.md"];

fn is_tracked(repo: &Path, rel: &str) -> bool {
    git_ok(repo, &["ls-files", "--error-unmatch", rel])
}

/// Seed a fresh worktree with the repo's untracked dotfiles and agent config:
/// directories are symlinked, files copied. Only untracked entries move; the
/// `.swe-swe/docs` tree is linked under the worktree's own `.swe-swe`.
/// Failures warn and continue, never aborting worktree creation.
pub fn propagate_untracked(repo: &Path, worktree: &Path) {
    let Ok(entries) = std::fs::read_dir(repo) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if PROPAGATE_EXCLUDE.contains(&name) {
            continue;
        }
        let wanted = name.starts_with(".env") || PROPAGATE_NAMES.contains(&name);
        if !wanted || is_tracked(repo, name) {
            continue;
        }
        link_or_copy(&entry.path(), &worktree.join(name));
    }

    let docs = repo.join(".swe-swe").join("docs");
    if docs.is_dir() {
        let dest_parent = worktree.join(".swe-swe");
        if let Err(e) = std::fs::create_dir_all(&dest_parent) {
            log::warn!("propagate {}: {e}", dest_parent.display());
            return;
        }
        link_or_copy(&docs, &dest_parent.join("docs"));
    }
}

fn link_or_copy(src: &Path, dest: &Path) {
    if dest.exists() {
        return;
    }
    let result = if src.is_dir() {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(src, dest)
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    } else {
        std::fs::copy(src, dest).map(|_| ())
    };
    match result {
        Ok(()) => log::info!("propagated {} -> {}", src.display(), dest.display()),
        Err(e) => log::warn!("propagate {}: {e}", src.display()),
    }
}

/// One directory under the worktree root.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorktreeInfo {
    pub dir_name: String,
    pub path: String,
    pub branch: String,
}

/// All worktree directories under `root`, newest layout knowledge applied:
/// the branch is the directory name with `--` mapped back to `/`.
pub fn list_worktrees(root: &Path) -> Vec<WorktreeInfo> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out: Vec<WorktreeInfo> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let dir_name = e.file_name().to_str()?.to_string();
            Some(WorktreeInfo {
                branch: dir_name.replace("--", "/"),
                path: e.path().to_string_lossy().into_owned(),
                dir_name,
            })
        })
        .collect();
    out.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_basic_names() {
        assert_eq!(derive_branch_name("feature x"), "feature-x");
        assert_eq!(derive_branch_name("feature/x"), "feature/x");
        assert_eq!(derive_branch_name("Fix: crash!!"), "fix-crash");
        assert_eq!(derive_branch_name(""), "");
    }

    #[test]
    fn derive_strips_diacritics() {
        assert_eq!(derive_branch_name("Café Münü"), "cafe-munu");
    }

    #[test]
    fn derive_collapses_separator_runs() {
        assert_eq!(derive_branch_name("a///b...c---d"), "a/b.c-d");
    }

    #[test]
    fn derive_strips_leading_dots_and_lock() {
        assert_eq!(derive_branch_name(".hidden/.deep"), "hidden/deep");
        assert_eq!(derive_branch_name("thing.lock"), "thing");
    }

    #[test]
    fn derive_is_idempotent() {
        for name in [
            "feature x",
            "feature/x",
            "Café Münü",
            "a///b...c---d",
            ".hidden/.deep",
            "--weird--",
            "..",
            "branch.lock",
        ] {
            let once = derive_branch_name(name);
            assert_eq!(derive_branch_name(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn derive_output_is_git_valid() {
        for name in ["feature x", "..", "a//..//b", ".lock", "Ünïcode name!"] {
            let branch = derive_branch_name(name);
            if branch.is_empty() {
                continue;
            }
            assert!(!branch.contains(".."), "{branch:?}");
            assert!(!branch.starts_with('/') && !branch.starts_with('.'), "{branch:?}");
            assert!(!branch.ends_with(".lock"), "{branch:?}");
        }
    }

    #[test]
    fn dir_name_flattens_slashes() {
        assert_eq!(branch_dir_name("feature/x"), "feature--x");
        assert_eq!(branch_dir_name("plain"), "plain");
    }

    #[test]
    fn list_worktrees_maps_branch_back() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("feature--x")).unwrap();
        std::fs::create_dir(root.path().join("plain")).unwrap();
        let list = list_worktrees(root.path());
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].branch, "feature/x");
        assert_eq!(list[1].branch, "plain");
    }

    fn init_repo(dir: &Path) -> bool {
        let ok = |args: &[&str]| git_ok(dir, args);
        if !ok(&["init", "-q", "-b", "main"]) {
            return false;
        }
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        ok(&["add", "."])
            && ok(&["-c", "user.email=t@t", "-c", "user.name=t", "commit", "-q", "-m", "init"])
    }

    #[test]
    fn worktree_reentry_and_fresh_branch() {
        let repo = tempfile::tempdir().unwrap();
        if !init_repo(repo.path()) {
            return; // no usable git on this host
        }
        let root = tempfile::tempdir().unwrap();

        let path = create_worktree(repo.path(), root.path(), "feature/x").unwrap();
        assert_eq!(path, root.path().join("feature--x"));
        assert!(path.join(".git").is_file());
        assert!(local_branch_exists(repo.path(), "feature/x"));

        // Second call re-enters without invoking git.
        let again = create_worktree(repo.path(), root.path(), "feature/x").unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn conflict_classification() {
        let repo = tempfile::tempdir().unwrap();
        if !init_repo(repo.path()) {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            check_conflict(repo.path(), root.path(), "nothing"),
            BranchConflict::None
        );
        assert!(git_ok(repo.path(), &["branch", "existing"]));
        assert_eq!(
            check_conflict(repo.path(), root.path(), "existing"),
            BranchConflict::Local
        );
        std::fs::create_dir(root.path().join("taken")).unwrap();
        assert_eq!(
            check_conflict(repo.path(), root.path(), "taken"),
            BranchConflict::Worktree
        );
    }

    #[test]
    fn propagation_copies_untracked_env() {
        let repo = tempfile::tempdir().unwrap();
        if !init_repo(repo.path()) {
            return;
        }
        std::fs::write(repo.path().join(".env.local"), "SECRET=1").unwrap();
        std::fs::create_dir(repo.path().join(".claude")).unwrap();
        let root = tempfile::tempdir().unwrap();
        let path = create_worktree(repo.path(), root.path(), "seeded").unwrap();
        assert_eq!(
            std::fs::read_to_string(path.join(".env.local")).unwrap(),
            "SECRET=1"
        );
        assert!(path.join(".claude").exists());
        // Tracked files are git's business, not propagation's.
        assert!(path.join("README.md").exists()); // via checkout
    }
}
