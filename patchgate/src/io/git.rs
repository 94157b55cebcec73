//! Git adapter for the pipeline.
//!
//! Sandboxes, dry-runs and promotion all go through `git` subprocess calls, so
//! we keep a small, explicit wrapper around them.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::ToolOutput;
use crate::io::process::run_command_with_timeout;

/// Upper bound for a single `git apply` invocation.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
/// Diagnostics kept from `git apply` per stream.
pub const APPLY_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve the top-level directory of the repository containing `workdir`.
    #[instrument(skip_all)]
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        let root = PathBuf::from(out.trim());
        debug!(root = %root.display(), "resolved repository root");
        Ok(root)
    }

    /// Resolve `reference` to a full commit id.
    pub fn resolve_commit(&self, reference: &str) -> Result<String> {
        let spec = format!("{reference}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Add a detached worktree at `path` checked out at `reference`.
    ///
    /// Returns the raw tool output so callers can surface git's diagnostics.
    #[instrument(skip_all, fields(reference))]
    pub fn worktree_add_detached(&self, path: &Path, reference: &str) -> Result<ToolOutput> {
        let path_arg = path.to_string_lossy();
        let output = self.run(&["worktree", "add", "--detach", &path_arg, reference])?;
        Ok(tool_output(output))
    }

    /// Force-remove a worktree previously added from this repository.
    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// `git apply --check`: validate that `diff` applies without touching the tree.
    #[instrument(skip_all)]
    pub fn apply_check(&self, diff: &str) -> Result<ToolOutput> {
        self.apply_stdin(&["apply", "--check", "-"], diff)
    }

    /// `git apply`: apply `diff` to the working tree.
    #[instrument(skip_all)]
    pub fn apply(&self, diff: &str) -> Result<ToolOutput> {
        self.apply_stdin(&["apply", "-"], diff)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at `start_point`.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Push `branch` to `remote` and set upstream tracking.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "pushing branch");
        self.run_checked(&["push", "--set-upstream", remote, branch])?;
        Ok(())
    }

    fn apply_stdin(&self, args: &[&str], diff: &str) -> Result<ToolOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(diff.as_bytes()),
            APPLY_TIMEOUT,
            APPLY_OUTPUT_LIMIT_BYTES,
        )
        .with_context(|| format!("run git {}", args.join(" ")))?;
        Ok(output.into_tool_output("git apply"))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn tool_output(output: Output) -> ToolOutput {
    ToolOutput {
        ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn apply_check_leaves_tree_untouched() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let report = git
            .apply_check(&repo.readme_append_diff("checked"))
            .expect("apply --check");
        assert!(report.ok, "stderr: {}", report.stderr);
        git.ensure_clean_except_prefixes(&[]).expect("still clean");

        let report = git
            .apply(&repo.readme_append_diff("applied"))
            .expect("apply");
        assert!(report.ok, "stderr: {}", report.stderr);
        assert!(repo.read("README.md").contains("applied"));
    }

    #[test]
    fn apply_check_reports_diagnostics_for_bad_diff() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let diff = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let report = git.apply_check(diff).expect("apply --check");
        assert!(!report.ok);
        assert!(report.stderr.contains("missing.txt"), "stderr: {}", report.stderr);
    }

    #[test]
    fn resolves_toplevel_and_head() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let root = git.toplevel().expect("toplevel");
        assert_eq!(
            root.canonicalize().expect("canon"),
            repo.path().canonicalize().expect("canon")
        );
        assert_eq!(git.resolve_commit("HEAD").expect("head").len(), 40);
    }
}
