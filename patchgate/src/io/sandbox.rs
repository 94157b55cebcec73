//! Disposable, detached git worktrees for validating changes.
//!
//! A sandbox lives exactly as long as one callback. Teardown runs from a
//! `Drop` guard, so it happens on normal return, on callback error and on
//! panic unwinding alike.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::git::Git;

/// Failure to create a sandbox. Errors raised by the callback are never mapped here.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("not inside a git repository: {}", path.display())]
    NotARepository {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("create sandbox temp dir: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("git worktree add at '{reference}' failed: {}", stderr.trim())]
    Setup {
        reference: String,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

/// Handle passed to the sandbox callback.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Absolute path of the isolated working copy.
    pub path: PathBuf,
    /// Reference the working copy was created from, as given.
    pub reference: String,
    /// Commit id `reference` resolved to.
    pub commit: String,
}

/// Factory for sandboxes rooted at one repository.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    git: Git,
}

impl Sandbox {
    /// Resolve the repository containing `dir`.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self, SandboxError> {
        let root = Git::new(dir)
            .toplevel()
            .map_err(|source| SandboxError::NotARepository {
                path: dir.to_path_buf(),
                source,
            })?;
        Ok(Self {
            git: Git::new(&root),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` against a fresh detached worktree at `reference`.
    ///
    /// Returns `Err` only when the worktree could not be created; whatever `f`
    /// returns is passed through untouched.
    #[instrument(skip_all, fields(reference))]
    pub fn with_worktree<T>(
        &self,
        reference: &str,
        f: impl FnOnce(&SandboxHandle) -> T,
    ) -> Result<T, SandboxError> {
        let temp = tempfile::Builder::new()
            .prefix("patchgate-sandbox-")
            .tempdir()
            .map_err(SandboxError::TempDir)?;
        let path = temp.path().join("wt");

        let added = self.git.worktree_add_detached(&path, reference)?;
        if !added.ok {
            // A half-created worktree may have left an admin entry behind.
            if let Err(err) = self.git.worktree_prune() {
                warn!(err = %err, "prune after failed worktree add");
            }
            return Err(SandboxError::Setup {
                reference: reference.to_string(),
                stdout: added.stdout,
                stderr: added.stderr,
            });
        }

        let guard = WorktreeGuard {
            git: self.git.clone(),
            path: path.clone(),
            temp: Some(temp),
        };
        let commit = Git::new(&path).resolve_commit("HEAD")?;
        debug!(path = %path.display(), commit = %commit, "sandbox ready");

        let handle = SandboxHandle {
            path,
            reference: reference.to_string(),
            commit,
        };
        let result = f(&handle);
        drop(guard);
        Ok(result)
    }
}

struct WorktreeGuard {
    git: Git,
    path: PathBuf,
    temp: Option<TempDir>,
}

impl Drop for WorktreeGuard {
    fn drop(&mut self) {
        if let Err(err) = self.git.worktree_remove(&self.path) {
            warn!(err = %err, path = %self.path.display(), "git worktree remove failed");
        }
        if let Some(temp) = self.temp.take() {
            let temp_path = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                warn!(err = %err, path = %temp_path.display(), "remove sandbox temp dir");
            }
        }
        if let Err(err) = self.git.worktree_prune() {
            warn!(err = %err, "git worktree prune failed");
        }
        debug!(path = %self.path.display(), "sandbox torn down");
    }
}
