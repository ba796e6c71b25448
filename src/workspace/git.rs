//! Git command-shelling helpers backing the workspace manager. Talks to
//! `git worktree` via `std::process::Command`, the same way the rest of
//! this codebase shells out to version-control tools rather than linking
//! `libgit2`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{DroverError, Result};

/// Thin wrapper around a single git repository root, used by both the
/// workspace manager (per-task worktrees) and the merge-to-trunk path.
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `git <args>` in the repo root, returning stdout trimmed. Errors
    /// wrap the command line and captured stderr.
    pub fn git_stdout(&self, args: &[&str]) -> Result<String> {
        self.git_stdout_in(&self.root, args)
    }

    /// As [`Self::git_stdout`], but run in an arbitrary directory (e.g. a
    /// worktree checkout rather than the main repo root).
    pub fn git_stdout_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| DroverError::WorkspaceError {
                command: format!("git {}", args.join(" ")),
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(DroverError::WorkspaceError {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Run `git <args>` for side effect only, discarding stdout.
    pub fn git_run(&self, args: &[&str]) -> Result<()> {
        self.git_stdout(args).map(|_| ())
    }

    /// Run `git <args>` in `dir` for side effect only.
    pub fn git_run_in(&self, dir: &Path, args: &[&str]) -> Result<()> {
        self.git_stdout_in(dir, args).map(|_| ())
    }

    /// `git <args>`, tolerating any non-zero exit (used for best-effort
    /// cleanup operations where "already gone" is not an error).
    pub fn git_run_tolerant(&self, args: &[&str]) {
        let _ = Command::new("git").args(args).current_dir(&self.root).status();
    }

    #[must_use]
    pub fn has_commits(&self) -> bool {
        self.git_stdout(&["rev-parse", "--verify", "HEAD"]).is_ok()
    }

    #[must_use]
    pub fn branch_exists(&self, branch: &str) -> bool {
        self.git_stdout(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .is_ok()
    }

    /// Working tree is clean (no staged or unstaged changes) in `dir`.
    pub fn is_clean(&self, dir: &Path) -> Result<bool> {
        let status = self.git_stdout_in(dir, &["status", "--porcelain"])?;
        Ok(status.is_empty())
    }

    pub fn rev_parse(&self, dir: &Path, rev: &str) -> Result<String> {
        self.git_stdout_in(dir, &["rev-parse", rev])
    }

    /// `true` if `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(&self.root)
            .status()
            .is_ok_and(|s| s.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::new(dir.path().to_owned());
        repo.git_run(&["init", "-q"]).unwrap();
        repo.git_run(&["config", "user.email", "test@example.com"]).unwrap();
        repo.git_run(&["config", "user.name", "Test"]).unwrap();
        (dir, repo)
    }

    #[test]
    fn fresh_repo_has_no_commits() {
        let (_dir, repo) = init_repo();
        assert!(!repo.has_commits());
    }

    #[test]
    fn clean_tree_reports_clean() {
        let (_dir, repo) = init_repo();
        assert!(repo.is_clean(repo.root()).unwrap());
    }

    #[test]
    fn dirty_tree_reports_not_clean() {
        let (dir, repo) = init_repo();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        assert!(!repo.is_clean(repo.root()).unwrap());
    }
}
