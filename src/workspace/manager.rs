//! C2 Workspace Manager — isolated `git worktree` checkouts, trunk
//! bootstrap, commit, merge-to-trunk, cleanup (`SPEC_FULL.md` §4.2).
//!
//! Workspaces are keyed by [`WorkspaceId`], not task id: the pool (C3)
//! pre-creates checkouts before any task is assigned to them. The worker
//! passes the task id along only for the merge commit message.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{DroverError, Result};
use crate::model::WorkspaceId;
use crate::workspace::git::GitRepo;

/// Build artifact directories reclaimed by aggressive cleanup, both at the
/// workspace root and nested arbitrarily deep.
const RECLAIMED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "dist",
    "build",
    "venv",
    "__pycache__",
    "coverage",
];

pub struct WorkspaceManager {
    repo: GitRepo,
    trunk_branch: String,
    worktrees_dir: PathBuf,
    /// Serializes all merge-to-trunk operations across workers
    /// (`spec.md` §5 "process-global mutex").
    merge_lock: Mutex<()>,
    /// The short name of the tool making merge commits, e.g. `claude`.
    tool_name: String,
}

impl WorkspaceManager {
    #[must_use]
    pub fn new(project_root: &Path, trunk_branch: &str, tool_name: &str) -> Self {
        Self {
            repo: GitRepo::new(project_root.to_owned()),
            trunk_branch: trunk_branch.to_owned(),
            worktrees_dir: project_root.join(".drover").join("worktrees"),
            merge_lock: Mutex::new(()),
            tool_name: tool_name.to_owned(),
        }
    }

    #[must_use]
    pub fn path_of(&self, workspace_id: &WorkspaceId) -> PathBuf {
        self.worktree_path(workspace_id)
    }

    fn workspace_branch(workspace_id: &WorkspaceId) -> String {
        format!("workspace/{workspace_id}")
    }

    fn worktree_path(&self, workspace_id: &WorkspaceId) -> PathBuf {
        self.worktrees_dir.join(workspace_id.as_str())
    }

    /// Create the trunk as an orphan branch with an empty initial commit
    /// if it does not already exist. Called defensively by
    /// [`Self::merge_to_trunk`] as well as directly at `init` time.
    pub fn ensure_trunk_branch(&self) -> Result<()> {
        if self.repo.branch_exists(&self.trunk_branch) {
            return Ok(());
        }
        if self.repo.has_commits() {
            self.repo.git_run(&["branch", &self.trunk_branch])?;
            return Ok(());
        }
        let current = self.repo.git_stdout(&["symbolic-ref", "--short", "HEAD"]).ok();
        self.repo
            .git_run(&["checkout", "--orphan", &self.trunk_branch])?;
        self.repo
            .git_run(&["commit", "--allow-empty", "-m", "drover: initial trunk commit"])?;
        if let Some(prev) = current {
            self.repo.git_run_tolerant(&["branch", "-D", &prev]);
        }
        Ok(())
    }

    /// Create a new worktree checkout off trunk, returning its path.
    pub fn create(&self, workspace_id: &WorkspaceId) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.worktrees_dir)?;
        let path = self.worktree_path(workspace_id);
        self.remove(workspace_id); // aggressively clear any stale registration/dir first

        let branch = Self::workspace_branch(workspace_id);
        self.repo.git_run_tolerant(&["branch", "-D", &branch]);

        if self.repo.has_commits() {
            self.ensure_trunk_branch()?;
            self.repo.git_run(&[
                "worktree",
                "add",
                "-b",
                &branch,
                path.to_str().unwrap_or_default(),
                &self.trunk_branch,
            ])?;
        } else {
            // No commits yet anywhere: detached worktree, then an orphan
            // branch inside it so a subsequent commit becomes trunk's first.
            self.repo.git_run(&[
                "worktree",
                "add",
                "--detach",
                path.to_str().unwrap_or_default(),
            ])?;
            self.repo.git_run_in(&path, &["checkout", "--orphan", &branch])?;
        }
        Ok(path)
    }

    /// Remove a workspace's worktree and branch registration. Tolerates
    /// missing registrations (best-effort).
    pub fn remove(&self, workspace_id: &WorkspaceId) {
        let path = self.worktree_path(workspace_id);
        self.repo
            .git_run_tolerant(&["worktree", "remove", "--force", path.to_str().unwrap_or_default()]);
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        self.repo.git_run_tolerant(&["worktree", "prune"]);
    }

    /// Stage and commit all changes in the workspace. Returns `(false,
    /// None)` when the tree is clean, including the race where it becomes
    /// clean between the status check and the commit attempt.
    pub fn commit(&self, workspace_id: &WorkspaceId, message: &str) -> Result<(bool, Option<String>)> {
        let path = self.worktree_path(workspace_id);
        if self.repo.is_clean(&path)? {
            return Ok((false, None));
        }
        self.repo.git_run_in(&path, &["add", "-A"])?;
        match self.repo.git_stdout_in(&path, &["commit", "-m", message]) {
            Ok(_) => {
                let sha = self.repo.rev_parse(&path, "HEAD")?;
                Ok((true, Some(sha)))
            }
            Err(DroverError::WorkspaceError { stderr, .. })
                if stderr.contains("nothing to commit") =>
            {
                Ok((false, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Merge a workspace's branch into trunk, labeling the merge commit
    /// with `task_label` (`"<tool>: Merge <task-id>"`). Serialized
    /// process-wide; three cases per `spec.md` §4.2.
    pub fn merge_to_trunk(&self, workspace_id: &WorkspaceId, task_label: &str) -> Result<()> {
        let _guard = self.merge_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ensure_trunk_branch()?;

        let branch = Self::workspace_branch(workspace_id);
        let message = format!("{}: Merge {task_label}", self.tool_name);

        let trunk_has_commits = self.repo.has_commits();
        let unrelated = trunk_has_commits
            && self
                .repo
                .git_stdout(&["merge-base", &self.trunk_branch, &branch])
                .is_err();

        if !trunk_has_commits || unrelated {
            // Cases 2/3: promote the worker's tip as trunk, hard-reset.
            let tip = self.repo.git_stdout(&["rev-parse", &branch])?;
            self.repo.git_run(&["checkout", &self.trunk_branch])?;
            self.repo.git_run(&["reset", "--hard", &tip])?;
        } else {
            // Case 1: fast-forward-safe no-FF merge.
            self.repo.git_run(&["checkout", &self.trunk_branch])?;
            self.repo
                .git_run(&["merge", "--no-ff", "-m", &message, &branch])?;
        }

        self.repo.git_run_tolerant(&["branch", "-D", &branch]);
        Ok(())
    }

    /// `true` if `workspace_id`'s branch tip is already an ancestor of
    /// trunk — i.e. its work already reached trunk even though the store
    /// may still show the task claimed (used by crash-recovery
    /// reclassification, see DESIGN.md open question (a)).
    pub fn already_merged(&self, workspace_id: &WorkspaceId) -> bool {
        let branch = Self::workspace_branch(workspace_id);
        self.repo.is_ancestor(&branch, &self.trunk_branch)
    }

    /// Best-effort: remove worktree directories on disk that are no
    /// longer registered with git.
    pub fn prune_orphans(&self) -> Result<()> {
        self.repo.git_run_tolerant(&["worktree", "prune"]);
        let registered: Vec<String> = self
            .repo
            .git_stdout(&["worktree", "list", "--porcelain"])
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(ToOwned::to_owned)
            .collect();
        if !self.worktrees_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.worktrees_dir)? {
            let entry = entry?;
            let path = entry.path();
            let canonical = path.canonicalize().unwrap_or(path.clone());
            if !registered.iter().any(|r| Path::new(r) == canonical) {
                let _ = std::fs::remove_dir_all(&path);
            }
        }
        Ok(())
    }

    /// Remove every worktree and reclaim heavyweight build artifacts.
    pub fn cleanup_all(&self) -> Result<()> {
        if self.worktrees_dir.exists() {
            for entry in std::fs::read_dir(&self.worktrees_dir)? {
                let entry = entry?;
                aggressive_remove(&entry.path());
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        self.repo.git_run_tolerant(&["worktree", "prune"]);
        Ok(())
    }
}

/// Reclaim heavyweight build-artifact directories at `root` and nested
/// within it (`spec.md` §4.2 "aggressive-remove").
pub fn aggressive_remove(root: &Path) {
    for name in RECLAIMED_DIRS {
        let direct = root.join(name);
        if direct.exists() {
            let _ = std::fs::remove_dir_all(&direct);
        }
    }
    let Ok(pattern) = glob::glob(&format!("{}/**/{{{}}}", root.display(), RECLAIMED_DIRS.join(",")))
    else {
        return;
    };
    for entry in pattern.flatten() {
        let _ = std::fs::remove_dir_all(&entry);
    }
}
