//! Error taxonomy for the Drover orchestration engine.
//!
//! Defines [`DroverError`], the unified error type returned by the library
//! crate's internal components (store, workspace manager, pool, executor,
//! backpressure controller). Error messages are written for an operator (or
//! an agent reading its own failure) to act on directly: each variant
//! describes what happened and, where there's an obvious next step, what to
//! do about it.
//!
//! The CLI boundary (`main.rs`) wraps these in `anyhow::Result` with
//! `.context(...)`; nothing below this module depends on `anyhow`.

use std::fmt;
use std::path::PathBuf;

/// Unified error type for Drover's core engine.
///
/// The variants correspond to the error-handling taxonomy in the design:
/// recoverable task errors, workspace errors, backpressure trips, integrity
/// errors, cancellation, and fatal errors. Backpressure trips are not
/// represented here — they are not failures, just suppression of spawning,
/// and are surfaced through stats rather than `Result`.
#[derive(Debug)]
pub enum DroverError {
    /// A task or epic id referenced in a write does not exist.
    IntegrityError {
        /// Human-readable description of the dangling reference.
        detail: String,
    },

    /// A blocked-by edge would introduce a cycle in the dependency graph.
    CycleError {
        /// The task id whose insertion would close the cycle.
        task_id: String,
        /// The blocker id already reachable from `task_id`.
        blocker_id: String,
    },

    /// An id was inserted that already exists.
    Conflict {
        /// The id that already exists.
        id: String,
    },

    /// The requested task does not exist.
    TaskNotFound {
        /// The task id that was not found.
        id: String,
    },

    /// The requested workspace does not exist.
    WorkspaceNotFound {
        /// The workspace id that was not found.
        id: String,
    },

    /// No warm, acquirable workspace is available and the pool is at its
    /// configured maximum size.
    NoneAvailable,

    /// A git worktree/commit/merge operation failed.
    WorkspaceError {
        /// The git (or shell) command that was run.
        command: String,
        /// Captured stderr from the failed command.
        stderr: String,
    },

    /// An operation was cancelled via the shared cancellation context.
    Cancelled,

    /// An operation exceeded its deadline.
    Timeout,

    /// A configuration file could not be parsed.
    ConfigError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// Fatal: the persistence engine is unreachable or corrupt, or the
    /// trunk repository itself is corrupt. The scheduler should exit
    /// non-zero after a best-effort release of any held workspaces.
    Fatal {
        /// Human-readable description of the fatal condition.
        detail: String,
    },

    /// An I/O error occurred.
    Io(std::io::Error),

    /// A SQLite error from the task store.
    Sql(rusqlite::Error),
}

impl fmt::Display for DroverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntegrityError { detail } => {
                write!(f, "integrity error: {detail}")
            }
            Self::CycleError {
                task_id,
                blocker_id,
            } => {
                write!(
                    f,
                    "adding blocker '{blocker_id}' to task '{task_id}' would create a dependency cycle"
                )
            }
            Self::Conflict { id } => {
                write!(f, "'{id}' already exists")
            }
            Self::TaskNotFound { id } => {
                write!(f, "task '{id}' not found")
            }
            Self::WorkspaceNotFound { id } => {
                write!(f, "workspace '{id}' not found")
            }
            Self::NoneAvailable => {
                write!(f, "no warm workspace available and the pool is at its configured maximum size")
            }
            Self::WorkspaceError { command, stderr } => {
                write!(f, "`{command}` failed")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ConfigError { path, detail } => {
                write!(f, "configuration error in '{}': {detail}", path.display())
            }
            Self::Fatal { detail } => write!(f, "fatal: {detail}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Sql(err) => write!(f, "sqlite error: {err}"),
        }
    }
}

impl std::error::Error for DroverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DroverError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rusqlite::Error> for DroverError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_cycle_error_names_both_ids() {
        let err = DroverError::CycleError {
            task_id: "t1".to_owned(),
            blocker_id: "t2".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("t1"));
        assert!(msg.contains("t2"));
        assert!(msg.contains("cycle"));
    }

    #[test]
    fn display_workspace_error_includes_stderr() {
        let err = DroverError::WorkspaceError {
            command: "git merge".to_owned(),
            stderr: "conflict in a.rs".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("git merge"));
        assert!(msg.contains("conflict in a.rs"));
    }

    #[test]
    fn display_none_available() {
        let msg = format!("{}", DroverError::NoneAvailable);
        assert!(msg.contains("no warm workspace"));
    }

    #[test]
    fn io_error_converts_and_has_source() {
        let io_err = std::io::Error::other("disk full");
        let err: DroverError = io_err.into();
        assert!(err.source().is_some());
    }
}
