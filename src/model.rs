//! Core data model: tasks, epics, workspaces, and the small validated
//! newtype ids that key them (`spec.md` §3).

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Error returned when a string fails to validate as one of this module's
/// newtype ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}' must not be empty", self.kind, self.value)
    }
}

impl std::error::Error for ValidationError {}

macro_rules! id_newtype {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and construct. Ids must be non-empty and contain no
            /// path-separator characters, since they end up as directory
            /// names under `.drover/worktrees/`.
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.is_empty() || value.contains(['/', '\\']) {
                    return Err(ValidationError {
                        kind: $kind,
                        value,
                    });
                }
                Ok(Self(value))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;
            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }
    };
}

id_newtype!(TaskId, "task id");
id_newtype!(EpicId, "epic id");
id_newtype!(WorkspaceId, "workspace id");
id_newtype!(WorkerId, "worker id");

/// Status of a [`Task`]. Ordinals are not meaningful; this is a plain state
/// enum (`spec.md` §3, invariant (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    Claimed,
    InProgress,
    Paused,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ValidationError {
                kind: "task status",
                value: other.to_owned(),
            }),
        }
    }
}

/// A unit of work assignable to one agent run (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub epic_id: Option<EpicId>,
    pub parent_id: Option<TaskId>,
    pub priority: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub claimer: Option<WorkerId>,
    pub claimed_at: Option<i64>,
    /// The workspace a worker is currently running this task in, if any —
    /// set when claimed, cleared on completion or reset (used by
    /// crash-recovery reclassification to find the right branch to check).
    pub workspace_id: Option<WorkspaceId>,
    pub verdict: Option<String>,
    pub verdict_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub blocked_by: Vec<TaskId>,
}

impl Task {
    /// Sub-tasks (non-empty `parent_id`) are never directly claimable —
    /// invariant (e).
    #[must_use]
    pub const fn is_claimable_kind(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Named grouping of tasks for reporting/filtering (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: EpicId,
    pub title: String,
    pub description: String,
    pub status: EpicStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Open,
    Closed,
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Aggregate counts used by `project-status`/`stats_update` (`spec.md` §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub ready: u64,
    pub claimed: u64,
    pub in_progress: u64,
    pub paused: u64,
    pub blocked: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ProjectStatus {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.ready
            + self.claimed
            + self.in_progress
            + self.paused
            + self.blocked
            + self.completed
            + self.failed
    }

    /// Progress percentage (completed / total), 0 when there are no tasks.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            100.0 * (self.completed as f64) / (total as f64)
        }
    }

    /// Whether any work remains that could still run (ready/claimed/
    /// in-progress/blocked/paused) — the scheduler's termination check
    /// (`spec.md` §4.6 step 2) also consults in-flight count separately.
    #[must_use]
    pub const fn has_pending_work(&self) -> bool {
        self.ready > 0 || self.claimed > 0 || self.in_progress > 0 || self.blocked > 0
    }
}

/// Current Unix timestamp in seconds, used for `created_at`/`updated_at`
/// fields. Centralized so store code never calls `SystemTime::now()` ad hoc.
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
