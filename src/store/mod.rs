//! C1 Task Store — durable task/epic/dependency state, atomic single-claim,
//! dependent unblocking, reset (`SPEC_FULL.md` §4.1).
//!
//! Backed by `rusqlite` (bundled SQLite) in WAL journal mode with a 5s busy
//! timeout, so the single-statement claim below retries under SQLite's own
//! locking instead of failing immediately with `SQLITE_BUSY` when workers
//! race each other.

mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{DroverError, Result};
use crate::model::{EpicId, EpicStatus, ProjectStatus, Task, TaskId, TaskStatus, WorkerId, WorkspaceId, now_unix};

/// Fields needed to create a task; mirrors `create-task(title, desc, epic,
/// priority, blocked-by[])` (`spec.md` §4.1).
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub epic_id: Option<EpicId>,
    pub parent_id: Option<TaskId>,
    pub priority: i64,
    pub max_attempts: u32,
    pub blocked_by: Vec<TaskId>,
}

pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open (creating if absent) the SQLite database at `path`, running
    /// schema migrations (`CREATE TABLE IF NOT EXISTS`) once.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_epic(&self, id: &EpicId, title: &str, description: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_unix();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO epics (id, title, description, status, created_at)
                 VALUES (?1, ?2, ?3, 'open', ?4)",
                params![id.as_str(), title, description, now],
            )?;
        if rows == 0 {
            return Err(DroverError::Conflict {
                id: id.as_str().to_owned(),
            });
        }
        Ok(())
    }

    /// `create-task`/`create-sub-task` — both go through here; a sub-task is
    /// simply a task whose `parent_id` is set (invariant (e): never directly
    /// claimable).
    pub fn create_task(&self, id: &TaskId, new: &NewTask) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = conn.transaction()?;

        if let Some(epic_id) = &new.epic_id
            && !epic_exists(&tx, epic_id.as_str())?
        {
            return Err(DroverError::IntegrityError {
                detail: format!("epic '{epic_id}' does not exist"),
            });
        }
        if let Some(parent_id) = &new.parent_id
            && !task_exists(&tx, parent_id.as_str())?
        {
            return Err(DroverError::IntegrityError {
                detail: format!("parent task '{parent_id}' does not exist"),
            });
        }
        for blocker in &new.blocked_by {
            if !task_exists(&tx, blocker.as_str())? {
                return Err(DroverError::IntegrityError {
                    detail: format!("blocker '{blocker}' does not exist"),
                });
            }
            if blocker.as_str() == id.as_str() || reaches(&tx, blocker.as_str(), id.as_str())? {
                return Err(DroverError::CycleError {
                    task_id: id.as_str().to_owned(),
                    blocker_id: blocker.as_str().to_owned(),
                });
            }
        }

        let now = now_unix();
        let status = if new.blocked_by.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Blocked
        };
        let rows = tx.execute(
            "INSERT OR IGNORE INTO tasks
                (id, title, description, epic_id, parent_id, priority, status,
                 attempts, max_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
            params![
                id.as_str(),
                new.title,
                new.description,
                new.epic_id.as_ref().map(EpicId::as_str),
                new.parent_id.as_ref().map(TaskId::as_str),
                new.priority,
                status.as_str(),
                new.max_attempts,
                now,
            ],
        )?;
        if rows == 0 {
            return Err(DroverError::Conflict {
                id: id.as_str().to_owned(),
            });
        }
        for blocker in &new.blocked_by {
            tx.execute(
                "INSERT INTO task_blockers (task_id, blocker_id) VALUES (?1, ?2)",
                params![id.as_str(), blocker.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomic single-claim (`spec.md` §4.1, P1). The candidate set is
    /// `{status = ready, parent_id IS NULL}`, ordered by (priority desc,
    /// created_at asc), limited to one row, mutated and returned by the
    /// same statement.
    pub fn claim(&self, worker: &WorkerId) -> Result<Option<Task>> {
        self.claim_filtered(worker, None)
    }

    /// As [`Self::claim`], but restricted to tasks in `epic` when given
    /// (`spec.md` §4.6 "epic filter").
    pub fn claim_filtered(&self, worker: &WorkerId, epic: Option<&EpicId>) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_unix();
        let sql = if epic.is_some() {
            "UPDATE tasks
             SET status = 'claimed', claimer = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'ready' AND parent_id IS NULL AND epic_id = ?3
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
             )
             RETURNING id"
        } else {
            "UPDATE tasks
             SET status = 'claimed', claimer = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'ready' AND parent_id IS NULL
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
             )
             RETURNING id"
        };
        let claimed_id: Option<String> = if let Some(epic) = epic {
            conn.query_row(sql, params![worker.as_str(), now, epic.as_str()], |r| r.get(0))
                .optional()?
        } else {
            conn.query_row(sql, params![worker.as_str(), now], |r| r.get(0))
                .optional()?
        };
        let Some(claimed_id) = claimed_id else {
            return Ok(None);
        };
        Ok(Some(load_task(&conn, &claimed_id)?))
    }

    pub fn update_status(&self, id: &TaskId, status: TaskStatus, last_error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_unix();
        let rows = conn.execute(
            "UPDATE tasks SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), last_error, now, id.as_str()],
        )?;
        if rows == 0 {
            return Err(DroverError::TaskNotFound {
                id: id.as_str().to_owned(),
            });
        }
        Ok(())
    }

    /// Record which workspace a worker is running `id` in, so crash
    /// recovery can find the right branch to check for already-merged work
    /// (`spec.md` §9 open question (a)).
    pub fn set_workspace(&self, id: &TaskId, workspace_id: &WorkspaceId) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_unix();
        let rows = conn.execute(
            "UPDATE tasks SET workspace_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![workspace_id.as_str(), now, id.as_str()],
        )?;
        if rows == 0 {
            return Err(DroverError::TaskNotFound {
                id: id.as_str().to_owned(),
            });
        }
        Ok(())
    }

    pub fn increment_attempts(&self, id: &TaskId) -> Result<u32> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = now_unix();
        let attempts: i64 = conn
            .query_row(
                "UPDATE tasks SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2
                 RETURNING attempts",
                params![now, id.as_str()],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| DroverError::TaskNotFound {
                id: id.as_str().to_owned(),
            })?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// `complete(T)` — within one transaction, mark T completed and
    /// unblock every dependent whose remaining non-completed blocker count
    /// drops to zero (`spec.md` §4.1 "Dependent unblocking").
    pub fn complete(&self, id: &TaskId) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = conn.transaction()?;
        let now = now_unix();
        let rows = tx.execute(
            "UPDATE tasks
             SET status = 'completed', claimer = NULL, claimed_at = NULL, workspace_id = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now, id.as_str()],
        )?;
        if rows == 0 {
            return Err(DroverError::TaskNotFound {
                id: id.as_str().to_owned(),
            });
        }

        let dependents: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM task_blockers WHERE blocker_id = ?1",
            )?;
            let rows = stmt.query_map(params![id.as_str()], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for dependent in dependents {
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM task_blockers tb
                 JOIN tasks t ON t.id = tb.blocker_id
                 WHERE tb.task_id = ?1 AND t.status != 'completed'",
                params![dependent],
                |r| r.get(0),
            )?;
            if remaining == 0 {
                tx.execute(
                    "UPDATE tasks SET status = 'ready', updated_at = ?1
                     WHERE id = ?2 AND status = 'blocked'",
                    params![now, dependent],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// `reset(S)` — every task whose status is in `statuses` goes back to
    /// `ready`, clearing claimer/claim-timestamp/attempts/last-error. An
    /// empty slice resets the spec's documented default: `{claimed,
    /// in-progress, completed}`.
    pub fn reset(&self, statuses: &[TaskStatus]) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let defaults = [TaskStatus::Claimed, TaskStatus::InProgress, TaskStatus::Completed];
        let targets: &[TaskStatus] = if statuses.is_empty() { &defaults } else { statuses };
        let now = now_unix();
        let mut total = 0u64;
        for status in targets {
            let rows = conn.execute(
                "UPDATE tasks
                 SET status = 'ready', claimer = NULL, claimed_at = NULL, workspace_id = NULL,
                     attempts = 0, last_error = NULL, updated_at = ?1
                 WHERE status = ?2",
                params![now, status.as_str()],
            )?;
            total += rows as u64;
        }
        Ok(total)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        load_task(&conn, id.as_str())
    }

    pub fn get_blocked_by(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        blocked_by(&conn, id.as_str())
    }

    pub fn list_tasks(&self, epic: Option<&EpicId>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = if epic.is_some() {
            conn.prepare(
                "SELECT id FROM tasks WHERE epic_id = ?1 ORDER BY priority DESC, created_at ASC",
            )?
        } else {
            conn.prepare("SELECT id FROM tasks ORDER BY priority DESC, created_at ASC")?
        };
        let ids: Vec<String> = if let Some(epic) = epic {
            stmt.query_map(params![epic.as_str()], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        ids.iter().map(|id| load_task(&conn, id)).collect()
    }

    pub fn list_epics(&self) -> Result<Vec<crate::model::Epic>> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, title, description, status, created_at FROM epics ORDER BY created_at ASC",
        )?;
        let epics = stmt
            .query_map([], |r| {
                let status: String = r.get(3)?;
                Ok(crate::model::Epic {
                    id: EpicId::new(r.get::<_, String>(0)?).unwrap_or_else(|_| EpicId::new("?").unwrap()),
                    title: r.get(1)?,
                    description: r.get(2)?,
                    status: if status == "closed" {
                        EpicStatus::Closed
                    } else {
                        EpicStatus::Open
                    },
                    created_at: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(epics)
    }

    pub fn project_status(&self) -> Result<ProjectStatus> {
        let conn = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stats = ProjectStatus::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            let count = count.try_into().unwrap_or(0);
            match status.as_str() {
                "ready" => stats.ready = count,
                "claimed" => stats.claimed = count,
                "in_progress" => stats.in_progress = count,
                "paused" => stats.paused = count,
                "blocked" => stats.blocked = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn epic_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM epics WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

fn task_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

/// Would following blocked-by edges starting at `start` eventually reach
/// `target`? Used to reject edges that would close a dependency cycle
/// (`spec.md` §4.1 "cycle detection at insert").
fn reaches(conn: &Connection, start: &str, target: &str) -> rusqlite::Result<bool> {
    let mut seen = HashSet::new();
    let mut stack = vec![start.to_owned()];
    while let Some(current) = stack.pop() {
        if current == target {
            return Ok(true);
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        let mut stmt = conn.prepare("SELECT blocker_id FROM task_blockers WHERE task_id = ?1")?;
        let next: Vec<String> = stmt
            .query_map(params![current], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        stack.extend(next);
    }
    Ok(false)
}

fn blocked_by(conn: &Connection, id: &str) -> Result<Vec<TaskId>> {
    let mut stmt = conn.prepare("SELECT blocker_id FROM task_blockers WHERE task_id = ?1 ORDER BY blocker_id")?;
    let rows: Vec<String> = stmt
        .query_map(params![id], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter()
        .map(|s| TaskId::new(s).map_err(|e| DroverError::IntegrityError { detail: e.to_string() }))
        .collect()
}

fn load_task(conn: &Connection, id: &str) -> Result<Task> {
    let row = conn
        .query_row(
            "SELECT id, title, description, epic_id, parent_id, priority, status, attempts,
                    max_attempts, last_error, claimer, claimed_at, workspace_id, verdict,
                    verdict_reason, created_at, updated_at
             FROM tasks WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, i64>(7)?,
                    r.get::<_, i64>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, Option<String>>(10)?,
                    r.get::<_, Option<i64>>(11)?,
                    r.get::<_, Option<String>>(12)?,
                    r.get::<_, Option<String>>(13)?,
                    r.get::<_, Option<String>>(14)?,
                    r.get::<_, i64>(15)?,
                    r.get::<_, i64>(16)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| DroverError::TaskNotFound { id: id.to_owned() })?;

    let (
        task_id,
        title,
        description,
        epic_id,
        parent_id,
        priority,
        status,
        attempts,
        max_attempts,
        last_error,
        claimer,
        claimed_at,
        workspace_id,
        verdict,
        verdict_reason,
        created_at,
        updated_at,
    ) = row;

    Ok(Task {
        id: TaskId::new(task_id)?,
        title,
        description,
        epic_id: epic_id.map(EpicId::new).transpose()?,
        parent_id: parent_id.map(TaskId::new).transpose()?,
        priority,
        status: status.parse()?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        max_attempts: u32::try_from(max_attempts).unwrap_or(0),
        last_error,
        claimer: claimer.map(WorkerId::new).transpose()?,
        claimed_at,
        workspace_id: workspace_id.map(WorkspaceId::new).transpose()?,
        verdict,
        verdict_reason,
        created_at,
        updated_at,
        blocked_by: blocked_by(conn, id)?,
    })
}

impl From<crate::model::ValidationError> for DroverError {
    fn from(err: crate::model::ValidationError) -> Self {
        Self::IntegrityError {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn wid(s: &str) -> WorkerId {
        WorkerId::new(s).unwrap()
    }

    #[test]
    fn create_task_without_blockers_starts_ready() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        assert_eq!(s.get_task(&tid("a")).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn create_task_with_blockers_starts_blocked() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        s.create_task(
            &tid("b"),
            &NewTask {
                blocked_by: vec![tid("a")],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(s.get_task(&tid("b")).unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn dangling_blocker_is_integrity_error() {
        let s = store();
        let err = s
            .create_task(
                &tid("a"),
                &NewTask {
                    blocked_by: vec![tid("ghost")],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, DroverError::IntegrityError { .. }));
    }

    #[test]
    fn self_reference_is_cycle_error() {
        let s = store();
        let err = s
            .create_task(
                &tid("a"),
                &NewTask {
                    blocked_by: vec![tid("a")],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, DroverError::CycleError { .. }));
    }

    #[test]
    fn double_insert_is_conflict() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        let err = s.create_task(&tid("a"), &NewTask::default()).unwrap_err();
        assert!(matches!(err, DroverError::Conflict { .. }));
    }

    #[test]
    fn claim_returns_none_when_empty() {
        let s = store();
        assert!(s.claim(&wid("w1")).unwrap().is_none());
    }

    #[test]
    fn claim_never_returns_sub_tasks() {
        let s = store();
        s.create_task(&tid("parent"), &NewTask::default()).unwrap();
        s.create_task(
            &tid("child"),
            &NewTask {
                parent_id: Some(tid("parent")),
                ..Default::default()
            },
        )
        .unwrap();
        let claimed = s.claim(&wid("w1")).unwrap().unwrap();
        assert_eq!(claimed.id, tid("parent"));
        assert!(s.claim(&wid("w1")).unwrap().is_none());
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let s = store();
        s.create_task(
            &tid("low"),
            &NewTask {
                priority: 0,
                ..Default::default()
            },
        )
        .unwrap();
        s.create_task(
            &tid("high"),
            &NewTask {
                priority: 10,
                ..Default::default()
            },
        )
        .unwrap();
        let claimed = s.claim(&wid("w1")).unwrap().unwrap();
        assert_eq!(claimed.id, tid("high"));
    }

    #[test]
    fn claim_is_exclusive_under_concurrency() {
        use std::sync::Arc;
        let s = Arc::new(store());
        for i in 0..20 {
            s.create_task(&tid(&format!("t{i}")), &NewTask::default()).unwrap();
        }
        let mut handles = Vec::new();
        for i in 0..8 {
            let s = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    match s.claim(&wid(&format!("w{i}"))).unwrap() {
                        Some(t) => claimed.push(t.id),
                        None => break,
                    }
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 20);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 20, "no task should be claimed twice");
    }

    #[test]
    fn complete_unblocks_dependents_whose_blockers_are_all_done() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        s.create_task(
            &tid("b"),
            &NewTask {
                blocked_by: vec![tid("a")],
                ..Default::default()
            },
        )
        .unwrap();
        s.claim(&wid("w1")).unwrap();
        s.complete(&tid("a")).unwrap();
        assert_eq!(s.get_task(&tid("b")).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn complete_does_not_unblock_when_another_blocker_remains() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        s.create_task(&tid("b"), &NewTask::default()).unwrap();
        s.create_task(
            &tid("c"),
            &NewTask {
                blocked_by: vec![tid("a"), tid("b")],
                ..Default::default()
            },
        )
        .unwrap();
        s.complete(&tid("a")).unwrap();
        assert_eq!(s.get_task(&tid("c")).unwrap().status, TaskStatus::Blocked);
        s.complete(&tid("b")).unwrap();
        assert_eq!(s.get_task(&tid("c")).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn reset_default_covers_claimed_in_progress_completed() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        s.claim(&wid("w1")).unwrap();
        s.reset(&[]).unwrap();
        let task = s.get_task(&tid("a")).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.claimer.is_none());
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn reset_failed_clears_attempts_and_last_error() {
        let s = store();
        s.create_task(
            &tid("a"),
            &NewTask {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .unwrap();
        s.claim(&wid("w1")).unwrap();
        s.increment_attempts(&tid("a")).unwrap();
        s.update_status(&tid("a"), TaskStatus::Failed, Some("boom")).unwrap();
        s.reset(&[TaskStatus::Failed]).unwrap();
        let task = s.get_task(&tid("a")).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempts, 0);
        assert!(task.last_error.is_none());
    }

    #[test]
    fn project_status_counts_by_status() {
        let s = store();
        s.create_task(&tid("a"), &NewTask::default()).unwrap();
        s.create_task(&tid("b"), &NewTask::default()).unwrap();
        s.claim(&wid("w1")).unwrap();
        let stats = s.project_status().unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.claimed, 1);
    }
}
