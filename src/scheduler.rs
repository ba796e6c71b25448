//! C6 Scheduler — the main loop: poll project status, gate on
//! backpressure and memory, claim and dispatch, wait for completions, and
//! the crash-recovery reclassifier run once at startup
//! (`SPEC_FULL.md` §4.6).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};

use crate::backpressure::BackpressureController;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::executor::{AgentExecutor, CancelToken};
use crate::memory::MemoryTracker;
use crate::model::{EpicId, ProjectStatus, TaskStatus, WorkerId};
use crate::store::TaskStore;
use crate::worker::{Worker, WorkerOutcome};
use crate::workspace::{WorkspaceManager, WorkspacePool};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const REPLENISH_INTERVAL: Duration = Duration::from_secs(5);

pub struct SchedulerConfig {
    pub max_workers: u32,
    pub epic_filter: Option<EpicId>,
    pub task_deadline: Duration,
}

/// Drives claim/dispatch/completion until no pending work remains or the
/// scheduler is cancelled (`spec.md` §4.6 main loop, steps 1-4).
pub struct Scheduler {
    store: Arc<TaskStore>,
    pool: Arc<WorkspacePool>,
    manager: Arc<WorkspaceManager>,
    executor: Arc<AgentExecutor>,
    backpressure: Arc<BackpressureController>,
    events: Arc<EventBus>,
    memory: Arc<MemoryTracker>,
    config: SchedulerConfig,
    cancel: CancelToken,
    next_worker_id: std::sync::atomic::AtomicU64,
}

struct Finished {
    worker: WorkerId,
    outcome: Result<WorkerOutcome>,
}

impl Scheduler {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        pool: Arc<WorkspacePool>,
        manager: Arc<WorkspaceManager>,
        executor: Arc<AgentExecutor>,
        backpressure: Arc<BackpressureController>,
        events: Arc<EventBus>,
        memory: Arc<MemoryTracker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            manager,
            executor,
            backpressure,
            events,
            memory,
            config,
            cancel: CancelToken::new(),
            next_worker_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reconcile task state left behind by a crash: any task still
    /// `claimed`/`in_progress` whose recorded workspace branch has already
    /// reached trunk is completed; everything else is reset to `ready`
    /// (DESIGN.md open question (a)). Tasks with no recorded workspace (the
    /// worker never got far enough to acquire one) always reset.
    pub fn reclassify_after_crash(&self) -> Result<()> {
        for status in [TaskStatus::Claimed, TaskStatus::InProgress] {
            let tasks = self.store.list_tasks(None)?;
            for task in tasks.into_iter().filter(|t| t.status == status) {
                let merged = task.workspace_id.as_ref().is_some_and(|id| self.manager.already_merged(id));
                if merged {
                    self.store.complete(&task.id)?;
                } else {
                    self.store.update_status(&task.id, TaskStatus::Ready, Some("recovered after crash"))?;
                }
            }
        }
        Ok(())
    }

    /// Run the scheduler loop to completion. Returns the final
    /// [`ProjectStatus`] once no pending work remains or cancellation was
    /// observed.
    pub fn run(&self) -> Result<ProjectStatus> {
        let (done_tx, done_rx) = unbounded::<Finished>();
        let mut in_flight: u32 = 0;
        let mut last_replenish = std::time::Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                self.drain(&done_rx, &mut in_flight);
                break;
            }

            let status = self.store.project_status()?;
            self.events.publish(Event::StatsUpdate {
                ready: status.ready,
                in_progress: status.in_progress,
                completed: status.completed,
                failed: status.failed,
                blocked: status.blocked,
            });

            if !status.has_pending_work() && in_flight == 0 {
                break;
            }

            if last_replenish.elapsed() >= REPLENISH_INTERVAL {
                let _ = self.pool.replenish_once();
                last_replenish = std::time::Instant::now();
            }

            while in_flight < self.config.max_workers && self.backpressure.can_spawn() {
                let worker_id = self.fresh_worker_id();
                let Some(task) = self.store.claim_filtered(&worker_id, self.config.epic_filter.as_ref())? else {
                    break;
                };
                self.events.publish(Event::TaskClaimed {
                    task_id: task.id.clone(),
                    worker: worker_id.clone(),
                });
                self.dispatch(worker_id, task, done_tx.clone());
                in_flight += 1;
            }

            match done_rx.recv_timeout(POLL_INTERVAL) {
                Ok(finished) => {
                    in_flight -= 1;
                    self.handle_finished(finished);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        self.store.project_status()
    }

    fn fresh_worker_id(&self) -> WorkerId {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        WorkerId::new(format!("worker-{id}")).unwrap_or_else(|_| WorkerId::new("worker").unwrap())
    }

    fn drain(&self, done_rx: &crossbeam_channel::Receiver<Finished>, in_flight: &mut u32) {
        self.cancel.cancel();
        while *in_flight > 0 {
            if done_rx.recv_timeout(Duration::from_secs(5)).is_ok() {
                *in_flight -= 1;
            } else {
                break;
            }
        }
    }

    fn handle_finished(&self, finished: Finished) {
        match finished.outcome {
            Ok(outcome) => {
                tracing::debug!(worker = %finished.worker, ?outcome, "worker finished");
            }
            Err(e) => {
                tracing::warn!(worker = %finished.worker, error = %e, "worker errored");
            }
        }
    }

    fn dispatch(&self, worker_id: WorkerId, task: crate::model::Task, done_tx: Sender<Finished>) {
        let worker = Worker::new(
            worker_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            Arc::clone(&self.manager),
            Arc::clone(&self.executor),
            Arc::clone(&self.backpressure),
            Arc::clone(&self.events),
            Arc::clone(&self.memory),
            self.config.task_deadline,
        );
        let cancel = self.cancel.clone();

        std::thread::spawn(move || {
            let outcome = worker.run(task, &cancel);
            let _ = done_tx.send(Finished {
                worker: worker_id,
                outcome,
            });
        });
    }
}

/// Installs a Ctrl-C handler that cancels gracefully on the first signal
/// and requests a hard process exit on the second (`spec.md` §5 "signal
/// handling"), mirroring the teacher's `signal-hook` usage.
pub fn install_signal_handler(cancel: CancelToken) -> std::result::Result<(), std::io::Error> {
    let hard_exit = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            for _ in signals.forever() {
                if hard_exit.swap(true, Ordering::SeqCst) {
                    std::process::exit(130);
                }
                cancel.cancel();
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (cancel, hard_exit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclassify_resets_claimed_without_merged_branch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = crate::workspace::git::GitRepo::new(dir.path().to_owned());
        repo.git_run(&["init", "-q"]).unwrap();
        repo.git_run(&["config", "user.email", "test@example.com"]).unwrap();
        repo.git_run(&["config", "user.name", "Test"]).unwrap();

        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        store
            .create_task(&crate::model::TaskId::new("t1").unwrap(), &crate::store::NewTask::default())
            .unwrap();
        store.claim(&WorkerId::new("w1").unwrap()).unwrap();
        store
            .update_status(&crate::model::TaskId::new("t1").unwrap(), TaskStatus::InProgress, None)
            .unwrap();

        let manager = Arc::new(WorkspaceManager::new(dir.path(), "main", "claude"));
        let pool = Arc::new(WorkspacePool::new(Arc::clone(&manager), dir.path(), dir.path().join(".drover/cache"), 0, 1));
        let executor = Arc::new(crate::executor::AgentExecutor::new(std::path::PathBuf::from("true"), Duration::from_secs(60)));
        let backpressure = Arc::new(BackpressureController::new(2, 1));
        let events = Arc::new(EventBus::new());
        let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));

        let scheduler = Scheduler::new(
            store.clone(),
            pool,
            manager,
            executor,
            backpressure,
            events,
            memory,
            SchedulerConfig {
                max_workers: 1,
                epic_filter: None,
                task_deadline: Duration::from_secs(60),
            },
        );
        scheduler.reclassify_after_crash().unwrap();
        let task = store.get_task(&crate::model::TaskId::new("t1").unwrap()).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[test]
    fn reclassify_completes_task_whose_workspace_already_merged() {
        let dir = tempfile::tempdir().unwrap();
        let repo = crate::workspace::git::GitRepo::new(dir.path().to_owned());
        repo.git_run(&["init", "-q"]).unwrap();
        repo.git_run(&["config", "user.email", "test@example.com"]).unwrap();
        repo.git_run(&["config", "user.name", "Test"]).unwrap();

        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let task_id = crate::model::TaskId::new("t1").unwrap();
        store.create_task(&task_id, &crate::store::NewTask::default()).unwrap();
        store.claim(&WorkerId::new("w1").unwrap()).unwrap();
        store.update_status(&task_id, TaskStatus::InProgress, None).unwrap();

        let manager = Arc::new(WorkspaceManager::new(dir.path(), "main", "claude"));
        let ws_id = crate::model::WorkspaceId::new("ws-000000").unwrap();
        let path = manager.create(&ws_id).unwrap();
        std::fs::write(path.join("f.txt"), "hello").unwrap();
        manager.commit(&ws_id, "drover: t1").unwrap();
        manager.merge_to_trunk(&ws_id, "t1").unwrap();
        store.set_workspace(&task_id, &ws_id).unwrap();

        let pool = Arc::new(WorkspacePool::new(Arc::clone(&manager), dir.path(), dir.path().join(".drover/cache"), 0, 1));
        let executor = Arc::new(crate::executor::AgentExecutor::new(std::path::PathBuf::from("true"), Duration::from_secs(60)));
        let backpressure = Arc::new(BackpressureController::new(2, 1));
        let events = Arc::new(EventBus::new());
        let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));

        let scheduler = Scheduler::new(
            store.clone(),
            pool,
            manager,
            executor,
            backpressure,
            events,
            memory,
            SchedulerConfig {
                max_workers: 1,
                epic_filter: None,
                task_deadline: Duration::from_secs(60),
            },
        );
        scheduler.reclassify_after_crash().unwrap();
        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
