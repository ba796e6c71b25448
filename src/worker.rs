//! C7 Worker — the six-step pipeline that turns one claimed task into a
//! completed, failed, or re-readied task (`SPEC_FULL.md` §4.7): acquire a
//! workspace, mark in-progress, invoke the executor under a deadline,
//! inform backpressure, classify the outcome, release resources and wake
//! the scheduler.

use std::sync::Arc;
use std::time::Duration;

use crate::backpressure::BackpressureController;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::executor::{AgentExecutor, CancelToken, ExecutionOutcome, ExecutionTask, ExecutorError};
use crate::memory::MemoryTracker;
use crate::model::{Task, TaskStatus, WorkerId};
use crate::store::TaskStore;
use crate::workspace::{WorkspaceManager, WorkspacePool};

/// Outcome the scheduler's main loop reacts to after a worker finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

pub struct Worker {
    pub id: WorkerId,
    store: Arc<TaskStore>,
    pool: Arc<WorkspacePool>,
    manager: Arc<WorkspaceManager>,
    executor: Arc<AgentExecutor>,
    backpressure: Arc<BackpressureController>,
    events: Arc<EventBus>,
    memory: Arc<MemoryTracker>,
    deadline: Duration,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: WorkerId,
        store: Arc<TaskStore>,
        pool: Arc<WorkspacePool>,
        manager: Arc<WorkspaceManager>,
        executor: Arc<AgentExecutor>,
        backpressure: Arc<BackpressureController>,
        events: Arc<EventBus>,
        memory: Arc<MemoryTracker>,
        deadline: Duration,
    ) -> Self {
        Self {
            id,
            store,
            pool,
            manager,
            executor,
            backpressure,
            events,
            memory,
            deadline,
        }
    }

    /// Run `task` to completion. Called by the scheduler from a dedicated
    /// OS thread per in-flight task (`spec.md` §5 "parallel OS-threaded
    /// concurrency").
    pub fn run(&self, task: Task, cancel: &CancelToken) -> Result<WorkerOutcome> {
        self.backpressure.worker_started();
        let outcome = self.run_inner(task, cancel);
        self.backpressure.worker_finished();
        outcome
    }

    fn run_inner(&self, task: Task, cancel: &CancelToken) -> Result<WorkerOutcome> {
        let (workspace_id, path) = self.pool.acquire(&task.id)?;

        self.store.set_workspace(&task.id, &workspace_id)?;
        self.store.update_status(&task.id, TaskStatus::InProgress, None)?;
        self.events.publish(Event::TaskStarted {
            task_id: task.id.clone(),
            worker: self.id.clone(),
        });

        let exec_task = ExecutionTask {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            epic_id: task.epic_id.clone(),
            operator_guidance: None,
        };

        let worker_id = self.id.clone();
        let memory = Arc::clone(&self.memory);
        let outcome = self
            .executor
            .execute(&path, &exec_task, self.deadline, cancel, move |pid| memory.register(worker_id, pid));

        let result = match outcome {
            Ok(run) => self.handle_run(&task, &workspace_id, run),
            Err(e) => {
                self.store.update_status(&task.id, TaskStatus::Failed, Some(&e.to_string()))?;
                self.events.publish(Event::TaskFailed {
                    task_id: task.id.clone(),
                    worker: self.id.clone(),
                    reason: e.to_string(),
                });
                Ok(WorkerOutcome::Failed)
            }
        };

        self.memory.unregister(&self.id);
        self.pool.release(&workspace_id, matches!(result, Ok(WorkerOutcome::Completed)));
        result
    }

    /// Classify one executor run into the four outcome branches of
    /// `spec.md` §4.7 step 5. `on-signal` is informed first regardless of
    /// outcome, per step 4, so the backpressure controller's state change
    /// happens-before the scheduler's next `can-spawn` observation.
    fn handle_run(&self, task: &Task, workspace_id: &crate::model::WorkspaceId, run: ExecutionOutcome) -> Result<WorkerOutcome> {
        self.backpressure.on_signal(run.signal);

        if run.err == Some(ExecutorError::Cancelled) {
            self.store.update_status(&task.id, TaskStatus::Ready, None)?;
            self.events.publish(Event::TaskPaused {
                task_id: task.id.clone(),
                reason: "cancelled".to_owned(),
            });
            return Ok(WorkerOutcome::Cancelled);
        }

        if run.success {
            return self.complete(task, workspace_id);
        }

        let reason = if run.err == Some(ExecutorError::Timeout) {
            "timed out".to_owned()
        } else if run.err == Some(ExecutorError::MemoryExceeded) {
            "exceeded memory ceiling".to_owned()
        } else {
            run.output
        };
        self.classify_failure(task, &reason)
    }

    fn complete(&self, task: &Task, workspace_id: &crate::model::WorkspaceId) -> Result<WorkerOutcome> {
        let message = format!("{}", task.id);
        self.manager.commit(workspace_id, &format!("drover: {message}"))?;
        self.manager.merge_to_trunk(workspace_id, &message)?;
        self.store.complete(&task.id)?;
        self.events.publish(Event::TaskCompleted {
            task_id: task.id.clone(),
            worker: self.id.clone(),
        });
        Ok(WorkerOutcome::Completed)
    }

    fn classify_failure(&self, task: &Task, reason: &str) -> Result<WorkerOutcome> {
        let attempts = self.store.increment_attempts(&task.id)?;
        if attempts >= task.max_attempts {
            self.store.update_status(&task.id, TaskStatus::Failed, Some(reason))?;
            self.events.publish(Event::TaskFailed {
                task_id: task.id.clone(),
                worker: self.id.clone(),
                reason: reason.to_owned(),
            });
            Ok(WorkerOutcome::Failed)
        } else {
            self.store.update_status(&task.id, TaskStatus::Ready, Some(reason))?;
            self.events.publish(Event::TaskFailed {
                task_id: task.id.clone(),
                worker: self.id.clone(),
                reason: reason.to_owned(),
            });
            Ok(WorkerOutcome::Retrying)
        }
    }
}
