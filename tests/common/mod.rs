//! Shared integration-test harness: a fresh git repo plus wiring for a
//! full `Scheduler` run against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use drover::backpressure::BackpressureController;
use drover::events::EventBus;
use drover::executor::AgentExecutor;
use drover::memory::MemoryTracker;
use drover::scheduler::{Scheduler, SchedulerConfig};
use drover::store::TaskStore;
use drover::workspace::{WorkspaceManager, WorkspacePool};

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<TaskStore>,
    pub manager: Arc<WorkspaceManager>,
    pub pool: Arc<WorkspacePool>,
}

/// `agent_binary` is a real executable (e.g. `/bin/true`, `/bin/false`, or
/// a small shell script) standing in for a coding agent, the same
/// stub-executor approach the spec's scenario tests call for.
pub fn init_repo() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let repo = drover::workspace::git::GitRepo::new(dir.path().to_owned());
    repo.git_run(&["init", "-q"]).unwrap();
    repo.git_run(&["config", "user.email", "test@example.com"]).unwrap();
    repo.git_run(&["config", "user.name", "Test"]).unwrap();

    let store = Arc::new(TaskStore::open_in_memory().unwrap());
    let manager = Arc::new(WorkspaceManager::new(dir.path(), "main", "claude"));
    manager.ensure_trunk_branch().unwrap();
    let pool = Arc::new(WorkspacePool::new(
        Arc::clone(&manager),
        dir.path(),
        dir.path().join(".drover/cache"),
        0,
        8,
    ));

    Harness {
        dir,
        store,
        manager,
        pool,
    }
}

pub fn run_scheduler(h: &Harness, agent_binary: &Path, max_workers: u32) -> drover::model::ProjectStatus {
    let executor = Arc::new(AgentExecutor::new(agent_binary.to_owned(), Duration::from_secs(60)));
    let backpressure = Arc::new(BackpressureController::new(max_workers, 1));
    let events = Arc::new(EventBus::new());
    let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));

    let scheduler = Scheduler::new(
        Arc::clone(&h.store),
        Arc::clone(&h.pool),
        Arc::clone(&h.manager),
        executor,
        backpressure,
        events,
        memory,
        SchedulerConfig {
            max_workers,
            epic_filter: None,
            task_deadline: Duration::from_secs(30),
        },
    );
    scheduler.reclassify_after_crash().unwrap();
    scheduler.run().unwrap()
}

/// Build a [`Scheduler`] without running it, so callers can grab its
/// [`drover::executor::CancelToken`] before spawning `run()` on a thread
/// (used by the cancellation scenario test).
pub fn build_scheduler(h: &Harness, agent_binary: &Path, max_workers: u32, task_deadline: Duration) -> Scheduler {
    let executor = Arc::new(AgentExecutor::new(agent_binary.to_owned(), Duration::from_secs(60)));
    let backpressure = Arc::new(BackpressureController::new(max_workers, 1));
    let events = Arc::new(EventBus::new());
    let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));

    let scheduler = Scheduler::new(
        Arc::clone(&h.store),
        Arc::clone(&h.pool),
        Arc::clone(&h.manager),
        executor,
        backpressure,
        events,
        memory,
        SchedulerConfig {
            max_workers,
            epic_filter: None,
            task_deadline,
        },
    );
    scheduler.reclassify_after_crash().unwrap();
    scheduler
}

pub fn subscribed_scheduler(
    h: &Harness,
    agent_binary: &Path,
    max_workers: u32,
) -> (drover::model::ProjectStatus, Vec<drover::events::Event>) {
    let executor = Arc::new(AgentExecutor::new(agent_binary.to_owned(), Duration::from_secs(60)));
    let backpressure = Arc::new(BackpressureController::new(max_workers, 1));
    let events = Arc::new(EventBus::new());
    let rx = events.subscribe();
    let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));

    let scheduler = Scheduler::new(
        Arc::clone(&h.store),
        Arc::clone(&h.pool),
        Arc::clone(&h.manager),
        executor,
        backpressure,
        events,
        memory,
        SchedulerConfig {
            max_workers,
            epic_filter: None,
            task_deadline: Duration::from_secs(30),
        },
    );
    scheduler.reclassify_after_crash().unwrap();
    let status = scheduler.run().unwrap();
    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event);
    }
    (status, received)
}

/// A tiny shell script acting as a stub coding agent: always exits
/// non-zero.
pub fn always_fails_binary(dir: &Path) -> PathBuf {
    let path = dir.join("always-fails.sh");
    std::fs::write(&path, "#!/bin/sh\nexit 1\n").unwrap();
    make_executable(&path);
    path
}

/// A tiny shell script acting as a stub coding agent: always succeeds
/// after writing a file so the commit has something to merge.
pub fn always_succeeds_binary(dir: &Path) -> PathBuf {
    let path = dir.join("always-succeeds.sh");
    std::fs::write(&path, "#!/bin/sh\necho done > output-$$.txt\nexit 0\n").unwrap();
    make_executable(&path);
    path
}

/// A stub agent that reports a rate limit marker on its first invocation
/// per task (tracked via a marker file named after `$DROVER_TASK_ID` it
/// never actually sees — this uses a fixed-name marker under `dir`
/// instead, since these tests only ever run one task through it at a
/// time) and succeeds on every subsequent invocation.
pub fn flaky_then_succeeds_binary(dir: &Path) -> PathBuf {
    let path = dir.join("flaky-then-succeeds.sh");
    let marker = dir.join(".rate-limited-once");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\nif [ ! -f {marker} ]; then touch {marker}; echo 'error: rate limit exceeded'; exit 1; fi\necho done > output-$$.txt\nexit 0\n",
            marker = marker.display()
        ),
    )
    .unwrap();
    make_executable(&path);
    path
}

/// A stub agent that sleeps long enough for a test to cancel the
/// scheduler mid-run before it would otherwise succeed.
pub fn slow_then_succeeds_binary(dir: &Path) -> PathBuf {
    let path = dir.join("slow-then-succeeds.sh");
    std::fs::write(&path, "#!/bin/sh\nsleep 5\necho done > output-$$.txt\nexit 0\n").unwrap();
    make_executable(&path);
    path
}

fn make_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
