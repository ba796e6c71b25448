//! End-to-end scheduler scenarios (`spec.md` §8 "Scenarios").

mod common;

use drover::model::{TaskId, TaskStatus};
use drover::store::NewTask;

fn tid(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

#[test]
fn linear_chain_runs_in_dependency_order_and_completes() {
    let h = common::init_repo();
    h.store.create_task(&tid("a"), &NewTask::default()).unwrap();
    h.store
        .create_task(
            &tid("b"),
            &NewTask {
                blocked_by: vec![tid("a")],
                ..Default::default()
            },
        )
        .unwrap();
    h.store
        .create_task(
            &tid("c"),
            &NewTask {
                blocked_by: vec![tid("b")],
                ..Default::default()
            },
        )
        .unwrap();

    let agent = common::always_succeeds_binary(h.dir.path());
    let status = common::run_scheduler(&h, &agent, 1);

    assert_eq!(status.completed, 3);
    assert_eq!(status.failed, 0);
    for id in ["a", "b", "c"] {
        assert_eq!(h.store.get_task(&tid(id)).unwrap().status, TaskStatus::Completed);
    }
}

#[test]
fn diamond_dependency_all_complete() {
    let h = common::init_repo();
    h.store.create_task(&tid("a"), &NewTask::default()).unwrap();
    h.store
        .create_task(
            &tid("b"),
            &NewTask {
                blocked_by: vec![tid("a")],
                ..Default::default()
            },
        )
        .unwrap();
    h.store
        .create_task(
            &tid("c"),
            &NewTask {
                blocked_by: vec![tid("a")],
                ..Default::default()
            },
        )
        .unwrap();
    h.store
        .create_task(
            &tid("d"),
            &NewTask {
                blocked_by: vec![tid("b"), tid("c")],
                ..Default::default()
            },
        )
        .unwrap();

    let agent = common::always_succeeds_binary(h.dir.path());
    let status = common::run_scheduler(&h, &agent, 2);

    assert_eq!(status.completed, 4);
    for id in ["a", "b", "c", "d"] {
        assert_eq!(h.store.get_task(&tid(id)).unwrap().status, TaskStatus::Completed);
    }
}

#[test]
fn retry_then_terminal_failure_emits_task_failed_per_attempt() {
    let h = common::init_repo();
    h.store
        .create_task(
            &tid("r"),
            &NewTask {
                max_attempts: 3,
                ..Default::default()
            },
        )
        .unwrap();

    let agent = common::always_fails_binary(h.dir.path());
    let (status, events) = common::subscribed_scheduler(&h, &agent, 1);

    assert_eq!(status.failed, 1);
    let task = h.store.get_task(&tid("r")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.last_error.is_some());

    let failed_events = events
        .iter()
        .filter(|e| matches!(e, drover::events::Event::TaskFailed { .. }))
        .count();
    assert_eq!(failed_events, 3);
}

#[test]
fn reset_after_terminal_failure_returns_task_to_ready() {
    let h = common::init_repo();
    h.store
        .create_task(
            &tid("r"),
            &NewTask {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let agent = common::always_fails_binary(h.dir.path());
    common::run_scheduler(&h, &agent, 1);
    assert_eq!(h.store.get_task(&tid("r")).unwrap().status, TaskStatus::Failed);

    h.store.reset(&[TaskStatus::Failed]).unwrap();
    let task = h.store.get_task(&tid("r")).unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.attempts, 0);
    assert!(task.last_error.is_none());
}

#[test]
fn transient_rate_limit_retries_then_completes() {
    let h = common::init_repo();
    h.store
        .create_task(
            &tid("r"),
            &NewTask {
                max_attempts: 3,
                ..Default::default()
            },
        )
        .unwrap();

    let agent = common::flaky_then_succeeds_binary(h.dir.path());
    let (status, events) = common::subscribed_scheduler(&h, &agent, 1);

    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 0);
    let task = h.store.get_task(&tid("r")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1, "the rate-limited attempt doesn't count toward max_attempts retries exhausting");

    let failed_events = events
        .iter()
        .filter(|e| matches!(e, drover::events::Event::TaskFailed { .. }))
        .count();
    assert_eq!(failed_events, 1, "one TaskFailed for the rate-limited attempt before the retry completes");
}

#[test]
fn cancelling_mid_run_returns_in_flight_task_to_ready() {
    use std::sync::Arc;
    use std::time::Duration;

    let h = common::init_repo();
    h.store.create_task(&tid("slow"), &NewTask::default()).unwrap();

    let agent = common::slow_then_succeeds_binary(h.dir.path());
    let scheduler = Arc::new(common::build_scheduler(&h, &agent, 1, Duration::from_secs(30)));
    let cancel = scheduler.cancel_token();

    let run_handle = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.run().unwrap())
    };

    // Give the worker time to claim the task and spawn the slow agent
    // before cancelling mid-flight.
    std::thread::sleep(Duration::from_millis(500));
    cancel.cancel();
    run_handle.join().unwrap();

    let task = h.store.get_task(&tid("slow")).unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
}

#[test]
fn independent_tasks_each_produce_one_merge_commit() {
    let h = common::init_repo();
    h.store.create_task(&tid("a"), &NewTask::default()).unwrap();
    h.store.create_task(&tid("b"), &NewTask::default()).unwrap();

    let agent = common::always_succeeds_binary(h.dir.path());
    common::run_scheduler(&h, &agent, 2);

    let repo = drover::workspace::git::GitRepo::new(h.dir.path().to_owned());
    repo.git_run(&["checkout", "main"]).unwrap();
    let log = repo.git_stdout(&["log", "--oneline"]).unwrap();
    // Two merge commits plus the orphan initial commit.
    assert_eq!(log.lines().count(), 3);
}
