//! C8 Event Bus — typed pub/sub for scheduler and worker lifecycle events
//! (`SPEC_FULL.md` §4.8), backing the `status --watch` CLI and any future
//! external consumer.
//!
//! Each subscriber gets its own bounded `crossbeam_channel`; a slow
//! subscriber drops events rather than stalling publishers, the same
//! trade-off the teacher's task-pipeline fan-out makes for progress
//! notifications.

use std::sync::RwLock;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::model::{EpicId, TaskId, WorkerId};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    TaskClaimed { task_id: TaskId, worker: WorkerId },
    TaskStarted { task_id: TaskId, worker: WorkerId },
    TaskCompleted { task_id: TaskId, worker: WorkerId },
    TaskFailed { task_id: TaskId, worker: WorkerId, reason: String },
    TaskPaused { task_id: TaskId, reason: String },
    TaskResumed { task_id: TaskId },
    TaskGuidance { task_id: TaskId, guidance: String },
    StatsUpdate { ready: u64, in_progress: u64, completed: u64, failed: u64, blocked: u64 },
}

impl Event {
    #[must_use]
    pub fn epic_hint(&self) -> Option<&EpicId> {
        None
    }
}

struct Subscriber {
    sender: Sender<Event>,
}

/// Publishes events to any number of bounded subscriber channels. Cloned
/// freely; internally reference-counted state would be overkill for a
/// single-process orchestrator, so this just holds a lock-protected `Vec`.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a new subscriber, returning its receive end. In-order
    /// delivery is guaranteed per subscription; a full channel drops the
    /// new event rather than blocking the publisher.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Receiver<Event> {
        let (tx, rx) = bounded(capacity);
        let mut subs = self.subscribers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.push(Subscriber { sender: tx });
        rx
    }

    /// Deliver `event` to all subscribers, dropping it for any subscriber
    /// whose channel is currently full.
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        for sub in subs.iter() {
            match sub.sender.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("event subscriber channel full, dropping event");
                }
            }
        }
    }

    /// Drop subscribers whose receive end has been disconnected, keeping
    /// the subscriber list from growing unbounded across a long scheduler
    /// run with many short-lived `status --watch` sessions.
    pub fn prune_disconnected(&self) {
        let mut subs = self.subscribers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.retain(|s| {
            !matches!(
                s.sender.try_send(Event::StatsUpdate {
                    ready: 0,
                    in_progress: 0,
                    completed: 0,
                    failed: 0,
                    blocked: 0
                }),
                Err(TrySendError::Disconnected(_))
            )
        });
    }
}
