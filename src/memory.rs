//! C9 Memory Tracker — periodic RSS sampling of running worker PIDs plus
//! system-available-memory, feeding the scheduler's memory guard
//! (`SPEC_FULL.md` §4.9). Built on the same `sysinfo` crate the executor
//! uses for its own per-process RSS sampling (`executor::spawn_rss_sampler`).

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sysinfo::{Pid, System};

use crate::model::WorkerId;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    pub current_rss_bytes: u64,
    pub peak_rss_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

struct Tracked {
    pid: u32,
    sample: MemorySample,
}

/// Samples RSS for a registered set of worker PIDs at a fixed interval
/// (default 5s per `spec.md` §4.9), silently dropping PIDs that have
/// exited. A worker calls [`Self::register`] when its agent subprocess
/// spawns and [`Self::unregister`] when it exits; sampling itself runs on
/// a dedicated background thread started by [`Self::spawn_sampler`].
pub struct MemoryTracker {
    workers: RwLock<HashMap<WorkerId, Tracked>>,
    interval: Duration,
    total_bytes: AtomicU64,
    available_bytes: AtomicU64,
}

impl MemoryTracker {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            interval,
            total_bytes: AtomicU64::new(0),
            available_bytes: AtomicU64::new(0),
        }
    }

    pub fn register(&self, worker: WorkerId, pid: u32) {
        let mut workers = self.workers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        workers.insert(worker, Tracked { pid, sample: MemorySample::default() });
    }

    pub fn unregister(&self, worker: &WorkerId) {
        let mut workers = self.workers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        workers.remove(worker);
    }

    #[must_use]
    pub fn sample_of(&self, worker: &WorkerId) -> Option<MemorySample> {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        workers.get(worker).map(|t| t.sample)
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Refresh every tracked worker's RSS once. PIDs that no longer exist
    /// are silently removed rather than reported as an error — the worker
    /// that owned them is responsible for reporting its own exit status.
    pub fn sample_once(&self, system: &mut System) {
        system.refresh_memory();
        self.total_bytes.store(system.total_memory(), Ordering::Relaxed);
        self.available_bytes.store(system.available_memory(), Ordering::Relaxed);

        let mut workers = self.workers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let pids: Vec<Pid> = workers.values().map(|t| Pid::from_u32(t.pid)).collect();
        if pids.is_empty() {
            return;
        }
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&pids), true);
        workers.retain(|_, tracked| {
            let Some(process) = system.process(Pid::from_u32(tracked.pid)) else {
                return false;
            };
            let rss = process.memory();
            tracked.sample.current_rss_bytes = rss;
            tracked.sample.peak_rss_bytes = tracked.sample.peak_rss_bytes.max(rss);
            true
        });
    }

    /// System-wide total/available memory as of the most recent
    /// [`Self::sample_once`] tick, used by the backpressure controller's
    /// memory guard (`spec.md` §4.5). Zeroed until the sampler's first tick.
    #[must_use]
    pub fn last_system_memory(&self) -> SystemMemory {
        SystemMemory {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            available_bytes: self.available_bytes.load(Ordering::Relaxed),
        }
    }

    /// `true` if any tracked worker's RSS (current or peak) has ever
    /// exceeded `ceiling_bytes` (`spec.md` §4.5 "any in-flight worker").
    #[must_use]
    pub fn any_exceeds_ceiling(&self, ceiling_bytes: u64) -> bool {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        workers.values().any(|t| t.sample.peak_rss_bytes > ceiling_bytes || t.sample.current_rss_bytes > ceiling_bytes)
    }

    /// Spawn a background thread that calls [`Self::sample_once`] on its
    /// own `System` at `interval` until `stop` is observed. Returned as a
    /// join handle so callers can shut it down deterministically in tests.
    pub fn spawn_sampler(self: std::sync::Arc<Self>, stop: std::sync::Arc<std::sync::atomic::AtomicBool>) -> std::thread::JoinHandle<()> {
        let interval = self.interval;
        std::thread::spawn(move || {
            let mut system = System::new();
            while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                self.sample_once(&mut system);
                std::thread::sleep(interval);
            }
        })
    }
}
