//! C5 Backpressure Controller — the M/N/k/B/T state machine that bounds
//! concurrent agent spawns (`SPEC_FULL.md` §4.5).
//!
//! `M` (max concurrency), `N` (currently running), `k` (consecutive
//! rate-limit hits), `B` (backoff-until instant), `T` (the floor `M` may
//! never drop below) all live behind one `Mutex`, matching the single-lock
//! discipline the rest of this crate uses for small, frequently-contended
//! state (`store::TaskStore`, `workspace::pool::WorkspacePool`).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::executor::Signal;
use crate::memory::MemoryTracker;

const MIN_CONCURRENCY: u32 = 1;
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Consecutive slow-response signals before `M` is shrunk by one
/// (`spec.md` §4.5 "k_slow").
const K_SLOW: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct BackpressureStats {
    pub max_concurrency: u32,
    pub running: u32,
    pub consecutive_rate_limits: u32,
    pub in_backoff: bool,
    pub floor: u32,
}

struct State {
    max_concurrency: u32,
    /// `m_max`: the ceiling `Ok` signals grow `max_concurrency` back toward,
    /// never above — the value `initial_max` started at.
    ceiling: u32,
    running: u32,
    consecutive_rate_limits: u32,
    consecutive_slow: u32,
    backoff_until: Option<Instant>,
    floor: u32,
}

struct MemoryGuard {
    tracker: Arc<MemoryTracker>,
    hard_threshold_bytes: u64,
    worker_ceiling_bytes: u64,
}

/// Bounds concurrent agent spawns and backs off on upstream rate limits
/// (`spec.md` §4.5). `floor` is the never-go-below concurrency (`T`);
/// `initial_max` is both the starting `M` and the ceiling `M` is restored
/// toward on sustained success.
pub struct BackpressureController {
    state: Mutex<State>,
    memory: Option<MemoryGuard>,
}

impl BackpressureController {
    #[must_use]
    pub fn new(initial_max: u32, floor: u32) -> Self {
        let floor = floor.max(MIN_CONCURRENCY);
        let initial_max = initial_max.max(floor);
        Self {
            state: Mutex::new(State {
                max_concurrency: initial_max,
                ceiling: initial_max,
                running: 0,
                consecutive_rate_limits: 0,
                consecutive_slow: 0,
                backoff_until: None,
                floor,
            }),
            memory: None,
        }
    }

    /// Consult `tracker` in [`Self::can_spawn`]: refuse to spawn while
    /// system-available memory is below `hard_threshold_bytes`, or while any
    /// registered worker's RSS exceeds `worker_ceiling_bytes` (`spec.md` §4.5
    /// "Memory guard").
    #[must_use]
    pub fn with_memory_guard(mut self, tracker: Arc<MemoryTracker>, hard_threshold_bytes: u64, worker_ceiling_bytes: u64) -> Self {
        self.memory = Some(MemoryGuard {
            tracker,
            hard_threshold_bytes,
            worker_ceiling_bytes,
        });
        self
    }

    /// `true` if another worker may be spawned right now.
    #[must_use]
    pub fn can_spawn(&self) -> bool {
        {
            let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(until) = state.backoff_until {
                if Instant::now() < until {
                    return false;
                }
            }
            if state.running >= state.max_concurrency {
                return false;
            }
        }
        if let Some(guard) = &self.memory {
            let system = guard.tracker.last_system_memory();
            if system.available_bytes > 0 && system.available_bytes < guard.hard_threshold_bytes {
                return false;
            }
            if guard.tracker.any_exceeds_ceiling(guard.worker_ceiling_bytes) {
                return false;
            }
        }
        true
    }

    pub fn worker_started(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.running += 1;
    }

    pub fn worker_finished(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.running = state.running.saturating_sub(1);
    }

    /// `true` while a backoff window is active.
    #[must_use]
    pub fn in_backoff(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.backoff_until.is_some_and(|until| Instant::now() < until)
    }

    #[must_use]
    pub fn stats(&self) -> BackpressureStats {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        BackpressureStats {
            max_concurrency: state.max_concurrency,
            running: state.running,
            consecutive_rate_limits: state.consecutive_rate_limits,
            in_backoff: state.backoff_until.is_some_and(|until| Instant::now() < until),
            floor: state.floor,
        }
    }

    /// Apply a worker's outcome signal (`spec.md` §4.5 four transition
    /// rules: ok, rate-limited, slow-response, api-error). `M` never drops
    /// below `floor` nor grows past `ceiling`.
    pub fn on_signal(&self, signal: Signal) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match signal {
            Signal::Ok => {
                state.consecutive_rate_limits = 0;
                state.consecutive_slow = 0;
                state.max_concurrency = (state.max_concurrency + 1).min(state.ceiling);
                state.backoff_until = None;
            }
            Signal::RateLimited => {
                state.consecutive_rate_limits += 1;
                state.max_concurrency = (state.max_concurrency / 2).max(state.floor);
                let backoff = backoff_duration(state.consecutive_rate_limits);
                state.backoff_until = Some(Instant::now() + backoff);
            }
            Signal::SlowResponse => {
                state.consecutive_slow += 1;
                if state.consecutive_slow >= K_SLOW {
                    state.max_concurrency = state.max_concurrency.saturating_sub(1).max(state.floor);
                    state.consecutive_slow = 0;
                }
            }
            Signal::ApiError => {
                // Surfaced via tracing elsewhere; not punitive on its own.
            }
        }
    }
}

fn backoff_duration(consecutive: u32) -> Duration {
    let scale = 1u32 << consecutive.min(6);
    (BACKOFF_BASE * scale).min(BACKOFF_MAX)
}
