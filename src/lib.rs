//! drover library crate — the orchestration engine behind the `drover` CLI.
//!
//! Components map directly onto the design's numbered pieces: a durable
//! task store (`store`), git-worktree workspace isolation (`workspace`),
//! an agent subprocess executor (`executor`), a backpressure controller
//! (`backpressure`), the scheduler main loop (`scheduler`), per-task
//! workers (`worker`), a typed event bus (`events`), and RSS memory
//! tracking (`memory`).

pub mod backpressure;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod export;
pub mod memory;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;
pub mod workspace;
