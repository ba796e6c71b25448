//! Drover CLI subcommands (`SPEC_FULL.md` §7): `init`, `run`, `add`,
//! `epic add`, `status`, `resume`, `reset`, `export`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};

use crate::backpressure::BackpressureController;
use crate::config::DroverConfig;
use crate::events::EventBus;
use crate::executor::AgentExecutor;
use crate::memory::MemoryTracker;
use crate::model::{EpicId, TaskId, TaskStatus};
use crate::scheduler::{Scheduler, SchedulerConfig, install_signal_handler};
use crate::store::{NewTask, TaskStore};
use crate::workspace::{WorkspaceManager, WorkspacePool};

const DB_FILE: &str = "tasks.db";

#[derive(Subcommand)]
pub enum EpicCommands {
    /// Create a new epic
    Add(EpicAddArgs),
}

#[derive(Args, Debug)]
pub struct EpicAddArgs {
    /// Epic title
    pub title: String,

    /// Epic id (defaults to a slug of the title)
    #[arg(long)]
    pub id: Option<String>,

    /// Epic description
    #[arg(long, default_value = "")]
    pub description: String,
}

/// Initialize Drover in the current repository
///
/// Creates `.drover/` (task store, config, worktrees, cache) and
/// bootstraps the trunk branch if the repository has no commits yet.
/// Safe to run multiple times.
#[derive(Args, Debug)]
pub struct InitArgs;

/// Run the scheduler until no work remains
///
/// Drives claim → dispatch → completion for every ready task, recovering
/// any state left behind by a prior crash before starting.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Maximum concurrent workers (defaults to config/`.drover/config.toml`)
    #[arg(long)]
    pub workers: Option<u32>,

    /// Restrict to tasks in this epic
    #[arg(long)]
    pub epic: Option<String>,

    /// Verbose logging (`RUST_LOG=debug`)
    #[arg(long)]
    pub verbose: bool,
}

/// Resume a previously interrupted run
///
/// Identical to `run`, provided as a separate, more discoverable verb for
/// the common "I stopped it, now continue" case.
#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[arg(long)]
    pub workers: Option<u32>,

    #[arg(long)]
    pub epic: Option<String>,
}

/// Create a new task
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Task title
    pub title: String,

    /// Task id (defaults to a slug of the title)
    #[arg(long)]
    pub id: Option<String>,

    /// Task description
    #[arg(long, default_value = "")]
    pub description: String,

    /// Epic this task belongs to
    #[arg(long)]
    pub epic: Option<String>,

    /// Scheduling priority, higher claims first (default 0)
    #[arg(long, default_value_t = 0)]
    pub priority: i64,

    /// Task ids that must complete before this one becomes ready
    #[arg(long = "blocked-by")]
    pub blocked_by: Vec<String>,

    /// Maximum attempts before the task is marked failed (default 3)
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}

/// Show project status
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Keep redrawing status every second instead of printing once
    #[arg(long)]
    pub watch: bool,

    /// Restrict to tasks in this epic
    #[arg(long)]
    pub epic: Option<String>,
}

/// Reset tasks back to ready
///
/// With no flags, resets the spec's documented default set: claimed,
/// in-progress, and completed tasks. Pass one or more flags to reset a
/// specific subset instead.
#[derive(Args, Debug)]
pub struct ResetArgs {
    #[arg(long)]
    pub completed: bool,
    #[arg(long)]
    pub in_progress: bool,
    #[arg(long)]
    pub claimed: bool,
    #[arg(long)]
    pub failed: bool,
}

/// Export tasks and epics as beads JSONL
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Output file (defaults to `drover-export.jsonl`)
    #[arg(long, default_value = "drover-export.jsonl")]
    pub output: PathBuf,
}

fn project_root() -> Result<PathBuf> {
    std::env::current_dir().context("could not determine current directory")
}

fn drover_dir(root: &Path) -> PathBuf {
    root.join(".drover")
}

fn db_path(root: &Path) -> PathBuf {
    drover_dir(root).join(DB_FILE)
}

fn slug(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_owned();
    if slug.is_empty() { "task".to_owned() } else { slug }
}

pub fn run_init(_args: &InitArgs) -> Result<()> {
    let root = project_root()?;
    let dir = drover_dir(&root);
    std::fs::create_dir_all(&dir)?;
    std::fs::create_dir_all(dir.join("worktrees"))?;
    std::fs::create_dir_all(dir.join("cache"))?;

    let config = DroverConfig::load(&root)?;
    let _store = TaskStore::open(&db_path(&root)).context("opening task store")?;

    let manager = WorkspaceManager::new(&root, &config.trunk_branch, "claude");
    manager.ensure_trunk_branch().context("bootstrapping trunk branch")?;

    println!("Initialized drover in {}", dir.display());
    Ok(())
}

pub fn run_add(args: &AddArgs) -> Result<()> {
    let root = project_root()?;
    let store = TaskStore::open(&db_path(&root))?;

    let id = TaskId::new(args.id.clone().unwrap_or_else(|| slug(&args.title)))
        .context("invalid task id")?;
    let epic_id = args.epic.as_deref().map(EpicId::new).transpose().context("invalid epic id")?;
    let blocked_by = args
        .blocked_by
        .iter()
        .map(|s| TaskId::new(s.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("invalid blocker id")?;

    store.create_task(
        &id,
        &NewTask {
            title: args.title.clone(),
            description: args.description.clone(),
            epic_id,
            parent_id: None,
            priority: args.priority,
            max_attempts: args.max_attempts,
            blocked_by,
        },
    )?;

    println!("Created task '{id}'");
    Ok(())
}

pub fn run_epic(cmd: &EpicCommands) -> Result<()> {
    let EpicCommands::Add(args) = cmd;
    let root = project_root()?;
    let store = TaskStore::open(&db_path(&root))?;
    let id = EpicId::new(args.id.clone().unwrap_or_else(|| slug(&args.title))).context("invalid epic id")?;
    store.create_epic(&id, &args.title, &args.description)?;
    println!("Created epic '{id}'");
    Ok(())
}

pub fn run_scheduler(args: &RunArgs) -> Result<()> {
    run_scheduler_inner(args.workers, args.epic.as_deref())
}

pub fn run_resume(args: &ResumeArgs) -> Result<()> {
    run_scheduler_inner(args.workers, args.epic.as_deref())
}

fn run_scheduler_inner(workers_override: Option<u32>, epic: Option<&str>) -> Result<()> {
    let root = project_root()?;
    let config = DroverConfig::load(&root)?;
    let store = Arc::new(TaskStore::open(&db_path(&root))?);

    let manager = Arc::new(WorkspaceManager::new(&root, &config.trunk_branch, "claude"));
    manager.ensure_trunk_branch()?;
    let pool = Arc::new(WorkspacePool::new(
        Arc::clone(&manager),
        &root,
        config.cache_dir.clone(),
        config.pool_min,
        config.pool_max,
    ));
    pool.warm_n(config.pool_warmup)?;

    let executor = Arc::new(
        AgentExecutor::new(config.agent_binary.clone(), config.slow_threshold)
            .with_env(pool.cache_env())
            .with_memory_ceiling(config.mem_worker_ceiling_bytes),
    );

    let memory = Arc::new(MemoryTracker::new(Duration::from_secs(5)));
    let sampler_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sampler_handle = Arc::clone(&memory).spawn_sampler(Arc::clone(&sampler_stop));

    let max_workers = workers_override.unwrap_or(config.workers);
    let backpressure = Arc::new(
        BackpressureController::new(max_workers, 1).with_memory_guard(
            Arc::clone(&memory),
            config.mem_hard_threshold_bytes,
            config.mem_worker_ceiling_bytes,
        ),
    );
    let events = Arc::new(EventBus::new());

    let epic_filter = epic.map(EpicId::new).transpose().context("invalid epic id")?;

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        pool,
        manager,
        executor,
        backpressure,
        events,
        Arc::clone(&memory),
        SchedulerConfig {
            max_workers,
            epic_filter,
            task_deadline: config.task_timeout,
        },
    );

    install_signal_handler(scheduler.cancel_token())?;
    scheduler.reclassify_after_crash()?;

    let status = scheduler.run()?;

    sampler_stop.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = sampler_handle.join();

    println!(
        "Done: {} completed, {} failed, {} remaining",
        status.completed,
        status.failed,
        status.ready + status.claimed + status.in_progress + status.blocked + status.paused
    );
    Ok(())
}

pub fn run_status(args: &StatusArgs) -> Result<()> {
    let root = project_root()?;
    let store = TaskStore::open(&db_path(&root))?;
    let epic = args.epic.as_deref().map(EpicId::new).transpose().context("invalid epic id")?;

    if !args.watch {
        print_status(&store, epic.as_ref())?;
        return Ok(());
    }

    loop {
        print!("\x1b[2J\x1b[H");
        print_status(&store, epic.as_ref())?;
        std::io::stdout().flush()?;
        if crossterm::event::poll(Duration::from_secs(1))?
            && let crossterm::event::Event::Key(key) = crossterm::event::read()?
            && (key.code == crossterm::event::KeyCode::Char('q')
                || (key.code == crossterm::event::KeyCode::Char('c')
                    && key.modifiers.contains(crossterm::event::KeyModifiers::CONTROL)))
        {
            break;
        }
    }
    Ok(())
}

fn print_status(store: &TaskStore, epic: Option<&EpicId>) -> Result<()> {
    let status = store.project_status()?;
    println!(
        "ready={} claimed={} in_progress={} paused={} blocked={} completed={} failed={} ({:.1}%)",
        status.ready,
        status.claimed,
        status.in_progress,
        status.paused,
        status.blocked,
        status.completed,
        status.failed,
        status.progress_percent()
    );
    for task in store.list_tasks(epic)? {
        println!("  [{}] {} — {}", task.status, task.id, task.title);
    }
    Ok(())
}

pub fn run_reset(args: &ResetArgs) -> Result<()> {
    let root = project_root()?;
    let store = TaskStore::open(&db_path(&root))?;

    let mut targets = Vec::new();
    if args.completed {
        targets.push(TaskStatus::Completed);
    }
    if args.in_progress {
        targets.push(TaskStatus::InProgress);
    }
    if args.claimed {
        targets.push(TaskStatus::Claimed);
    }
    if args.failed {
        targets.push(TaskStatus::Failed);
    }

    let count = store.reset(&targets)?;
    println!("Reset {count} task(s) to ready");
    Ok(())
}

pub fn run_export(args: &ExportArgs) -> Result<()> {
    let root = project_root()?;
    let store = TaskStore::open(&db_path(&root))?;
    if args.output.exists() {
        bail!(
            "Refusing to overwrite existing file '{}'; pass a different --output path",
            args.output.display()
        );
    }
    crate::export::write_jsonl(&store, &args.output)?;
    println!("Exported to {}", args.output.display());
    Ok(())
}
