use anyhow::Result;
use clap::{Parser, Subcommand};

use drover::cli::{
    AddArgs, EpicCommands, ExportArgs, InitArgs, ResetArgs, ResumeArgs, RunArgs, StatusArgs,
};

/// Local orchestrator for coding-agent subprocesses
///
/// drover drives many coding-agent subprocesses across a dependency graph
/// of tasks. Each task runs in its own isolated git worktree; completed
/// work merges back into the trunk branch automatically.
///
/// QUICK START:
///
///   drover init
///   drover add "Write the parser" --priority 10
///   drover run
///
/// Tasks can depend on each other:
///
///   drover add "Write the lexer" --id lexer
///   drover add "Write the parser" --id parser --blocked-by lexer
///
/// Check progress at any time:
///
///   drover status --watch
#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'drover <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize drover in the current repository
    Init(InitArgs),

    /// Run the scheduler until no work remains
    Run(RunArgs),

    /// Resume a previously interrupted run
    Resume(ResumeArgs),

    /// Create a new task
    Add(AddArgs),

    /// Manage epics
    #[command(subcommand)]
    Epic(EpicCommands),

    /// Show project status
    Status(StatusArgs),

    /// Reset tasks back to ready
    Reset(ResetArgs),

    /// Export tasks and epics as beads JSONL
    Export(ExportArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Run(args) if args.verbose);
    let _guard = drover::telemetry::init(verbose);

    match &cli.command {
        Commands::Init(args) => drover::cli::run_init(args),
        Commands::Run(args) => drover::cli::run_scheduler(args),
        Commands::Resume(args) => drover::cli::run_resume(args),
        Commands::Add(args) => drover::cli::run_add(args),
        Commands::Epic(cmd) => drover::cli::run_epic(cmd),
        Commands::Status(args) => drover::cli::run_status(args),
        Commands::Reset(args) => drover::cli::run_reset(args),
        Commands::Export(args) => drover::cli::run_export(args),
    }
}
