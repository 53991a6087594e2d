mod classifier;
mod config;
mod fingerprint;
mod history;
mod incidents;
mod provider;
mod reaper;
mod repetition;
mod retry;
mod sampler;
mod session;
mod signals;
mod status;
mod supervisor;
mod tracked;
mod trend;
mod watchdog;

use clap::{Parser, Subcommand};
use config::{ActionMode, WardenConfig};
use provider::ProcfsProvider;
use rusqlite::Connection;
use signals::SignalHandler;
use status::StatusTracker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use supervisor::Supervisor;
use tracked::{Diagnosis, HealthState};

/// Supervise a long-running command: watch its CPU, memory, and output,
/// diagnose runaway, stuck, leaking, or orphaned process trees, and reap them.
#[derive(Parser, Debug)]
#[command(name = "loopwarden", version, about)]
pub struct Cli {
    /// Extra logging (samples skipped, reaper polling)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command under supervision
    Run {
        /// Config file path
        #[arg(short, long, default_value = "warden.toml")]
        config: PathBuf,

        /// Report diagnoses but never kill a runaway, stuck, or leaking workload
        #[arg(long)]
        observe: bool,

        /// Write current state of every tracked process to this JSON file
        #[arg(long)]
        status_file: Option<PathBuf>,

        /// Record every diagnosis in this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,

        /// The command to supervise
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Validate config and print resolved settings
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "warden.toml")]
        config: PathBuf,
    },
    /// List recorded diagnoses, newest first
    Incidents {
        /// SQLite database written by `run --db`
        #[arg(long)]
        db: PathBuf,

        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Commands::Run {
            config,
            observe,
            status_file,
            db,
            command,
        } => run(&config, observe, status_file, db.as_deref(), command).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Incidents { db, limit } => list_incidents(&db, limit),
    };
    std::process::exit(code);
}

async fn run(
    config_path: &Path,
    observe: bool,
    status_file: Option<PathBuf>,
    db_path: Option<&Path>,
    command: Vec<String>,
) -> i32 {
    let mut config = match WardenConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if observe {
        config.action.mode = ActionMode::Observe;
    }

    let db = match db_path.map(incidents::open_or_create).transpose() {
        Ok(db) => db,
        Err(e) => {
            eprintln!("error: failed to open incident log: {e}");
            return 1;
        }
    };
    let mut status = status_file.map(StatusTracker::new);

    let mut signals = match SignalHandler::install() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to install signal handlers: {e}");
            return 1;
        }
    };

    let (supervisor, mut diagnoses) = Supervisor::new(config, Arc::new(ProcfsProvider::new()));
    let mut supervisor = supervisor.with_passthrough(true);

    let id = match supervisor.track(&command) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if let Some(status) = status.as_mut() {
        status.track(id, &command.join(" "));
    }
    let Some(mut state) = supervisor.subscribe(id) else {
        return 1;
    };

    loop {
        tokio::select! {
            Some(diagnosis) = diagnoses.recv() => record(&diagnosis, db.as_ref(), status.as_mut()),
            request = signals.recv() => supervisor.request_shutdown(request.is_immediate()).await,
            _ = state.wait_for(|s| s.is_terminal()) => break,
        }
    }

    let outcome = supervisor.wait(id).await;
    while let Ok(diagnosis) = diagnoses.try_recv() {
        record(&diagnosis, db.as_ref(), status.as_mut());
    }

    let code = match outcome {
        Some(outcome) if outcome.final_state == HealthState::Unreapable => 1,
        Some(outcome) if outcome.terminated => 1,
        Some(outcome) => outcome.exit_code.unwrap_or(1),
        None => 1,
    };
    // Keep the last known states around for anything that did not end cleanly.
    if code == 0 {
        if let Some(status) = status.as_ref() {
            status.remove();
        }
    }
    code
}

fn record(diagnosis: &Diagnosis, db: Option<&Connection>, status: Option<&mut StatusTracker>) {
    if let Some(conn) = db {
        if let Err(e) = incidents::insert_diagnosis(conn, diagnosis) {
            tracing::warn!(error = %e, "failed to record diagnosis");
        }
    }
    if let Some(status) = status {
        status.apply(diagnosis);
    }
}

fn check_config(path: &Path) -> i32 {
    match WardenConfig::load(path) {
        Ok(config) => {
            println!("{}: ok", path.display());
            println!("{config:#?}");
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn list_incidents(path: &Path, limit: u32) -> i32 {
    let rows = incidents::open_or_create(path).and_then(|conn| incidents::list_diagnoses(&conn, limit));
    match rows {
        Ok(rows) => {
            for row in rows {
                println!(
                    "#{}  {}  {}/{}  {} -> {}  {}",
                    row.id, row.created, row.pid, row.pgid, row.from_state, row.to_state, row.evidence
                );
            }
            0
        }
        Err(e) => {
            eprintln!("error: failed to read incident log {}: {e}", path.display());
            1
        }
    }
}
