//! `import_wizard` — CLI surface (§6.3) over the wizard engine, process
//! wiring, and the queue worker pool. Modeled on `casparian`'s `main.rs`:
//! a clap-derived `Cli`/`Commands`, `tracing_subscriber` registry wired to
//! a rolling log file plus stderr, and a uniform error-envelope exit path.

mod config;
mod wiring;
mod worker;

use clap::{Parser, Subcommand};
use config::RootOverrides;
use iw_canon::error::CoreError;
use iw_diagnostics::logging::{init_logging, LogConfig};
use iw_wizard::state::Mode;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "import_wizard", about = "Audiobook import wizard")]
struct Cli {
    /// Enable verbose (info/debug) console logging; file logging is
    /// always at the default filter regardless of this flag.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[arg(long, global = true, env = "IMPORT_WIZARD_INBOX_ROOT")]
    inbox_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, env = "IMPORT_WIZARD_STAGE_ROOT")]
    stage_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, env = "IMPORT_WIZARD_JOBS_ROOT")]
    jobs_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, env = "IMPORT_WIZARD_OUTBOX_ROOT")]
    outbox_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, env = "IMPORT_WIZARD_CONFIG_ROOT")]
    config_root: Option<std::path::PathBuf>,
    #[arg(long, global = true, env = "IMPORT_WIZARD_WIZARDS_ROOT")]
    wizards_root: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Begin a new (or resume a matching) wizard session over a source root.
    Start {
        #[arg(long)]
        root: String,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "stage")]
        mode: String,
    },
    /// Resume an existing session: current state plus the active step's prompt.
    Resume { session_id: String },
    /// Print the raw SessionState for a session.
    State { session_id: String },
    /// Submit an answer payload for one step.
    Step {
        session_id: String,
        step_id: String,
        #[arg(long = "json")]
        payload_json: String,
    },
    /// Compute (or recompute) the plan for a session still in phase 1.
    Plan { session_id: String },
    /// Deprecated: always returns INVARIANT_VIOLATION.
    Finalize { session_id: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig { app_name: "import_wizard", verbose: cli.verbose }) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    match run(&cli) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&err.to_envelope()).unwrap_or_default());
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<serde_json::Value, CoreError> {
    let overrides = RootOverrides {
        inbox: cli.inbox_root.clone(),
        stage: cli.stage_root.clone(),
        jobs: cli.jobs_root.clone(),
        outbox: cli.outbox_root.clone(),
        config: cli.config_root.clone(),
        wizards: cli.wizards_root.clone(),
    };
    let roots = config::resolve_roots(overrides);
    roots.ensure_dirs().map_err(|e| CoreError::internal(format!("failed to create root directories: {}", e)))?;

    let mode_hint = if let Commands::Start { mode, .. } = &cli.command {
        Mode::parse(mode).ok_or_else(|| CoreError::validation("$.mode", "unknown_mode", format!("unknown mode: {}", mode)))?
    } else {
        Mode::Stage
    };
    let parallelism = mode_hint.default_parallelism();

    let process = wiring::Process::build(&roots, parallelism)
        .map_err(|e| CoreError::internal(format!("failed to acquire patches-root lock: {}", e)))?;

    let output = match &cli.command {
        Commands::Start { root, path, mode } => {
            let mode = Mode::parse(mode).ok_or_else(|| CoreError::validation("$.mode", "unknown_mode", format!("unknown mode: {}", mode)))?;
            let state = process.engine.create_session(root, path, mode, None)?;
            session_envelope(&process, &state.session_id, state)?
        }
        Commands::Resume { session_id } => {
            let state = process.engine.get_state(session_id)?;
            session_envelope(&process, session_id, state)?
        }
        Commands::State { session_id } => serde_json::to_value(process.engine.get_state(session_id)?)
            .map_err(|e| CoreError::internal(e.to_string()))?,
        Commands::Step { session_id, step_id, payload_json } => {
            let payload: serde_json::Value =
                serde_json::from_str(payload_json).map_err(|e| CoreError::validation("$.json", "invalid_json", format!("payload is not valid JSON: {}", e)))?;
            if !payload.is_object() {
                return Err(CoreError::validation("$.json", "invalid_payload", "payload must be a JSON object"));
            }
            let state = process.engine.submit_step(session_id, step_id, payload)?;
            let mut out = session_envelope(&process, session_id, state.clone())?;

            // Mirrors the renderer-triggered "begin phase 2" transition:
            // reaching the terminal "processing" step implicitly confirms
            // and starts processing rather than requiring a separate
            // command this CLI surface doesn't expose (§6.3).
            if state.current_step_id == "processing" {
                let idempotency = iw_jobs::IdempotencyMap::load(process.jail.clone(), session_id)?;
                let result = process.engine.start_processing(session_id, true, &idempotency)?;
                let drained = worker::drain_pending_import_jobs(&process);
                if let Some(obj) = out.as_object_mut() {
                    obj.insert("start_processing".to_string(), serde_json::json!({
                        "job_ids": result.job_ids,
                        "batch_size": result.batch_size,
                    }));
                    obj.insert("drained_job_ids".to_string(), serde_json::json!(drained));
                }
            }
            out
        }
        Commands::Plan { session_id } => serde_json::to_value(process.engine.compute_plan(session_id)?)
            .map_err(|e| CoreError::internal(e.to_string()))?,
        Commands::Finalize { .. } => {
            return Err(CoreError::invariant_reason("finalize_deprecated", "finalize is deprecated; use step submission through the terminal step"));
        }
    };

    Ok(output)
}

fn session_envelope(process: &wiring::Process, session_id: &str, state: iw_wizard::state::SessionState) -> Result<serde_json::Value, CoreError> {
    let step_id = state.current_step_id.clone();
    let step = if step_id.is_empty() {
        None
    } else {
        process.engine.get_step_definition(session_id, &step_id).ok()
    };
    Ok(serde_json::json!({
        "session_id": session_id,
        "state": state,
        "prompt": {
            "current_step_id": step_id,
            "step": step,
        },
    }))
}
