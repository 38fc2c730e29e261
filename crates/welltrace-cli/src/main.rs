//! Replays liquid-handling run plans through simulated, tracked instruments.
//!
//! Every call in the plan goes through the tracking wrappers, so the output
//! is the same audit log a real run would produce: each action with volumes
//! and flow rates, the remaining well volumes, and any anomalies.
//!
//! # Usage
//!
//! ```bash
//! # Replay a plan and stream the tracking log
//! welltrace run plan.json
//!
//! # Fail (exit 1) if anything was clamped or unattributed
//! welltrace run plan.json --strict
//!
//! # Machine-readable report plus a JSONL audit trail in ~/.welltrace/logs
//! welltrace run plan.json --format json --audit-log
//!
//! # Stop after every anomaly until Enter is pressed
//! welltrace run plan.json --pause-on-error
//!
//! # Validate names and arguments without running anything
//! welltrace check plan.json
//! ```

mod plan;
mod runner;
mod sink;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use welltrace_core::config::WelltraceConfig;
use welltrace_core::log::{ConsoleSink, JsonlSink, LogSink};
use welltrace_core::tracker::Tracker;

use plan::{PlanError, ResolvedPlan, RunPlan};
use runner::{Deck, StepFailure};
use sink::PauseOnError;

/// Replay liquid-handling run plans with volume and tip tracking.
#[derive(Parser)]
#[command(name = "welltrace")]
#[command(about = "Replay liquid-handling run plans through tracked, simulated instruments")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Suppress the streamed log and the simulator run log
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    /// Write diagnostics as JSON to this file instead of stderr
    #[arg(long, env = "WELLTRACE_TRACE_FILE", global = true)]
    trace_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a run plan against simulated instruments
    Run {
        /// Path to the run plan (JSON)
        plan: PathBuf,
        /// Write the tracking log as a JSONL audit trail
        #[arg(long)]
        audit_log: bool,
        /// Wait for Enter after each anomaly
        #[arg(long)]
        pause_on_error: bool,
        /// Exit with status 1 if any anomaly was logged
        #[arg(long)]
        strict: bool,
    },

    /// Parse and resolve a run plan without executing it
    Check {
        /// Path to the run plan (JSON)
        plan: PathBuf,
    },
}

fn init_tracing(trace_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match trace_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("welltrace.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.trace_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    /// Anomalies were logged and `--strict` was given.
    Anomalies(usize),
    Plan(String),
    Driver(String),
    Io(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Anomalies(_) => ExitCode::from(1),
            CliError::Plan(_) => ExitCode::from(2),
            CliError::Driver(_) => ExitCode::from(3),
            CliError::Io(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Anomalies(n) => write!(f, "{} anomalies logged (strict mode)", n),
            CliError::Plan(msg) => write!(f, "Plan error: {}", msg),
            CliError::Driver(msg) => write!(f, "Instrument error: {}", msg),
            CliError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl From<PlanError> for CliError {
    fn from(e: PlanError) -> Self {
        if e.is_io() {
            CliError::Io(e.to_string())
        } else {
            CliError::Plan(e.to_string())
        }
    }
}

impl From<StepFailure> for CliError {
    fn from(f: StepFailure) -> Self {
        let instrument = f.instrument.as_deref().unwrap_or("<unbound>");
        CliError::Driver(format!(
            "step {} ({} on {}) failed: {}",
            f.step, f.call, instrument, f.error
        ))
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Check { plan } => check_plan(&cli, plan),
        Command::Run {
            plan,
            audit_log,
            pause_on_error,
            strict,
        } => {
            let options = RunOptions {
                audit_log: *audit_log,
                pause_on_error: *pause_on_error,
                strict: *strict,
            };
            run_plan(&cli, plan, options).await
        }
    }
}

fn check_plan(cli: &Cli, path: &Path) -> Result<(), CliError> {
    let plan = RunPlan::load(path)?.resolve()?;
    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "valid": true,
                "name": plan.name,
                "labware": plan.labware.len(),
                "pipettes": plan.pipettes.len(),
                "modules": plan.modules.len(),
                "steps": plan.steps.len(),
            })
        ),
        OutputFormat::Text => println!(
            "Plan '{}' OK: {} steps, {} labware, {} pipettes, {} modules",
            plan.name,
            plan.steps.len(),
            plan.labware.len(),
            plan.pipettes.len(),
            plan.modules.len()
        ),
    }
    Ok(())
}

struct RunOptions {
    audit_log: bool,
    pause_on_error: bool,
    strict: bool,
}

async fn run_plan(cli: &Cli, path: &Path, options: RunOptions) -> Result<(), CliError> {
    let config = WelltraceConfig::load();
    let plan = RunPlan::load(path)?.resolve()?;

    let color = config.color && !cli.no_color && cli.format == OutputFormat::Text;
    let streaming = cli.format == OutputFormat::Text && !cli.quiet;
    let pause = options.pause_on_error || config.pause_on_error;

    let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
    let console = ConsoleSink::new(color);
    match (streaming, pause) {
        (true, true) => sinks.push(Box::new(PauseOnError::new(console))),
        (true, false) => sinks.push(Box::new(console)),
        (false, true) => warn!("pause on error needs streamed text output; ignoring"),
        (false, false) => {}
    }

    let audit_path = if options.audit_log || config.audit_log {
        let (sink, path) = open_audit_trail(&config, &plan)?;
        sinks.push(Box::new(sink));
        Some(path)
    } else {
        None
    };

    let tracker = Tracker::with_sinks(sinks);
    info!(run = %tracker.id, plan = %plan.name, steps = plan.steps.len(), "starting run");
    let deck = Deck::load(&tracker, &plan);
    let outcome = deck.execute(&tracker, &plan.steps).await;

    match cli.format {
        OutputFormat::Json => print_json_report(&plan, &tracker, &deck, &outcome, audit_path.as_deref()),
        OutputFormat::Text => print_text_report(cli.quiet, &tracker, &deck, &outcome, audit_path.as_deref()),
    }

    outcome?;
    let errors = tracker.summary().errors;
    if options.strict && errors > 0 {
        return Err(CliError::Anomalies(errors));
    }
    Ok(())
}

fn open_audit_trail(
    config: &WelltraceConfig,
    plan: &ResolvedPlan,
) -> Result<(JsonlSink, PathBuf), CliError> {
    let dir = config.audit_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| CliError::Io(format!("Cannot create {}: {}", dir.display(), e)))?;
    let stem: String = plan
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{}_{}.jsonl", stem, timestamp));
    let sink = JsonlSink::create(&path)
        .map_err(|e| CliError::Io(format!("Cannot create {}: {}", path.display(), e)))?;
    Ok((sink, path))
}

fn print_text_report(
    quiet: bool,
    tracker: &Tracker,
    deck: &Deck,
    outcome: &Result<usize, StepFailure>,
    audit_path: Option<&Path>,
) {
    let summary = tracker.summary();

    if !quiet {
        println!();
        println!("Simulator run log:");
        for (instrument, commands) in deck.run_log() {
            println!("  {}:", instrument);
            for command in commands {
                println!("    {}", command);
            }
        }
    }

    println!();
    println!("Tip usage:");
    if summary.tip_usage.is_empty() {
        println!("  (none)");
    }
    for (tip_type, count) in &summary.tip_usage {
        println!("  {}: {}", tip_type, count);
    }

    println!();
    match outcome {
        Ok(steps) => println!(
            "Completed {} steps: {} actions, {} info, {} errors",
            steps, summary.actions, summary.infos, summary.errors
        ),
        Err(failure) => println!(
            "Stopped at step {}: {} actions, {} info, {} errors",
            failure.step, summary.actions, summary.infos, summary.errors
        ),
    }
    if let Some(path) = audit_path {
        println!("Audit trail: {}", path.display());
    }
}

fn print_json_report(
    plan: &ResolvedPlan,
    tracker: &Tracker,
    deck: &Deck,
    outcome: &Result<usize, StepFailure>,
    audit_path: Option<&Path>,
) {
    let report = json!({
        "plan": plan.name,
        "completed": outcome.as_ref().ok(),
        "failure": outcome.as_ref().err(),
        "summary": tracker.summary(),
        "log": tracker.get_logs(),
        "run_log": deck.run_log(),
        "audit_trail": audit_path.map(|p| p.display().to_string()),
    });
    match serde_json::to_string_pretty(&report) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to serialize report: {}", e),
    }
}
