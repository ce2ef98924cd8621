// src/main.rs - engine-host: run a JSON protocol on the simulated robot
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use pipette_rs::hardware::executor::ExecutionStats;
use pipette_rs::hardware::{SimulatedExecutor, SimulatedHardware};
use pipette_rs::{CommandEngine, EngineError, EngineState, EngineStatus, QueueStatus, StandardRecoveryPolicy};
use pipette_shared::command::RawCommandRequest;
use pipette_shared::config::{load_config, Config};
use pipette_shared::{Command, CommandIntent, CommandRequest, ErrorOccurrence, StateUpdate};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Run a protocol against the simulated robot and print a run summary.
#[derive(Parser, Debug)]
#[command(name = "engine-host", about = "Run a liquid-handling protocol on the simulated robot.")]
struct Cli {
    /// Path to a TOML config file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Protocol file: a JSON array of {commandType, params, intent?, key?}
    #[arg(short, long)]
    protocol: PathBuf,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    status: EngineStatus,
    commands: Vec<Command>,
    errors: Vec<ErrorOccurrence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_error: Option<ErrorOccurrence>,
    stats: ExecutionStats,
}

enum HostWait {
    Done,
    AwaitingRecovery,
}

fn done_or_awaiting_recovery(state: &EngineState) -> Result<Option<HostWait>, EngineError> {
    let commands = state.commands();
    if let Some(error) = commands.get_fatal_error() {
        return Err(EngineError::CacheInconsistency(error.clone()));
    }
    if commands.queue_status() == QueueStatus::AwaitingRecovery
        && commands.get_running_command_id().is_none()
        && commands.get_queue_ids(CommandIntent::Fixit).next().is_none()
    {
        return Ok(Some(HostWait::AwaitingRecovery));
    }
    Ok(commands.all_commands_final().then_some(HostWait::Done))
}

fn load_protocol(path: &Path) -> Result<Vec<CommandRequest>, BoxError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read protocol file '{}': {}", path.display(), e);
        e
    })?;
    let raw: Vec<RawCommandRequest> = serde_json::from_str(&contents)?;
    let requests = raw
        .into_iter()
        .map(CommandRequest::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(requests)
}

/// A timeout too large to represent as a deadline means no deadline.
fn deadline_for(timeout: Option<Duration>) -> Option<(Instant, Duration)> {
    let timeout = timeout?;
    Instant::now().checked_add(timeout).map(|deadline| (deadline, timeout))
}

/// Drive the run to completion, resuming every recovery pause as-is since
/// there is no operator to fix anything.
async fn run_to_completion(engine: &CommandEngine, timeout: Option<Duration>) -> Result<(), EngineError> {
    let deadline = deadline_for(timeout);
    loop {
        let wait = engine.wait_for(done_or_awaiting_recovery);
        let outcome = match deadline {
            Some((deadline, timeout)) => tokio::time::timeout_at(deadline, wait)
                .await
                .map_err(|_| EngineError::WaitTimeout(timeout))?,
            None => wait.await,
        };
        match outcome? {
            HostWait::Done => return Ok(()),
            HostWait::AwaitingRecovery => {
                if let Some(target) = engine.get_recovery_target() {
                    let detail = target.error.as_ref().map(|e| e.detail.as_str()).unwrap_or("unknown error");
                    tracing::warn!(
                        "Command {} ({}) awaits recovery: {}; resuming without correction",
                        target.id,
                        target.command_type(),
                        detail
                    );
                }
                engine.resume_from_recovery(StateUpdate::new())?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            load_config(&path.to_string_lossy())?
        }
        None => Config::default(),
    };
    let requests = load_protocol(&cli.protocol)?;
    tracing::info!("Loaded {} commands from {}", requests.len(), cli.protocol.display());

    let hardware = Arc::new(SimulatedHardware::new());
    let executor = Arc::new(SimulatedExecutor::new(hardware.clone(), config.simulation.clone()));
    let policy = Arc::new(StandardRecoveryPolicy::from_config(&config.recovery)?);
    let engine = CommandEngine::new(config.engine.clone(), executor.clone(), policy, hardware);

    for request in requests {
        engine.add_command(request)?;
    }
    engine.play()?;

    let timeout = config.engine.wait_timeout_secs.map(Duration::from_secs);
    let outcome = run_to_completion(&engine, timeout).await;
    if let Err(error) = &outcome {
        tracing::error!("Run did not complete: {}", error);
        if matches!(error, EngineError::WaitTimeout(_)) {
            engine.cancel();
        }
    }
    engine.finish().await;

    let summary = RunSummary {
        status: engine.status(),
        commands: engine.get_all(),
        errors: engine.get_all_errors(),
        run_error: engine.get_run_error(),
        stats: executor.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    outcome.map_err(Into::into)
}
