#![allow(dead_code)]
// Test doubles shared by the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use pipette_rs::{CommandEngine, EngineState, ErrorRecoveryPolicy};
use pipette_shared::command::{
    HomeParams, LiquidHandlingParams, MoveToWellResult, PickUpTipResult, PipetteWellParams, Position,
    VolumeResult,
};
use pipette_shared::config::EngineConfig;
use pipette_shared::{
    CacheInconsistencyError, Command, CommandExecutor, CommandOutcome, CommandParams, CommandRequest,
    CommandResult, ErrorRecoveryType, ExecutionError, HardwareStateCache, RecoveryPolicyError,
    StateUpdate,
};

/// Executor that records dispatch order by command key, fails the commands
/// it was told to fail and holds gated commands until released.
#[derive(Default)]
pub struct ScriptedExecutor {
    dispatched: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, ExecutionError>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cache: Option<Arc<RecordingCache>>,
    cache_updates_seen: Mutex<Vec<(String, usize)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Also record how many updates `cache` had received at each dispatch.
    pub fn observing(cache: Arc<RecordingCache>) -> Arc<Self> {
        Arc::new(Self {
            cache: Some(cache),
            ..Self::default()
        })
    }

    pub fn fail(&self, key: &str, error: ExecutionError) {
        self.failures.lock().unwrap().insert(key.to_string(), error);
    }

    /// Hold the command with this key in flight until the returned gate is
    /// notified.
    pub fn gate(&self, key: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(key.to_string(), gate.clone());
        gate
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cache_updates_seen(&self) -> Vec<(String, usize)> {
        self.cache_updates_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: &Command) -> Result<CommandOutcome, ExecutionError> {
        self.dispatched.lock().unwrap().push(command.key.clone());
        if let Some(cache) = &self.cache {
            let seen = cache.applied().len();
            self.cache_updates_seen.lock().unwrap().push((command.key.clone(), seen));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(&command.key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        tokio::task::yield_now().await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let failure = self.failures.lock().unwrap().get(&command.key).cloned();
        match failure {
            Some(error) => Err(error),
            None => Ok(CommandOutcome::new(result_for(&command.params))),
        }
    }
}

fn result_for(params: &CommandParams) -> CommandResult {
    match params {
        CommandParams::Home(_) => CommandResult::Home,
        CommandParams::LoadPipette(p) => CommandResult::LoadPipette(pipette_shared::command::LoadPipetteResult {
            pipette_id: p.pipette_id.clone().unwrap_or_else(|| "pipette-1".to_string()),
        }),
        CommandParams::PickUpTip(_) => CommandResult::PickUpTip(PickUpTipResult {
            tip_volume: 300.0,
            tip_length: 59.5,
        }),
        CommandParams::DropTip(_) => CommandResult::DropTip,
        CommandParams::Aspirate(p) => CommandResult::Aspirate(VolumeResult { volume: p.volume }),
        CommandParams::Dispense(p) => CommandResult::Dispense(VolumeResult { volume: p.volume }),
        CommandParams::MoveToWell(_) => CommandResult::MoveToWell(MoveToWellResult {
            position: Position { x: 0.0, y: 0.0, z: 0.0 },
        }),
        CommandParams::WaitForDuration(_) => CommandResult::WaitForDuration,
        CommandParams::Comment(_) => CommandResult::Comment,
    }
}

/// Hardware cache that records every update it is given.
#[derive(Default)]
pub struct RecordingCache {
    applied: Mutex<Vec<StateUpdate>>,
    fail_with: Mutex<Option<CacheInconsistencyError>>,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: CacheInconsistencyError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Mutex::new(Some(error)),
            ..Self::default()
        })
    }

    pub fn applied(&self) -> Vec<StateUpdate> {
        self.applied.lock().unwrap().clone()
    }
}

impl HardwareStateCache for RecordingCache {
    fn apply_state_update(&self, update: &StateUpdate) -> Result<(), CacheInconsistencyError> {
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        self.applied.lock().unwrap().push(update.clone());
        Ok(())
    }
}

pub fn always(recovery: ErrorRecoveryType) -> Arc<dyn ErrorRecoveryPolicy> {
    Arc::new(
        move |_: &ExecutionError, _: &Command, _: &EngineState| -> Result<ErrorRecoveryType, RecoveryPolicyError> {
            Ok(recovery)
        },
    )
}

pub fn engine(
    executor: Arc<ScriptedExecutor>,
    policy: Arc<dyn ErrorRecoveryPolicy>,
    cache: Arc<RecordingCache>,
) -> CommandEngine {
    CommandEngine::new(EngineConfig::default(), executor, policy, cache)
}

pub fn engine_with_config(
    config: EngineConfig,
    executor: Arc<ScriptedExecutor>,
    policy: Arc<dyn ErrorRecoveryPolicy>,
    cache: Arc<RecordingCache>,
) -> CommandEngine {
    CommandEngine::new(config, executor, policy, cache)
}

pub fn home(key: &str) -> CommandRequest {
    CommandRequest::new(CommandParams::Home(HomeParams {})).with_key(key)
}

pub fn pick_up_tip(key: &str) -> CommandRequest {
    CommandRequest::new(CommandParams::PickUpTip(well("tiprack-1", "A1"))).with_key(key)
}

pub fn drop_tip(key: &str) -> CommandRequest {
    CommandRequest::new(CommandParams::DropTip(well("trash", "A1"))).with_key(key)
}

pub fn aspirate(key: &str) -> CommandRequest {
    CommandRequest::new(CommandParams::Aspirate(LiquidHandlingParams {
        pipette_id: "pipette-1".to_string(),
        labware_id: "plate-1".to_string(),
        well_name: "A1".to_string(),
        volume: 50.0,
        flow_rate: 10.0,
    }))
    .with_key(key)
}

fn well(labware_id: &str, well_name: &str) -> PipetteWellParams {
    PipetteWellParams {
        pipette_id: "pipette-1".to_string(),
        labware_id: labware_id.to_string(),
        well_name: well_name.to_string(),
    }
}

/// Wait until the command with this id is running.
pub async fn wait_until_running(engine: &CommandEngine, command_id: &str) {
    engine
        .wait_for(|state| {
            Ok(state
                .commands()
                .get_running_command_id()
                .filter(|id| id.as_str() == command_id)
                .map(|_| ()))
        })
        .await
        .unwrap();
}
