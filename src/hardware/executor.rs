// src/hardware/executor.rs - Command executor for the simulated robot
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::{sleep, Duration};

use pipette_shared::command::{
    LiquidHandlingParams, LoadPipetteParams, LoadPipetteResult, MoveToWellResult, PickUpTipResult,
    PipetteWellParams, Position, VolumeResult,
};
use pipette_shared::config::{FaultConfig, SimulationConfig};
use pipette_shared::state_update::AspiratedFluid;
use pipette_shared::{
    Command, CommandExecutor, CommandOutcome, CommandParams, CommandResult, ExecutionError,
    ExecutionErrorKind, HardwareStateCache, StateUpdate, TipGeometry,
};

use super::{HardwarePipette, SimulatedHardware};

/// Counters for executed commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
}

/// Decides which executions fail, from configured faults and a fault rate.
struct FaultInjector {
    scripted: Vec<FaultConfig>,
    executions: HashMap<String, u32>,
    fault_rate: f64,
    rng: StdRng,
}

impl FaultInjector {
    fn new(config: &SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            scripted: config.faults.clone(),
            executions: HashMap::new(),
            fault_rate: config.fault_rate,
            rng,
        }
    }

    fn next_fault(&mut self, command_type: &str) -> Option<ExecutionErrorKind> {
        let count = self.executions.entry(command_type.to_string()).or_insert(0);
        *count += 1;
        let occurrence = *count;
        if let Some(fault) = self
            .scripted
            .iter()
            .find(|f| f.command_type == command_type && f.occurrence == occurrence)
        {
            return Some(fault.kind);
        }
        let kind = natural_fault(command_type)?;
        (self.fault_rate > 0.0 && self.rng.random::<f64>() < self.fault_rate).then_some(kind)
    }
}

/// The physical failure each command type is prone to.
fn natural_fault(command_type: &str) -> Option<ExecutionErrorKind> {
    match command_type {
        "pickUpTip" => Some(ExecutionErrorKind::TipPhysicallyMissing),
        "dropTip" => Some(ExecutionErrorKind::TipPhysicallyAttached),
        "aspirate" => Some(ExecutionErrorKind::LiquidNotFound),
        "dispense" => Some(ExecutionErrorKind::Overpressure),
        "moveToWell" | "home" => Some(ExecutionErrorKind::StallOrCollision),
        _ => None,
    }
}

fn fault_message(kind: ExecutionErrorKind, command_type: &str) -> String {
    match kind {
        ExecutionErrorKind::TipPhysicallyMissing => "tip presence sensor reports no tip after pickup".to_string(),
        ExecutionErrorKind::TipPhysicallyAttached => "tip presence sensor still reports a tip after drop".to_string(),
        ExecutionErrorKind::LiquidNotFound => "liquid level detection found no liquid in the well".to_string(),
        ExecutionErrorKind::Overpressure => "pressure sensor exceeded its limit while dispensing".to_string(),
        ExecutionErrorKind::StallOrCollision => "motor stall detected; position is no longer known".to_string(),
        other => format!("simulated {} fault during {}", other, command_type),
    }
}

/// Runs commands against [`SimulatedHardware`], keeping its cache current
/// the way a real hardware layer does.
pub struct SimulatedExecutor {
    hardware: Arc<SimulatedHardware>,
    config: SimulationConfig,
    faults: Mutex<FaultInjector>,
    stats: Mutex<ExecutionStats>,
}

impl SimulatedExecutor {
    pub fn new(hardware: Arc<SimulatedHardware>, config: SimulationConfig) -> Self {
        let faults = Mutex::new(FaultInjector::new(&config));
        Self {
            hardware,
            config,
            faults,
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        lock(&self.stats).clone()
    }

    async fn home(&self, fault: Option<ExecutionErrorKind>) -> Result<CommandOutcome, ExecutionError> {
        self.motion_delay().await;
        let outcome = self.finish(fault, None, StateUpdate::new(), CommandResult::Home)?;
        self.hardware.set_homed(true);
        Ok(outcome)
    }

    async fn load_pipette(
        &self,
        params: &LoadPipetteParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        let pipette_id = params
            .pipette_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let update = StateUpdate::new().load_pipette(&pipette_id, &params.pipette_name, params.mount);
        let result = CommandResult::LoadPipette(LoadPipetteResult { pipette_id });
        self.finish(fault, None, update, result)
    }

    async fn pick_up_tip(
        &self,
        params: &PipetteWellParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        let pipette = self.require_pipette(&params.pipette_id)?;
        if pipette.tip.is_some() {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Hardware,
                format!("pipette '{}' already has a tip attached", params.pipette_id),
            ));
        }
        self.motion_delay().await;
        let tip = TipGeometry {
            volume: self.config.tip_volume,
            length: self.config.tip_length,
        };
        let update = StateUpdate::new()
            .set_pipette_location(&params.pipette_id, params.location())
            .update_tip(&params.pipette_id, tip);
        let result = CommandResult::PickUpTip(PickUpTipResult {
            tip_volume: tip.volume,
            tip_length: tip.length,
        });
        self.finish(fault, Some(params), update, result)
    }

    async fn drop_tip(
        &self,
        params: &PipetteWellParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        self.require_pipette(&params.pipette_id)?;
        self.motion_delay().await;
        let update = StateUpdate::new()
            .set_pipette_location(&params.pipette_id, params.location())
            .clear_tip(&params.pipette_id)
            .set_fluid(&params.pipette_id, AspiratedFluid::Empty);
        self.finish(fault, Some(params), update, CommandResult::DropTip)
    }

    async fn aspirate(
        &self,
        params: &LiquidHandlingParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        let pipette = self.require_pipette(&params.pipette_id)?;
        let tip = require_tip(&pipette)?;
        if pipette.volume + params.volume > tip.volume {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Hardware,
                format!(
                    "cannot aspirate {} uL into a {} uL tip already holding {} uL",
                    params.volume, tip.volume, pipette.volume
                ),
            ));
        }
        self.pipetting_delay().await;
        let update = StateUpdate::new()
            .set_pipette_location(&params.pipette_id, params.location())
            .set_fluid(&params.pipette_id, AspiratedFluid::Aspirated(params.volume));
        let result = CommandResult::Aspirate(VolumeResult { volume: params.volume });
        self.finish(fault, Some(&well_params(params)), update, result)
    }

    async fn dispense(
        &self,
        params: &LiquidHandlingParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        let pipette = self.require_pipette(&params.pipette_id)?;
        require_tip(&pipette)?;
        self.pipetting_delay().await;
        let volume = params.volume.min(pipette.volume);
        let update = StateUpdate::new()
            .set_pipette_location(&params.pipette_id, params.location())
            .set_fluid(&params.pipette_id, AspiratedFluid::Dispensed(volume));
        let result = CommandResult::Dispense(VolumeResult { volume });
        self.finish(fault, Some(&well_params(params)), update, result)
    }

    async fn move_to_well(
        &self,
        params: &PipetteWellParams,
        fault: Option<ExecutionErrorKind>,
    ) -> Result<CommandOutcome, ExecutionError> {
        self.require_pipette(&params.pipette_id)?;
        self.motion_delay().await;
        let update = StateUpdate::new().set_pipette_location(&params.pipette_id, params.location());
        let result = CommandResult::MoveToWell(MoveToWellResult {
            position: well_position(&params.well_name),
        });
        self.finish(fault, Some(params), update, result)
    }

    async fn wait_for_duration(&self, seconds: f64) -> Result<CommandOutcome, ExecutionError> {
        let duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
            ExecutionError::new(
                ExecutionErrorKind::Hardware,
                format!("cannot wait for {} seconds: {}", seconds, e),
            )
        })?;
        sleep(duration).await;
        Ok(CommandOutcome::new(CommandResult::WaitForDuration))
    }

    /// Commit the update on success. On a fault, commit only what is known to
    /// have happened and report the full update as the false-positive
    /// correction for recoverable faults.
    fn finish(
        &self,
        fault: Option<ExecutionErrorKind>,
        target: Option<&PipetteWellParams>,
        update: StateUpdate,
        result: CommandResult,
    ) -> Result<CommandOutcome, ExecutionError> {
        let Some(kind) = fault else {
            self.commit(&update)?;
            return Ok(CommandOutcome::new(result).with_state_update(update));
        };
        let known = match target {
            Some(params) if kind == ExecutionErrorKind::StallOrCollision => {
                StateUpdate::new().clear_pipette_location(&params.pipette_id)
            }
            Some(params) => StateUpdate::new().set_pipette_location(&params.pipette_id, params.location()),
            None => StateUpdate::new(),
        };
        if let Err(error) = self.hardware.apply_state_update(&known) {
            tracing::warn!(%error, "could not record partial progress of a failed command");
        }
        let correction = if kind.is_defined() { update } else { StateUpdate::new() };
        let command_type = result_command_type(&result);
        Err(ExecutionError::new(kind, fault_message(kind, command_type))
            .with_state_update(known)
            .with_false_positive_update(correction))
    }

    fn commit(&self, update: &StateUpdate) -> Result<(), ExecutionError> {
        self.hardware
            .apply_state_update(update)
            .map_err(|e| ExecutionError::new(ExecutionErrorKind::Hardware, e.to_string()))
    }

    fn require_pipette(&self, pipette_id: &str) -> Result<HardwarePipette, ExecutionError> {
        self.hardware.pipette(pipette_id).ok_or_else(|| {
            ExecutionError::new(
                ExecutionErrorKind::PipetteNotLoaded,
                format!("pipette '{}' is not loaded", pipette_id),
            )
        })
    }

    async fn motion_delay(&self) {
        sleep(Duration::from_millis(self.config.motion_ms)).await;
    }

    async fn pipetting_delay(&self) {
        sleep(Duration::from_millis(self.config.pipetting_ms)).await;
    }

    fn record(&self, outcome: &Result<CommandOutcome, ExecutionError>) {
        let mut stats = lock(&self.stats);
        stats.total_commands += 1;
        match outcome {
            Ok(_) => stats.successful_commands += 1,
            Err(_) => stats.failed_commands += 1,
        }
    }
}

#[async_trait]
impl CommandExecutor for SimulatedExecutor {
    async fn execute(&self, command: &Command) -> Result<CommandOutcome, ExecutionError> {
        let fault = lock(&self.faults).next_fault(command.command_type());
        let outcome = match &command.params {
            CommandParams::Home(_) => self.home(fault).await,
            CommandParams::LoadPipette(params) => self.load_pipette(params, fault).await,
            CommandParams::PickUpTip(params) => self.pick_up_tip(params, fault).await,
            CommandParams::DropTip(params) => self.drop_tip(params, fault).await,
            CommandParams::Aspirate(params) => self.aspirate(params, fault).await,
            CommandParams::Dispense(params) => self.dispense(params, fault).await,
            CommandParams::MoveToWell(params) => self.move_to_well(params, fault).await,
            CommandParams::WaitForDuration(params) => self.wait_for_duration(params.seconds).await,
            CommandParams::Comment(params) => {
                tracing::info!("Protocol comment: {}", params.message);
                Ok(CommandOutcome::new(CommandResult::Comment))
            }
        };
        self.record(&outcome);
        outcome
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn require_tip(pipette: &HardwarePipette) -> Result<TipGeometry, ExecutionError> {
    pipette.tip.ok_or_else(|| {
        ExecutionError::new(
            ExecutionErrorKind::TipNotAttached,
            format!("pipette '{}' has no tip attached", pipette.pipette_id),
        )
    })
}

fn well_params(params: &LiquidHandlingParams) -> PipetteWellParams {
    PipetteWellParams {
        pipette_id: params.pipette_id.clone(),
        labware_id: params.labware_id.clone(),
        well_name: params.well_name.clone(),
    }
}

fn result_command_type(result: &CommandResult) -> &'static str {
    match result {
        CommandResult::Home => "home",
        CommandResult::LoadPipette(_) => "loadPipette",
        CommandResult::PickUpTip(_) => "pickUpTip",
        CommandResult::DropTip => "dropTip",
        CommandResult::Aspirate(_) => "aspirate",
        CommandResult::Dispense(_) => "dispense",
        CommandResult::MoveToWell(_) => "moveToWell",
        CommandResult::WaitForDuration => "waitForDuration",
        CommandResult::Comment => "comment",
    }
}

/// Deck position of a well on a 96-well grid: rows `A`..`H`, columns `1`..`12`
/// at 9 mm pitch.
fn well_position(well_name: &str) -> Position {
    let mut chars = well_name.chars();
    let row = chars
        .next()
        .map(|c| (c.to_ascii_uppercase() as u32).saturating_sub('A' as u32))
        .unwrap_or(0);
    let column = chars.as_str().parse::<u32>().unwrap_or(1).max(1) - 1;
    Position {
        x: 14.38 + 9.0 * column as f64,
        y: 74.24 - 9.0 * row as f64,
        z: 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipette_shared::command::WaitForDurationParams;
    use pipette_shared::{CommandRequest, Mount};
    use chrono::Utc;

    fn fast_config() -> SimulationConfig {
        SimulationConfig {
            motion_ms: 0,
            pipetting_ms: 0,
            ..SimulationConfig::default()
        }
    }

    fn command(params: CommandParams) -> Command {
        Command::create(CommandRequest::new(params), Utc::now()).unwrap()
    }

    fn load(pipette_id: &str) -> Command {
        command(CommandParams::LoadPipette(LoadPipetteParams {
            pipette_name: "p300_single".to_string(),
            mount: Mount::Left,
            pipette_id: Some(pipette_id.to_string()),
        }))
    }

    fn well(pipette_id: &str, well_name: &str) -> PipetteWellParams {
        PipetteWellParams {
            pipette_id: pipette_id.to_string(),
            labware_id: "tiprack-1".to_string(),
            well_name: well_name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_pick_up_tip_updates_hardware() {
        let hardware = Arc::new(SimulatedHardware::new());
        let executor = SimulatedExecutor::new(hardware.clone(), fast_config());
        executor.execute(&load("p1")).await.unwrap();
        let outcome = executor
            .execute(&command(CommandParams::PickUpTip(well("p1", "A1"))))
            .await
            .unwrap();
        assert!(hardware.has_tip("p1"));
        assert!(outcome.state_update.pipette_tip_state.is_some());
        assert_eq!(executor.stats().successful_commands, 2);
    }

    #[tokio::test]
    async fn test_scripted_drop_tip_fault_carries_correction() {
        let hardware = Arc::new(SimulatedHardware::new());
        let mut config = fast_config();
        config.faults.push(FaultConfig {
            command_type: "dropTip".to_string(),
            occurrence: 1,
            kind: ExecutionErrorKind::TipPhysicallyAttached,
        });
        let executor = SimulatedExecutor::new(hardware.clone(), config);
        executor.execute(&load("p1")).await.unwrap();
        executor
            .execute(&command(CommandParams::PickUpTip(well("p1", "A1"))))
            .await
            .unwrap();

        let error = executor
            .execute(&command(CommandParams::DropTip(well("p1", "A1"))))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ExecutionErrorKind::TipPhysicallyAttached);
        assert!(hardware.has_tip("p1"));
        let correction = error.state_update_if_false_positive.pipette_tip_state.unwrap();
        assert_eq!(correction.tip, None);

        // Only the first drop is scripted to fail.
        executor
            .execute(&command(CommandParams::DropTip(well("p1", "A1"))))
            .await
            .unwrap();
        assert!(!hardware.has_tip("p1"));
        assert_eq!(executor.stats().failed_commands, 1);
    }

    #[tokio::test]
    async fn test_aspirate_without_tip_fails() {
        let hardware = Arc::new(SimulatedHardware::new());
        let executor = SimulatedExecutor::new(hardware, fast_config());
        executor.execute(&load("p1")).await.unwrap();
        let error = executor
            .execute(&command(CommandParams::Aspirate(LiquidHandlingParams {
                pipette_id: "p1".to_string(),
                labware_id: "plate-1".to_string(),
                well_name: "B2".to_string(),
                volume: 10.0,
                flow_rate: 5.0,
            })))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ExecutionErrorKind::TipNotAttached);
    }

    #[tokio::test]
    async fn test_unrepresentable_wait_fails_instead_of_panicking() {
        let executor = SimulatedExecutor::new(Arc::new(SimulatedHardware::new()), fast_config());
        let mut wait = command(CommandParams::WaitForDuration(WaitForDurationParams { seconds: 0.0 }));
        // Skip creation-time validation to reach the executor with a bad value.
        wait.params = CommandParams::WaitForDuration(WaitForDurationParams { seconds: 1e20 });
        let error = executor.execute(&wait).await.unwrap_err();
        assert_eq!(error.kind, ExecutionErrorKind::Hardware);
        assert_eq!(executor.stats().failed_commands, 1);
    }

    #[test]
    fn test_random_faults_only_hit_fault_prone_commands() {
        let config = SimulationConfig {
            fault_rate: 1.0,
            seed: Some(7),
            ..SimulationConfig::default()
        };
        let mut injector = FaultInjector::new(&config);
        assert_eq!(injector.next_fault("aspirate"), Some(ExecutionErrorKind::LiquidNotFound));
        assert_eq!(injector.next_fault("comment"), None);
        assert_eq!(injector.next_fault("loadPipette"), None);
    }

    #[test]
    fn test_well_position() {
        let a1 = well_position("A1");
        let b3 = well_position("B3");
        assert_eq!(a1.x, 14.38);
        assert!((b3.x - a1.x - 18.0).abs() < 1e-9);
        assert!((a1.y - b3.y - 9.0).abs() < 1e-9);
    }
}
