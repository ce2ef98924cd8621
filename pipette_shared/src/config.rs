//! Engine configuration, shared by the engine host, the simulated robot and tests.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [engine]
//! block_on_door_open = true
//! wait_timeout_secs = 600
//!
//! [recovery]
//! enabled = true
//! defined_error_default = "wait-for-recovery"
//!
//! [recovery.overrides]
//! tip-physically-attached = "assume-false-positive-and-continue"
//!
//! [simulation]
//! motion_ms = 5
//! pipetting_ms = 5
//!
//! [[simulation.faults]]
//! command_type = "dropTip"
//! occurrence = 1
//! kind = "tip-physically-attached"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::command::CommandParams;
use crate::errors::ExecutionErrorKind;
use crate::recovery::ErrorRecoveryType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Pause the queue while the robot door is open.
    #[serde(default)]
    pub block_on_door_open: bool,
    /// Upper bound the engine host puts on waiting for a run to finish.
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_enabled")]
    pub enabled: bool,
    /// Recovery type for defined errors that have no override.
    #[serde(default = "default_defined_error_recovery")]
    pub defined_error_default: ErrorRecoveryType,
    /// Per error kind (e.g. `tip-physically-attached`) recovery type.
    #[serde(default)]
    pub overrides: HashMap<String, ErrorRecoveryType>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_recovery_enabled(),
            defined_error_default: default_defined_error_recovery(),
            overrides: HashMap::new(),
        }
    }
}

impl RecoveryConfig {
    /// Overrides keyed by parsed error kind.
    pub fn parsed_overrides(&self) -> Result<HashMap<ExecutionErrorKind, ErrorRecoveryType>, String> {
        self.overrides
            .iter()
            .map(|(kind, recovery)| Ok((kind.parse::<ExecutionErrorKind>()?, *recovery)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_motion_ms")]
    pub motion_ms: u64,
    #[serde(default = "default_pipetting_ms")]
    pub pipetting_ms: u64,
    #[serde(default = "default_tip_volume")]
    pub tip_volume: f64,
    #[serde(default = "default_tip_length")]
    pub tip_length: f64,
    /// Probability in `[0, 1]` that any physical command fails at random.
    #[serde(default)]
    pub fault_rate: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub faults: Vec<FaultConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            motion_ms: default_motion_ms(),
            pipetting_ms: default_pipetting_ms(),
            tip_volume: default_tip_volume(),
            tip_length: default_tip_length(),
            fault_rate: 0.0,
            seed: None,
            faults: Vec::new(),
        }
    }
}

/// Fail the n-th execution of a command type with the given error kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FaultConfig {
    pub command_type: String,
    #[serde(default = "default_occurrence")]
    pub occurrence: u32,
    pub kind: ExecutionErrorKind,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.recovery.parsed_overrides()?;
        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.fault_rate) {
            return Err(format!("Simulation fault_rate must be between 0 and 1, got {}", sim.fault_rate));
        }
        if sim.tip_volume <= 0.0 || sim.tip_length <= 0.0 {
            return Err("Simulation tip_volume and tip_length must be > 0".to_string());
        }
        for fault in &sim.faults {
            if !CommandParams::KNOWN_TYPES.contains(&fault.command_type.as_str()) {
                return Err(format!("Fault refers to unknown command type '{}'", fault.command_type));
            }
            if fault.occurrence == 0 {
                return Err(format!("Fault occurrence for '{}' must be >= 1", fault.command_type));
            }
        }
        Ok(())
    }
}

fn default_recovery_enabled() -> bool { true }
fn default_defined_error_recovery() -> ErrorRecoveryType { ErrorRecoveryType::WaitForRecovery }
fn default_motion_ms() -> u64 { 20 }
fn default_pipetting_ms() -> u64 { 20 }
fn default_tip_volume() -> f64 { 300.0 }
fn default_tip_length() -> f64 { 59.5 }
fn default_occurrence() -> u32 { 1 }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}
