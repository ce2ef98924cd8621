//! Command model: one schedulable unit of robot work and its lifecycle.
//!
//! A command is created `queued`, moved to `running` by the queue worker and
//! finished as `succeeded` or `failed` from the executor's outcome:
//!
//! ```text
//! queued ──▶ running ──▶ succeeded
//!                  └───▶ failed
//! ```
//!
//! Transitions consume the command and return the updated copy. Calling one
//! from the wrong source status is an internal consistency breach and panics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorOccurrence, ValidationError};
use crate::state_update::StateUpdate;

pub type CommandId = String;

/// Which queue a command goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandIntent {
    /// Part of the protocol proper. Runs while the run is playing.
    #[default]
    Protocol,
    /// Preparation before the run starts (homing, calibration moves).
    Setup,
    /// Operator-issued correction while the run awaits recovery.
    Fixit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Succeeded | CommandStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mount {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellLocation {
    pub labware_id: String,
    pub well_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HomeParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadPipetteParams {
    pub pipette_name: String,
    pub mount: Mount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipette_id: Option<String>,
}

/// Params shared by commands that target a single well with one pipette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipetteWellParams {
    pub pipette_id: String,
    pub labware_id: String,
    pub well_name: String,
}

impl PipetteWellParams {
    pub fn location(&self) -> WellLocation {
        WellLocation {
            labware_id: self.labware_id.clone(),
            well_name: self.well_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LiquidHandlingParams {
    pub pipette_id: String,
    pub labware_id: String,
    pub well_name: String,
    /// Microliters.
    pub volume: f64,
    /// Microliters per second.
    pub flow_rate: f64,
}

impl LiquidHandlingParams {
    pub fn location(&self) -> WellLocation {
        WellLocation {
            labware_id: self.labware_id.clone(),
            well_name: self.well_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForDurationParams {
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentParams {
    pub message: String,
}

/// Command-type specific payload. The engine never branches on the variant;
/// only the executor does, to route to the right implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", content = "params", rename_all = "camelCase")]
pub enum CommandParams {
    Home(HomeParams),
    LoadPipette(LoadPipetteParams),
    PickUpTip(PipetteWellParams),
    DropTip(PipetteWellParams),
    Aspirate(LiquidHandlingParams),
    Dispense(LiquidHandlingParams),
    MoveToWell(PipetteWellParams),
    WaitForDuration(WaitForDurationParams),
    Comment(CommentParams),
}

impl CommandParams {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "home",
        "loadPipette",
        "pickUpTip",
        "dropTip",
        "aspirate",
        "dispense",
        "moveToWell",
        "waitForDuration",
        "comment",
    ];

    pub fn command_type(&self) -> &'static str {
        match self {
            CommandParams::Home(_) => "home",
            CommandParams::LoadPipette(_) => "loadPipette",
            CommandParams::PickUpTip(_) => "pickUpTip",
            CommandParams::DropTip(_) => "dropTip",
            CommandParams::Aspirate(_) => "aspirate",
            CommandParams::Dispense(_) => "dispense",
            CommandParams::MoveToWell(_) => "moveToWell",
            CommandParams::WaitForDuration(_) => "waitForDuration",
            CommandParams::Comment(_) => "comment",
        }
    }

    /// Build params from a command type name and a raw JSON payload.
    pub fn parse(command_type: &str, params: serde_json::Value) -> Result<Self, ValidationError> {
        if !Self::KNOWN_TYPES.contains(&command_type) {
            return Err(ValidationError::UnknownCommandType(command_type.to_string()));
        }
        let tagged = serde_json::json!({ "commandType": command_type, "params": params });
        let parsed: CommandParams =
            serde_json::from_value(tagged).map_err(|e| ValidationError::InvalidParams {
                command_type: command_type.to_string(),
                reason: e.to_string(),
            })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidParams {
            command_type: self.command_type().to_string(),
            reason: reason.to_string(),
        };
        match self {
            CommandParams::Home(_) | CommandParams::Comment(_) => Ok(()),
            CommandParams::LoadPipette(p) => {
                if p.pipette_name.trim().is_empty() {
                    return Err(invalid("pipetteName must not be empty"));
                }
                if p.pipette_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                    return Err(invalid("pipetteId must not be empty"));
                }
                Ok(())
            }
            CommandParams::PickUpTip(p) | CommandParams::DropTip(p) | CommandParams::MoveToWell(p) => {
                require_identifiers(&p.pipette_id, &p.labware_id, &p.well_name).map_err(|r| invalid(r))
            }
            CommandParams::Aspirate(p) | CommandParams::Dispense(p) => {
                require_identifiers(&p.pipette_id, &p.labware_id, &p.well_name).map_err(|r| invalid(r))?;
                if !p.volume.is_finite() || p.volume <= 0.0 {
                    return Err(invalid("volume must be a positive number"));
                }
                if !p.flow_rate.is_finite() || p.flow_rate <= 0.0 {
                    return Err(invalid("flowRate must be a positive number"));
                }
                Ok(())
            }
            CommandParams::WaitForDuration(p) => {
                if !p.seconds.is_finite() || p.seconds < 0.0 {
                    return Err(invalid("seconds must be zero or positive"));
                }
                if std::time::Duration::try_from_secs_f64(p.seconds).is_err() {
                    return Err(invalid("seconds is too large"));
                }
                Ok(())
            }
        }
    }

    /// The pipette this command acts on, if any.
    pub fn pipette_id(&self) -> Option<&str> {
        match self {
            CommandParams::LoadPipette(p) => p.pipette_id.as_deref(),
            CommandParams::PickUpTip(p) | CommandParams::DropTip(p) | CommandParams::MoveToWell(p) => {
                Some(&p.pipette_id)
            }
            CommandParams::Aspirate(p) | CommandParams::Dispense(p) => Some(&p.pipette_id),
            CommandParams::Home(_) | CommandParams::WaitForDuration(_) | CommandParams::Comment(_) => None,
        }
    }
}

fn require_identifiers(pipette_id: &str, labware_id: &str, well_name: &str) -> Result<(), &'static str> {
    if pipette_id.trim().is_empty() {
        Err("pipetteId must not be empty")
    } else if labware_id.trim().is_empty() {
        Err("labwareId must not be empty")
    } else if well_name.trim().is_empty() {
        Err("wellName must not be empty")
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPipetteResult {
    pub pipette_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickUpTipResult {
    pub tip_volume: f64,
    pub tip_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeResult {
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveToWellResult {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", content = "result", rename_all = "camelCase")]
pub enum CommandResult {
    Home,
    LoadPipette(LoadPipetteResult),
    PickUpTip(PickUpTipResult),
    DropTip,
    Aspirate(VolumeResult),
    Dispense(VolumeResult),
    MoveToWell(MoveToWellResult),
    WaitForDuration,
    Comment,
}

/// What an executor hands back for a command that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub result: CommandResult,
    pub state_update: StateUpdate,
}

impl CommandOutcome {
    pub fn new(result: CommandResult) -> Self {
        Self {
            result,
            state_update: StateUpdate::default(),
        }
    }

    pub fn with_state_update(mut self, state_update: StateUpdate) -> Self {
        self.state_update = state_update;
        self
    }
}

/// Raw wire shape of a command request, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommandRequest {
    pub command_type: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    #[serde(default)]
    pub intent: CommandIntent,
    #[serde(default)]
    pub key: Option<String>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A validated request to add a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub params: CommandParams,
    pub intent: CommandIntent,
    pub key: Option<String>,
}

impl CommandRequest {
    pub fn new(params: CommandParams) -> Self {
        Self {
            params,
            intent: CommandIntent::Protocol,
            key: None,
        }
    }

    pub fn with_intent(mut self, intent: CommandIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl TryFrom<RawCommandRequest> for CommandRequest {
    type Error = ValidationError;

    fn try_from(raw: RawCommandRequest) -> Result<Self, Self::Error> {
        let params = CommandParams::parse(&raw.command_type, raw.params)?;
        Ok(Self {
            params,
            intent: raw.intent,
            key: raw.key,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub key: String,
    pub intent: CommandIntent,
    #[serde(flatten)]
    pub params: CommandParams,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOccurrence>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// For fixit commands, the failed command they were queued to fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_command_id: Option<CommandId>,
}

impl Command {
    /// Create a `queued` command with a fresh id.
    ///
    /// Params are re-validated here so that hand-built `CommandParams` get the
    /// same checks as parsed ones.
    pub fn create(request: CommandRequest, created_at: DateTime<Utc>) -> Result<Self, ValidationError> {
        request.params.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let key = request.key.unwrap_or_else(|| id.clone());
        Ok(Self {
            id,
            key,
            intent: request.intent,
            params: request.params,
            status: CommandStatus::Queued,
            result: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
            failed_command_id: None,
        })
    }

    pub fn command_type(&self) -> &'static str {
        self.params.command_type()
    }

    pub fn to_running(self, started_at: DateTime<Utc>) -> Self {
        assert_eq!(
            self.status,
            CommandStatus::Queued,
            "command {} cannot start running from {:?}",
            self.id,
            self.status
        );
        let started_at = started_at.max(self.created_at);
        Self {
            status: CommandStatus::Running,
            started_at: Some(started_at),
            ..self
        }
    }

    pub fn to_succeeded(self, result: CommandResult, completed_at: DateTime<Utc>) -> Self {
        self.assert_running("succeed");
        let completed_at = self.clamp_completion(completed_at);
        Self {
            status: CommandStatus::Succeeded,
            result: Some(result),
            completed_at: Some(completed_at),
            ..self
        }
    }

    pub fn to_failed(self, error: ErrorOccurrence, completed_at: DateTime<Utc>) -> Self {
        self.assert_running("fail");
        let completed_at = self.clamp_completion(completed_at);
        Self {
            status: CommandStatus::Failed,
            error: Some(error),
            completed_at: Some(completed_at),
            ..self
        }
    }

    /// Fail a command that never ran because an earlier failure ended its
    /// queue. It carries no error of its own.
    pub fn to_failed_unrun(self, completed_at: DateTime<Utc>) -> Self {
        assert_eq!(
            self.status,
            CommandStatus::Queued,
            "command {} cannot be failed unrun from {:?}",
            self.id,
            self.status
        );
        Self {
            status: CommandStatus::Failed,
            completed_at: Some(completed_at.max(self.created_at)),
            ..self
        }
    }

    fn assert_running(&self, transition: &str) {
        assert_eq!(
            self.status,
            CommandStatus::Running,
            "command {} cannot {} from {:?}",
            self.id,
            transition,
            self.status
        );
    }

    fn clamp_completion(&self, completed_at: DateTime<Utc>) -> DateTime<Utc> {
        completed_at.max(self.started_at.unwrap_or(self.created_at))
    }
}
