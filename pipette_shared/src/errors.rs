//! Error taxonomy shared by the engine and its collaborators.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Mount;
use crate::state_update::StateUpdate;

/// Malformed command request. Rejected before it ever becomes a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown command type '{0}'")]
    UnknownCommandType(String),
    #[error("Invalid params for '{command_type}': {reason}")]
    InvalidParams { command_type: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionErrorKind {
    /// Tip pickup finished but the sensor sees no tip.
    TipPhysicallyMissing,
    /// Tip drop finished but the sensor still sees a tip.
    TipPhysicallyAttached,
    LiquidNotFound,
    Overpressure,
    StallOrCollision,
    PipetteNotLoaded,
    TipNotAttached,
    Hardware,
    Cancelled,
}

impl ExecutionErrorKind {
    pub const ALL: [ExecutionErrorKind; 9] = [
        ExecutionErrorKind::TipPhysicallyMissing,
        ExecutionErrorKind::TipPhysicallyAttached,
        ExecutionErrorKind::LiquidNotFound,
        ExecutionErrorKind::Overpressure,
        ExecutionErrorKind::StallOrCollision,
        ExecutionErrorKind::PipetteNotLoaded,
        ExecutionErrorKind::TipNotAttached,
        ExecutionErrorKind::Hardware,
        ExecutionErrorKind::Cancelled,
    ];

    /// Well-known physical failures an operator can recover from.
    pub fn is_defined(self) -> bool {
        matches!(
            self,
            ExecutionErrorKind::TipPhysicallyMissing
                | ExecutionErrorKind::TipPhysicallyAttached
                | ExecutionErrorKind::LiquidNotFound
                | ExecutionErrorKind::Overpressure
                | ExecutionErrorKind::StallOrCollision
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionErrorKind::TipPhysicallyMissing => "tip-physically-missing",
            ExecutionErrorKind::TipPhysicallyAttached => "tip-physically-attached",
            ExecutionErrorKind::LiquidNotFound => "liquid-not-found",
            ExecutionErrorKind::Overpressure => "overpressure",
            ExecutionErrorKind::StallOrCollision => "stall-or-collision",
            ExecutionErrorKind::PipetteNotLoaded => "pipette-not-loaded",
            ExecutionErrorKind::TipNotAttached => "tip-not-attached",
            ExecutionErrorKind::Hardware => "hardware",
            ExecutionErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown execution error kind '{}'", s))
    }
}

/// A command's own domain failure, as reported by the executor.
///
/// `state_update` describes what is known to have happened despite the
/// failure. `state_update_if_false_positive` describes what would be true if
/// the failure turns out to be spurious, and is only applied when the
/// recovery policy decides to assume exactly that.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub state_update: StateUpdate,
    pub state_update_if_false_positive: StateUpdate,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            state_update: StateUpdate::default(),
            state_update_if_false_positive: StateUpdate::default(),
        }
    }

    pub fn with_state_update(mut self, state_update: StateUpdate) -> Self {
        self.state_update = state_update;
        self
    }

    pub fn with_false_positive_update(mut self, state_update: StateUpdate) -> Self {
        self.state_update_if_false_positive = state_update;
        self
    }
}

/// The hardware-side cache refused a state update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheInconsistencyError {
    #[error("Pipette '{0}' is not known to the hardware")]
    UnknownPipette(String),
    #[error("Mount {mount:?} is already occupied by pipette '{pipette_id}'")]
    MountOccupied { mount: Mount, pipette_id: String },
}

/// The error recovery policy could not classify a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Error recovery policy failed: {0}")]
pub struct RecoveryPolicyError(pub String);

/// Serializable record of an error, kept on failed commands and on the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurrence {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub error_type: String,
    pub detail: String,
    pub is_defined: bool,
}

impl ErrorOccurrence {
    pub fn new(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        error_type: impl Into<String>,
        detail: impl Into<String>,
        is_defined: bool,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            error_type: error_type.into(),
            detail: detail.into(),
            is_defined,
        }
    }

    pub fn from_execution_error(id: impl Into<String>, created_at: DateTime<Utc>, error: &ExecutionError) -> Self {
        Self::new(id, created_at, error.kind.as_str(), error.message.clone(), error.kind.is_defined())
    }
}
