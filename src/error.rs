use std::time::Duration;

use pipette_shared::{CacheInconsistencyError, CommandId, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("The run has already stopped")]
    RunStopped,
    #[error("Pause not allowed: {0}")]
    PauseNotAllowed(String),
    #[error("Setup commands are not allowed after the run has started")]
    SetupCommandNotAllowed,
    #[error("Fixit commands are only allowed while the run is awaiting recovery")]
    FixitCommandNotAllowed,
    #[error("Resume from recovery not allowed: {0}")]
    ResumeFromRecoveryNotAllowed(String),
    #[error("The robot door is open")]
    DoorOpen,
    #[error("Command '{0}' not found")]
    CommandNotFound(CommandId),
    #[error("Hardware state cache inconsistency: {0}")]
    CacheInconsistency(#[from] CacheInconsistencyError),
    #[error("Timed out after {0:?} waiting for engine state")]
    WaitTimeout(Duration),
    #[error("State store closed")]
    StoreClosed,
}
