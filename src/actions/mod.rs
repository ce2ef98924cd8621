//! Actions: immutable events describing something that happened.
//!
//! Engine state only ever changes by applying an action. Actions are fanned
//! out to every registered handler by the [`ActionDispatcher`].

mod dispatcher;

pub use dispatcher::{ActionDispatcher, ActionHandler};

use chrono::{DateTime, Utc};
use pipette_shared::{
    CacheInconsistencyError, Command, CommandId, CommandResult, ErrorRecoveryType, ExecutionError,
    StateUpdate,
};

#[derive(Debug, Clone)]
pub enum Action {
    Play(PlayAction),
    Pause(PauseAction),
    QueueCommand(QueueCommandAction),
    RunCommand(RunCommandAction),
    SucceedCommand(SucceedCommandAction),
    FailCommand(FailCommandAction),
    ResumeFromRecovery(ResumeFromRecoveryAction),
    Stop(StopAction),
    Finish(FinishAction),
    DoorChange(DoorChangeAction),
    RunFailed(RunFailedAction),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Play(_) => "play",
            Action::Pause(_) => "pause",
            Action::QueueCommand(_) => "queue-command",
            Action::RunCommand(_) => "run-command",
            Action::SucceedCommand(_) => "succeed-command",
            Action::FailCommand(_) => "fail-command",
            Action::ResumeFromRecovery(_) => "resume-from-recovery",
            Action::Stop(_) => "stop",
            Action::Finish(_) => "finish",
            Action::DoorChange(_) => "door-change",
            Action::RunFailed(_) => "run-failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayAction {
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PauseAction;

#[derive(Debug, Clone)]
pub struct QueueCommandAction {
    /// The new command, already in `queued` status.
    pub command: Command,
}

#[derive(Debug, Clone)]
pub struct RunCommandAction {
    pub command_id: CommandId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SucceedCommandAction {
    pub command_id: CommandId,
    pub result: CommandResult,
    pub state_update: StateUpdate,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailCommandAction {
    pub command_id: CommandId,
    pub error_id: String,
    pub failed_at: DateTime<Utc>,
    /// Carries both the known state update and the false-positive correction.
    pub error: ExecutionError,
    pub recovery_type: ErrorRecoveryType,
}

/// An operator resolved a `wait-for-recovery` pause.
#[derive(Debug, Clone)]
pub struct ResumeFromRecoveryAction {
    pub state_update: StateUpdate,
}

#[derive(Debug, Clone)]
pub struct StopAction;

#[derive(Debug, Clone)]
pub struct FinishAction {
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DoorChangeAction {
    pub open: bool,
}

/// A fatal engine-level error, reported by a handler as a follow-up action.
#[derive(Debug, Clone)]
pub struct RunFailedAction {
    pub error_id: String,
    pub failed_at: DateTime<Utc>,
    pub error: CacheInconsistencyError,
}
