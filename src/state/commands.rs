//! Run-level command state: the command list, the three intent queues,
//! queue status, run result and error recovery bookkeeping.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use pipette_shared::{
    Command, CommandId, CommandIntent, CommandStatus, ErrorOccurrence, ErrorRecoveryType,
};
use serde::Serialize;

use crate::actions::{
    Action, FailCommandAction, PlayAction, QueueCommandAction, RunCommandAction, RunFailedAction,
    SucceedCommandAction,
};
use crate::error::EngineError;

/// Whether the engine is pulling commands off the queue.
///
/// A command may still be executing, and the robot may still be moving, while
/// the queue is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    /// Not played yet. Setup commands run, protocol commands wait.
    Setup,
    Running,
    Paused,
    /// A protocol command failed recoverably. Fixit commands run.
    AwaitingRecovery,
    /// Awaiting recovery, with fixit commands held as well.
    AwaitingRecoveryPaused,
}

/// Once set, never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunResult {
    Succeeded,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineStatus {
    Idle,
    Running,
    Paused,
    BlockedByOpenDoor,
    AwaitingRecovery,
    AwaitingRecoveryPaused,
    AwaitingRecoveryBlockedByOpenDoor,
    Succeeded,
    Failed,
    Stopped,
}

impl EngineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineStatus::Succeeded | EngineStatus::Failed | EngineStatus::Stopped)
    }
}

#[derive(Debug, Clone)]
struct CommandEntry {
    command: Command,
    index: usize,
}

#[derive(Debug, Clone)]
pub struct CommandState {
    entries: HashMap<CommandId, CommandEntry>,
    order: Vec<CommandId>,
    protocol_queue: VecDeque<CommandId>,
    setup_queue: VecDeque<CommandId>,
    fixit_queue: VecDeque<CommandId>,
    running: Option<CommandId>,
    queue_status: QueueStatus,
    run_result: Option<RunResult>,
    run_error: Option<ErrorOccurrence>,
    fatal_error: Option<pipette_shared::CacheInconsistencyError>,
    run_started_at: Option<DateTime<Utc>>,
    run_completed_at: Option<DateTime<Utc>>,
    failed_command: Option<CommandId>,
    failed_command_errors: Vec<ErrorOccurrence>,
    recovery_types: HashMap<CommandId, ErrorRecoveryType>,
    recovery_target: Option<CommandId>,
    has_entered_error_recovery: bool,
    block_on_door_open: bool,
    door_blocking: bool,
}

impl CommandState {
    pub fn new(block_on_door_open: bool) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            protocol_queue: VecDeque::new(),
            setup_queue: VecDeque::new(),
            fixit_queue: VecDeque::new(),
            running: None,
            queue_status: QueueStatus::Setup,
            run_result: None,
            run_error: None,
            fatal_error: None,
            run_started_at: None,
            run_completed_at: None,
            failed_command: None,
            failed_command_errors: Vec::new(),
            recovery_types: HashMap::new(),
            recovery_target: None,
            has_entered_error_recovery: false,
            block_on_door_open,
            door_blocking: false,
        }
    }

    pub(crate) fn handle_action(&mut self, action: &Action) {
        match action {
            Action::QueueCommand(a) => self.handle_queue_command(a),
            Action::RunCommand(a) => self.handle_run_command(a),
            Action::SucceedCommand(a) => self.handle_succeed_command(a),
            Action::FailCommand(a) => self.handle_fail_command(a),
            Action::Play(a) => self.handle_play(a),
            Action::Pause(_) => {
                if self.run_result.is_none() && self.queue_status == QueueStatus::Running {
                    self.queue_status = QueueStatus::Paused;
                }
            }
            Action::ResumeFromRecovery(_) => {
                if self.queue_status == QueueStatus::AwaitingRecovery {
                    self.queue_status = QueueStatus::Running;
                    self.recovery_target = None;
                }
            }
            Action::Stop(_) => {
                if self.run_result.is_none() {
                    self.run_result = Some(RunResult::Stopped);
                    self.recovery_target = None;
                    self.queue_status = QueueStatus::Paused;
                }
            }
            Action::Finish(a) => {
                if self.run_result.is_none() {
                    self.run_result = Some(RunResult::Succeeded);
                    self.queue_status = QueueStatus::Paused;
                }
                self.run_completed_at.get_or_insert(a.finished_at);
            }
            Action::DoorChange(a) => self.handle_door_change(a.open),
            Action::RunFailed(a) => self.handle_run_failed(a),
        }
    }

    fn handle_queue_command(&mut self, action: &QueueCommandAction) {
        let command = action.command.clone();
        let id = command.id.clone();
        match command.intent {
            CommandIntent::Protocol => self.protocol_queue.push_back(id.clone()),
            CommandIntent::Setup => self.setup_queue.push_back(id.clone()),
            CommandIntent::Fixit => self.fixit_queue.push_back(id.clone()),
        }
        let index = self.order.len();
        self.order.push(id.clone());
        self.entries.insert(id, CommandEntry { command, index });
    }

    fn handle_run_command(&mut self, action: &RunCommandAction) {
        let entry = self.entry_mut(&action.command_id);
        let intent = entry.command.intent;
        entry.command = entry.command.clone().to_running(action.started_at);
        self.queue_mut(intent).retain(|id| id != &action.command_id);
        self.running = Some(action.command_id.clone());
    }

    fn handle_succeed_command(&mut self, action: &SucceedCommandAction) {
        let entry = self.entry_mut(&action.command_id);
        entry.command = entry
            .command
            .clone()
            .to_succeeded(action.result.clone(), action.completed_at);
        self.clear_running(&action.command_id);
    }

    fn handle_fail_command(&mut self, action: &FailCommandAction) {
        let occurrence = ErrorOccurrence::from_execution_error(&action.error_id, action.failed_at, &action.error);
        let entry = self.entry_mut(&action.command_id);
        let intent = entry.command.intent;
        entry.command = entry.command.clone().to_failed(occurrence.clone(), action.failed_at);
        self.clear_running(&action.command_id);

        self.recovery_types.insert(action.command_id.clone(), action.recovery_type);
        self.failed_command = Some(action.command_id.clone());
        self.failed_command_errors.push(occurrence.clone());

        // A failed setup or fixit command takes the rest of its queue with it,
        // as does a protocol command that fails the run.
        let cascade = match intent {
            CommandIntent::Setup | CommandIntent::Fixit => true,
            CommandIntent::Protocol => action.recovery_type == ErrorRecoveryType::FailRun,
        };
        if cascade {
            self.fail_queued(intent, action.failed_at);
        }

        // Setup and fixit failures are the caller's concern; only protocol
        // failures act on the run.
        if intent != CommandIntent::Protocol || self.run_result.is_some() {
            return;
        }
        match action.recovery_type {
            ErrorRecoveryType::FailRun => {
                self.run_result = Some(RunResult::Failed);
                self.run_error.get_or_insert(occurrence);
                self.queue_status = QueueStatus::Paused;
            }
            ErrorRecoveryType::WaitForRecovery => {
                self.queue_status = if self.door_blocking {
                    QueueStatus::AwaitingRecoveryPaused
                } else {
                    QueueStatus::AwaitingRecovery
                };
                self.recovery_target = Some(action.command_id.clone());
                self.has_entered_error_recovery = true;
            }
            ErrorRecoveryType::AssumeFalsePositiveAndContinue | ErrorRecoveryType::IgnoreAndContinue => {}
        }
    }

    fn fail_queued(&mut self, intent: CommandIntent, failed_at: DateTime<Utc>) {
        let queued: Vec<CommandId> = self.queue_mut(intent).drain(..).collect();
        for id in queued {
            let entry = self.entry_mut(&id);
            entry.command = entry.command.clone().to_failed_unrun(failed_at);
        }
    }

    fn handle_play(&mut self, action: &PlayAction) {
        if self.run_result.is_some() {
            return;
        }
        self.run_started_at.get_or_insert(action.requested_at);
        if self.door_blocking {
            return;
        }
        self.queue_status = match self.queue_status {
            QueueStatus::Setup | QueueStatus::Paused => QueueStatus::Running,
            QueueStatus::AwaitingRecoveryPaused => QueueStatus::AwaitingRecovery,
            status @ (QueueStatus::Running | QueueStatus::AwaitingRecovery) => status,
        };
    }

    fn handle_door_change(&mut self, open: bool) {
        if !self.block_on_door_open {
            return;
        }
        self.door_blocking = open;
        if open {
            self.queue_status = match self.queue_status {
                QueueStatus::Setup => QueueStatus::Setup,
                QueueStatus::Running | QueueStatus::Paused => QueueStatus::Paused,
                QueueStatus::AwaitingRecovery | QueueStatus::AwaitingRecoveryPaused => {
                    QueueStatus::AwaitingRecoveryPaused
                }
            };
        }
    }

    fn handle_run_failed(&mut self, action: &RunFailedAction) {
        let occurrence = ErrorOccurrence::new(
            &action.error_id,
            action.failed_at,
            "cache-inconsistency",
            action.error.to_string(),
            false,
        );
        if self.run_result.is_none() {
            self.run_result = Some(RunResult::Failed);
            self.queue_status = QueueStatus::Paused;
            self.recovery_target = None;
        }
        self.run_error = Some(occurrence);
        self.fatal_error.get_or_insert_with(|| action.error.clone());
    }

    fn entry_mut(&mut self, command_id: &str) -> &mut CommandEntry {
        // Actions only ever name commands that were queued through this state.
        self.entries
            .get_mut(command_id)
            .unwrap_or_else(|| panic!("action refers to unknown command {}", command_id))
    }

    fn queue_mut(&mut self, intent: CommandIntent) -> &mut VecDeque<CommandId> {
        match intent {
            CommandIntent::Protocol => &mut self.protocol_queue,
            CommandIntent::Setup => &mut self.setup_queue,
            CommandIntent::Fixit => &mut self.fixit_queue,
        }
    }

    fn clear_running(&mut self, command_id: &str) {
        if self.running.as_deref() == Some(command_id) {
            self.running = None;
        }
    }

    pub fn get(&self, command_id: &str) -> Option<&Command> {
        self.entries.get(command_id).map(|entry| &entry.command)
    }

    /// All commands, in the order they were added.
    pub fn get_all(&self) -> Vec<Command> {
        self.order
            .iter()
            .filter_map(|id| self.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn index_of(&self, command_id: &str) -> Option<usize> {
        self.entries.get(command_id).map(|entry| entry.index)
    }

    pub fn get_running_command_id(&self) -> Option<&CommandId> {
        self.running.as_ref()
    }

    /// Queued command ids of one intent, in FIFO order.
    pub fn get_queue_ids(&self, intent: CommandIntent) -> impl Iterator<Item = &CommandId> {
        match intent {
            CommandIntent::Protocol => self.protocol_queue.iter(),
            CommandIntent::Setup => self.setup_queue.iter(),
            CommandIntent::Fixit => self.fixit_queue.iter(),
        }
    }

    /// The next command the queue worker should run, if any.
    ///
    /// Fails with [`EngineError::RunStopped`] once the run has a result, since
    /// no further command will ever run.
    pub fn get_next_to_execute(&self) -> Result<Option<CommandId>, EngineError> {
        if self.run_result.is_some() {
            return Err(EngineError::RunStopped);
        }
        if self.queue_status == QueueStatus::AwaitingRecovery {
            if let Some(id) = self.fixit_queue.front() {
                return Ok(Some(id.clone()));
            }
        }
        if !matches!(self.queue_status, QueueStatus::Paused | QueueStatus::AwaitingRecovery) {
            if let Some(id) = self.setup_queue.front() {
                return Ok(Some(id.clone()));
            }
        }
        if self.queue_status == QueueStatus::Running {
            return Ok(self.protocol_queue.front().cloned());
        }
        Ok(None)
    }

    /// Whether a command will never change status again.
    ///
    /// A queued command counts as final once the run has a result, because
    /// the run will never reach it. Stopping or a fatal engine error leaves
    /// commands queued this way.
    pub fn command_is_final(&self, command_id: &str) -> Option<bool> {
        let status = self.get(command_id)?.status;
        Some(status.is_terminal() || (status == CommandStatus::Queued && self.run_result.is_some()))
    }

    /// Nothing is running and no protocol command is left to run.
    pub fn all_commands_final(&self) -> bool {
        self.running.is_none() && (self.run_result.is_some() || self.protocol_queue.is_empty())
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue_status
    }

    pub fn run_result(&self) -> Option<RunResult> {
        self.run_result
    }

    pub fn is_terminal(&self) -> bool {
        self.run_result.is_some()
    }

    pub fn run_started_at(&self) -> Option<DateTime<Utc>> {
        self.run_started_at
    }

    pub fn run_completed_at(&self) -> Option<DateTime<Utc>> {
        self.run_completed_at
    }

    /// The run's fatal error: the failing command's error for `fail-run`, or
    /// the engine's own error for a fatal cache inconsistency.
    pub fn get_run_error(&self) -> Option<&ErrorOccurrence> {
        self.run_error.as_ref()
    }

    pub fn get_fatal_error(&self) -> Option<&pipette_shared::CacheInconsistencyError> {
        self.fatal_error.as_ref()
    }

    /// Every command failure of the run, in order, whatever its recovery type.
    pub fn get_all_errors(&self) -> &[ErrorOccurrence] {
        &self.failed_command_errors
    }

    pub fn get_failed_command(&self) -> Option<&Command> {
        self.failed_command.as_deref().and_then(|id| self.get(id))
    }

    pub fn get_error_recovery_type(&self, command_id: &str) -> Option<ErrorRecoveryType> {
        self.recovery_types.get(command_id).copied()
    }

    pub fn get_recovery_target(&self) -> Option<&Command> {
        self.recovery_target.as_deref().and_then(|id| self.get(id))
    }

    pub fn has_entered_error_recovery(&self) -> bool {
        self.has_entered_error_recovery
    }

    pub fn get_status(&self) -> EngineStatus {
        if let Some(result) = self.run_result {
            return match result {
                RunResult::Succeeded => EngineStatus::Succeeded,
                RunResult::Failed => EngineStatus::Failed,
                RunResult::Stopped => EngineStatus::Stopped,
            };
        }
        match self.queue_status {
            QueueStatus::Setup => EngineStatus::Idle,
            QueueStatus::Running => EngineStatus::Running,
            QueueStatus::Paused if self.door_blocking => EngineStatus::BlockedByOpenDoor,
            QueueStatus::Paused => EngineStatus::Paused,
            QueueStatus::AwaitingRecovery => EngineStatus::AwaitingRecovery,
            QueueStatus::AwaitingRecoveryPaused if self.door_blocking => {
                EngineStatus::AwaitingRecoveryBlockedByOpenDoor
            }
            QueueStatus::AwaitingRecoveryPaused => EngineStatus::AwaitingRecoveryPaused,
        }
    }

    pub fn validate_queue(&self, intent: CommandIntent) -> Result<(), EngineError> {
        if self.run_result.is_some() {
            return Err(EngineError::RunStopped);
        }
        match intent {
            CommandIntent::Setup if self.queue_status != QueueStatus::Setup => {
                Err(EngineError::SetupCommandNotAllowed)
            }
            CommandIntent::Fixit if self.queue_status != QueueStatus::AwaitingRecovery => {
                Err(EngineError::FixitCommandNotAllowed)
            }
            _ => Ok(()),
        }
    }

    pub fn validate_play(&self) -> Result<(), EngineError> {
        if self.run_result.is_some() {
            return Err(EngineError::RunStopped);
        }
        if self.door_blocking {
            return Err(EngineError::DoorOpen);
        }
        Ok(())
    }

    /// `Ok(true)` when a pause action should be dispatched, `Ok(false)` when
    /// the queue is already paused.
    pub fn validate_pause(&self) -> Result<bool, EngineError> {
        if self.run_result.is_some() {
            return Err(EngineError::RunStopped);
        }
        match self.queue_status {
            QueueStatus::Running => Ok(true),
            QueueStatus::Paused => Ok(false),
            QueueStatus::Setup => Err(EngineError::PauseNotAllowed("the run has not started".to_string())),
            QueueStatus::AwaitingRecovery | QueueStatus::AwaitingRecoveryPaused => Err(
                EngineError::PauseNotAllowed("the run is awaiting error recovery".to_string()),
            ),
        }
    }

    pub fn validate_resume_from_recovery(&self) -> Result<(), EngineError> {
        if self.run_result.is_some() {
            return Err(EngineError::RunStopped);
        }
        if self.queue_status != QueueStatus::AwaitingRecovery {
            return Err(EngineError::ResumeFromRecoveryNotAllowed(
                "the run is not awaiting recovery".to_string(),
            ));
        }
        if !self.fixit_queue.is_empty() {
            return Err(EngineError::ResumeFromRecoveryNotAllowed(
                "fixit commands are still queued".to_string(),
            ));
        }
        Ok(())
    }
}
