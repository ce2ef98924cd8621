//! The engine facade: the public enqueue, control, query and wait surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipette_shared::config::EngineConfig;
use pipette_shared::{
    CacheInconsistencyError, Command, CommandExecutor, CommandId, CommandIntent, CommandRequest,
    ErrorOccurrence, ErrorRecoveryType, HardwareStateCache, StateUpdate,
};

use crate::actions::{
    Action, ActionDispatcher, ActionHandler, DoorChangeAction, FinishAction, PauseAction,
    PlayAction, QueueCommandAction, ResumeFromRecoveryAction, StopAction,
};
use crate::error::EngineError;
use crate::queue_worker::{QueueWorker, WorkerState};
use crate::recovery::{ErrorRecoveryCoordinator, ErrorRecoveryPolicy};
use crate::state::{EngineState, EngineStatus, StateStore};

/// One run of commands against one robot.
///
/// All methods take `&self`; the engine is shared behind an `Arc` between
/// the caller's tasks. Control calls never block on command execution.
pub struct CommandEngine {
    store: Arc<StateStore>,
    dispatcher: Arc<ActionDispatcher>,
    worker: Arc<QueueWorker>,
}

impl CommandEngine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        policy: Arc<dyn ErrorRecoveryPolicy>,
        hardware: Arc<dyn HardwareStateCache>,
    ) -> Self {
        let store = Arc::new(StateStore::new(&config));
        let coordinator = Arc::new(ErrorRecoveryCoordinator::new(hardware));
        // The store must commit an action before the coordinator touches the
        // hardware cache for it.
        let handlers: Vec<Arc<dyn ActionHandler>> = vec![store.clone(), coordinator];
        let dispatcher = Arc::new(ActionDispatcher::new(handlers));
        let worker = Arc::new(QueueWorker::new(store.clone(), dispatcher.clone(), executor, policy));
        Self {
            store,
            dispatcher,
            worker,
        }
    }

    /// Validate and enqueue a command.
    ///
    /// Setup commands start the queue worker right away so they can run before
    /// the protocol is played.
    pub fn add_command(&self, request: CommandRequest) -> Result<Command, EngineError> {
        let intent = request.intent;
        let mut command = Command::create(request, Utc::now())?;
        self.dispatcher.dispatch_with(|| {
            let state = self.store.state();
            state.commands().validate_queue(intent)?;
            if intent == CommandIntent::Fixit {
                command.failed_command_id = state.commands().get_recovery_target().map(|c| c.id.clone());
            }
            Ok::<_, EngineError>(Some(Action::QueueCommand(QueueCommandAction {
                command: command.clone(),
            })))
        })?;
        tracing::debug!(
            command_id = %command.id,
            command_type = command.command_type(),
            intent = ?intent,
            "command queued"
        );
        if intent == CommandIntent::Setup {
            self.worker.start();
        }
        Ok(command)
    }

    /// Start or resume pulling protocol commands. Idempotent while playing.
    pub fn play(&self) -> Result<(), EngineError> {
        self.dispatcher.dispatch_with(|| {
            self.store.state().commands().validate_play()?;
            Ok::<_, EngineError>(Some(Action::Play(PlayAction {
                requested_at: Utc::now(),
            })))
        })?;
        if self.worker.start() {
            tracing::info!("run started");
        } else {
            tracing::info!("run resumed");
        }
        Ok(())
    }

    /// Stop pulling new commands. A command already running still finishes.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut paused = false;
        self.dispatcher.dispatch_with(|| {
            if !self.store.state().commands().validate_pause()? {
                return Ok(None);
            }
            paused = true;
            Ok::<_, EngineError>(Some(Action::Pause(PauseAction)))
        })?;
        if paused {
            tracing::info!("run paused");
        }
        Ok(())
    }

    /// End the run as `stopped`. Does not wait for the in-flight command.
    pub fn cancel(&self) {
        if !self.store.state().commands().is_terminal() {
            tracing::info!("run cancelled");
        }
        self.dispatcher.dispatch(Action::Stop(StopAction));
    }

    /// End the run as `succeeded` unless it already has a result, then wait
    /// for the queue worker to exit.
    pub async fn finish(&self) {
        self.dispatcher.dispatch(Action::Finish(FinishAction {
            finished_at: Utc::now(),
        }));
        self.worker.join().await;
        let state = self.store.state();
        tracing::info!(status = ?state.commands().get_status(), "run finished");
    }

    /// Leave `awaiting-recovery` and carry on with the protocol, applying
    /// `state_update` to engine state and to the hardware cache.
    pub fn resume_from_recovery(&self, state_update: StateUpdate) -> Result<(), EngineError> {
        self.dispatcher.dispatch_with(|| {
            self.store.state().commands().validate_resume_from_recovery()?;
            Ok::<_, EngineError>(Some(Action::ResumeFromRecovery(ResumeFromRecoveryAction {
                state_update,
            })))
        })?;
        tracing::info!("resumed from error recovery");
        Ok(())
    }

    pub fn set_door_open(&self, open: bool) {
        tracing::info!(open, "door state changed");
        self.dispatcher.dispatch(Action::DoorChange(DoorChangeAction { open }));
    }

    /// Resolve once `predicate` yields a value, re-checked on every state change.
    pub async fn wait_for<T, F>(&self, predicate: F) -> Result<T, EngineError>
    where
        F: FnMut(&EngineState) -> Result<Option<T>, EngineError>,
    {
        self.store.wait_for(predicate).await
    }

    /// Resolve with the command once it can no longer change.
    pub async fn wait_for_command(&self, command_id: &str) -> Result<Command, EngineError> {
        self.store
            .wait_for(|state| {
                let commands = state.commands();
                match commands.command_is_final(command_id) {
                    None => Err(EngineError::CommandNotFound(command_id.to_string())),
                    Some(false) => Ok(None),
                    Some(true) => Ok(commands.get(command_id).cloned()),
                }
            })
            .await
    }

    /// Resolve once nothing is running and no protocol command is left to
    /// run, or the run has ended.
    ///
    /// A run failed by a command is not an error here; inspect
    /// [`get_run_error`](Self::get_run_error). A fatal cache inconsistency is.
    pub async fn wait_for_done(&self) -> Result<(), EngineError> {
        self.store.wait_for(done_predicate).await
    }

    pub async fn wait_for_done_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        self.store.wait_for_timeout(done_predicate, timeout).await
    }

    pub fn get(&self, command_id: &str) -> Result<Command, EngineError> {
        self.store
            .state()
            .commands()
            .get(command_id)
            .cloned()
            .ok_or_else(|| EngineError::CommandNotFound(command_id.to_string()))
    }

    /// Every command, in enqueue order.
    pub fn get_all(&self) -> Vec<Command> {
        self.store.state().commands().get_all()
    }

    /// Id of the next command the worker would run, if it were allowed to.
    pub fn get_next_queued(&self) -> Option<CommandId> {
        self.store.state().commands().get_next_to_execute().ok().flatten()
    }

    pub fn get_running_command_id(&self) -> Option<CommandId> {
        self.store.state().commands().get_running_command_id().cloned()
    }

    pub fn get_recovery_target(&self) -> Option<Command> {
        self.store.state().commands().get_recovery_target().cloned()
    }

    pub fn get_error_recovery_type(&self, command_id: &str) -> Option<ErrorRecoveryType> {
        self.store.state().commands().get_error_recovery_type(command_id)
    }

    pub fn get_all_errors(&self) -> Vec<ErrorOccurrence> {
        self.store.state().commands().get_all_errors().to_vec()
    }

    /// The most recent command to fail, whatever its recovery type.
    pub fn get_failed_command(&self) -> Option<Command> {
        self.store.state().commands().get_failed_command().cloned()
    }

    pub fn get_run_error(&self) -> Option<ErrorOccurrence> {
        self.store.state().commands().get_run_error().cloned()
    }

    pub fn get_fatal_error(&self) -> Option<CacheInconsistencyError> {
        self.store.state().commands().get_fatal_error().cloned()
    }

    pub fn status(&self) -> EngineStatus {
        self.store.state().commands().get_status()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// The current immutable snapshot.
    pub fn state(&self) -> Arc<EngineState> {
        self.store.state()
    }
}

fn done_predicate(state: &EngineState) -> Result<Option<()>, EngineError> {
    let commands = state.commands();
    if let Some(error) = commands.get_fatal_error() {
        return Err(EngineError::CacheInconsistency(error.clone()));
    }
    Ok(commands.all_commands_final().then_some(()))
}
