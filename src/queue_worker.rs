//! The background task that runs queued commands one at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use pipette_shared::{Command, CommandExecutor, ErrorRecoveryType};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::actions::{
    Action, ActionDispatcher, FailCommandAction, RunCommandAction, SucceedCommandAction,
};
use crate::error::EngineError;
use crate::recovery::ErrorRecoveryPolicy;
use crate::state::{QueueStatus, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Playing,
    Paused,
    Done,
}

enum WorkerTask {
    NotStarted,
    Running(JoinHandle<()>),
    Joined,
}

pub struct QueueWorker {
    store: Arc<StateStore>,
    dispatcher: Arc<ActionDispatcher>,
    executor: Arc<dyn CommandExecutor>,
    policy: Arc<dyn ErrorRecoveryPolicy>,
    task: Mutex<WorkerTask>,
}

impl QueueWorker {
    pub fn new(
        store: Arc<StateStore>,
        dispatcher: Arc<ActionDispatcher>,
        executor: Arc<dyn CommandExecutor>,
        policy: Arc<dyn ErrorRecoveryPolicy>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            executor,
            policy,
            task: Mutex::new(WorkerTask::NotStarted),
        }
    }

    /// Spawn the run loop unless it was already spawned. Returns whether this
    /// call spawned it.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.lock_task();
        if !matches!(*task, WorkerTask::NotStarted) {
            return false;
        }
        let worker = Arc::clone(self);
        *task = WorkerTask::Running(tokio::spawn(async move { worker.run().await }));
        tracing::debug!("queue worker started");
        true
    }

    /// Wait for the run loop to exit. Returns at once if it never started.
    ///
    /// The loop only exits once the run has a result, so callers end the run
    /// first. A panic inside the loop is re-raised here.
    pub async fn join(&self) {
        let handle = {
            let mut task = self.lock_task();
            match std::mem::replace(&mut *task, WorkerTask::Joined) {
                WorkerTask::Running(handle) => Some(handle),
                WorkerTask::NotStarted => {
                    *task = WorkerTask::NotStarted;
                    None
                }
                WorkerTask::Joined => None,
            }
        };
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                if error.is_panic() {
                    std::panic::resume_unwind(error.into_panic());
                }
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        let task = self.lock_task();
        match &*task {
            WorkerTask::NotStarted => WorkerState::Idle,
            WorkerTask::Joined => WorkerState::Done,
            WorkerTask::Running(handle) if handle.is_finished() => WorkerState::Done,
            WorkerTask::Running(_) => match self.store.state().commands().queue_status() {
                QueueStatus::Setup => WorkerState::Idle,
                QueueStatus::Running | QueueStatus::AwaitingRecovery => WorkerState::Playing,
                QueueStatus::Paused | QueueStatus::AwaitingRecoveryPaused => WorkerState::Paused,
            },
        }
    }

    async fn run(&self) {
        loop {
            match self.start_next().await {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {}
                Err(EngineError::RunStopped) => break,
                Err(error) => {
                    tracing::error!(%error, "queue worker stopped unexpectedly");
                    break;
                }
            }
        }
        tracing::debug!("queue worker finished");
    }

    /// Wait for a runnable command and move it to `running`.
    ///
    /// `Ok(None)` means the queue changed between the wait and the claim
    /// (a pause, say) and the caller should wait again.
    async fn start_next(&self) -> Result<Option<Command>, EngineError> {
        let command_id = self
            .store
            .wait_for(|state| state.commands().get_next_to_execute())
            .await?;
        let mut claimed = false;
        self.dispatcher.dispatch_with::<EngineError>(|| {
            let state = self.store.state();
            if state.commands().get_next_to_execute()?.as_ref() != Some(&command_id) {
                return Ok(None);
            }
            claimed = true;
            Ok(Some(Action::RunCommand(RunCommandAction {
                command_id: command_id.clone(),
                started_at: Utc::now(),
            })))
        })?;
        if !claimed {
            return Ok(None);
        }
        Ok(self.store.state().commands().get(&command_id).cloned())
    }

    async fn execute(&self, command: Command) {
        tracing::debug!(
            command_id = %command.id,
            command_type = command.command_type(),
            intent = ?command.intent,
            "executing command"
        );
        match self.executor.execute(&command).await {
            Ok(outcome) => {
                self.dispatcher.dispatch(Action::SucceedCommand(SucceedCommandAction {
                    command_id: command.id.clone(),
                    result: outcome.result,
                    state_update: outcome.state_update,
                    completed_at: Utc::now(),
                }));
            }
            Err(error) => {
                let state = self.store.state();
                let recovery_type = match self.policy.classify(&error, &command, &state) {
                    Ok(recovery_type) => recovery_type,
                    Err(policy_error) => {
                        tracing::warn!(command_id = %command.id, %policy_error, "recovery policy failed, failing the run");
                        ErrorRecoveryType::FailRun
                    }
                };
                tracing::warn!(
                    command_id = %command.id,
                    command_type = command.command_type(),
                    %error,
                    recovery = %recovery_type,
                    continues = recovery_type.continues_run(),
                    "command failed"
                );
                self.dispatcher.dispatch(Action::FailCommand(FailCommandAction {
                    command_id: command.id.clone(),
                    error_id: uuid::Uuid::new_v4().to_string(),
                    failed_at: Utc::now(),
                    error,
                    recovery_type,
                }));
            }
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, WorkerTask> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
