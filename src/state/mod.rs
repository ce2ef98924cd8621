//! The state store: a versioned, immutable snapshot of everything the engine
//! knows, replaced wholesale on every action.

mod commands;
mod pipettes;

pub use commands::{CommandState, EngineStatus, QueueStatus, RunResult};
pub use pipettes::{LoadedPipette, PipetteState};

use std::sync::Arc;
use std::time::Duration;

use pipette_shared::config::EngineConfig;
use tokio::sync::watch;

use crate::actions::{Action, ActionHandler};
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct EngineState {
    version: u64,
    commands: CommandState,
    pipettes: PipetteState,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            version: 0,
            commands: CommandState::new(config.block_on_door_open),
            pipettes: PipetteState::default(),
        }
    }

    /// Number of actions applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn commands(&self) -> &CommandState {
        &self.commands
    }

    pub fn pipettes(&self) -> &PipetteState {
        &self.pipettes
    }

    fn apply(&mut self, action: &Action) {
        self.commands.handle_action(action);
        self.pipettes.handle_action(action);
        self.version += 1;
    }
}

/// Holds the current [`EngineState`] and wakes waiters when it changes.
///
/// Readers get an `Arc` to a snapshot that is never mutated afterwards, so a
/// snapshot can be held across awaits without seeing a half-applied action.
pub struct StateStore {
    sender: watch::Sender<Arc<EngineState>>,
}

impl StateStore {
    pub fn new(config: &EngineConfig) -> Self {
        let (sender, _) = watch::channel(Arc::new(EngineState::new(config)));
        Self { sender }
    }

    /// The current snapshot.
    pub fn state(&self) -> Arc<EngineState> {
        self.sender.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.sender.borrow().version
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineState>> {
        self.sender.subscribe()
    }

    /// Reduce `action` into a new snapshot and notify every waiter.
    pub fn handle_action(&self, action: &Action) {
        self.sender.send_modify(|state| {
            Arc::make_mut(state).apply(action);
        });
    }

    /// Resolve once `predicate` yields a value.
    ///
    /// The predicate is checked against the current snapshot first, and then
    /// against the latest snapshot after every change. An error from the
    /// predicate ends the wait and is returned to this caller only.
    pub async fn wait_for<T, F>(&self, mut predicate: F) -> Result<T, EngineError>
    where
        F: FnMut(&EngineState) -> Result<Option<T>, EngineError>,
    {
        let mut receiver = self.sender.subscribe();
        loop {
            let snapshot = receiver.borrow_and_update().clone();
            if let Some(value) = predicate(&snapshot)? {
                return Ok(value);
            }
            receiver.changed().await.map_err(|_| EngineError::StoreClosed)?;
        }
    }

    /// [`wait_for`](Self::wait_for), failing with [`EngineError::WaitTimeout`]
    /// if the predicate does not hold within `timeout`.
    pub async fn wait_for_timeout<T, F>(&self, predicate: F, timeout: Duration) -> Result<T, EngineError>
    where
        F: FnMut(&EngineState) -> Result<Option<T>, EngineError>,
    {
        tokio::time::timeout(timeout, self.wait_for(predicate))
            .await
            .map_err(|_| EngineError::WaitTimeout(timeout))?
    }
}

impl ActionHandler for StateStore {
    fn handle_action(&self, action: &Action) -> Option<Action> {
        StateStore::handle_action(self, action);
        None
    }
}
