use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Action;

/// Something that reacts to actions.
///
/// Handlers run synchronously on the dispatching thread and must not fail.
/// A handler that needs to report a problem returns a follow-up action, which
/// the dispatcher applies once the current action has reached every handler.
/// Handlers must not dispatch actions themselves.
pub trait ActionHandler: Send + Sync {
    fn handle_action(&self, action: &Action) -> Option<Action>;
}

/// Fans each action out to all handlers, in registration order.
///
/// Dispatches are serialized: one action (with its follow-ups) is fully
/// applied before the next one starts, so every handler sees the same total
/// order of actions.
pub struct ActionDispatcher {
    handlers: Vec<Arc<dyn ActionHandler>>,
    serial: Mutex<()>,
}

impl ActionDispatcher {
    pub fn new(handlers: Vec<Arc<dyn ActionHandler>>) -> Self {
        Self {
            handlers,
            serial: Mutex::new(()),
        }
    }

    pub fn dispatch(&self, action: Action) {
        let _serial = self.lock();
        self.apply(action);
    }

    /// Build and dispatch an action as one atomic step.
    ///
    /// `build` runs while holding the dispatch lock, so any state it reads
    /// cannot change before its action is applied. `Ok(None)` dispatches
    /// nothing.
    pub fn dispatch_with<E>(&self, build: impl FnOnce() -> Result<Option<Action>, E>) -> Result<(), E> {
        let _serial = self.lock();
        if let Some(action) = build()? {
            self.apply(action);
        }
        Ok(())
    }

    fn apply(&self, action: Action) {
        let mut pending = VecDeque::from([action]);
        while let Some(action) = pending.pop_front() {
            tracing::debug!(action = action.name(), "dispatching action");
            for handler in &self.handlers {
                if let Some(follow_up) = handler.handle_action(&action) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
