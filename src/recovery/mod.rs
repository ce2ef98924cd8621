//! Error recovery: classifying command failures and keeping the hardware-side
//! state cache in step with the engine when a failure is treated as a success.

mod policy;

pub use policy::{ErrorRecoveryPolicy, StandardRecoveryPolicy};

use std::sync::Arc;

use chrono::Utc;
use pipette_shared::{ErrorRecoveryType, HardwareStateCache, StateUpdate};

use crate::actions::{Action, ActionHandler, RunFailedAction};

/// Replays state corrections onto the [`HardwareStateCache`].
///
/// Registered after the state store, so the engine has already committed the
/// command's failure when the cache is corrected. This is the only writer of
/// the cache outside normal command execution.
pub struct ErrorRecoveryCoordinator {
    hardware: Arc<dyn HardwareStateCache>,
}

impl ErrorRecoveryCoordinator {
    pub fn new(hardware: Arc<dyn HardwareStateCache>) -> Self {
        Self { hardware }
    }

    fn sync(&self, update: &StateUpdate) -> Option<Action> {
        if update.is_empty() {
            return None;
        }
        match self.hardware.apply_state_update(update) {
            Ok(()) => None,
            Err(error) => {
                tracing::error!(%error, "failed to apply state update to the hardware cache; failing the run");
                Some(Action::RunFailed(RunFailedAction {
                    error_id: uuid::Uuid::new_v4().to_string(),
                    failed_at: Utc::now(),
                    error,
                }))
            }
        }
    }
}

impl ActionHandler for ErrorRecoveryCoordinator {
    fn handle_action(&self, action: &Action) -> Option<Action> {
        match action {
            Action::FailCommand(a) if a.recovery_type == ErrorRecoveryType::AssumeFalsePositiveAndContinue => {
                tracing::debug!(command_id = %a.command_id, "applying false-positive correction to hardware cache");
                self.sync(&a.error.state_update_if_false_positive)
            }
            Action::ResumeFromRecovery(a) => self.sync(&a.state_update),
            _ => None,
        }
    }
}
