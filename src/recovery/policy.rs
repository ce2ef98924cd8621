use std::collections::HashMap;

use pipette_shared::config::{ConfigError, RecoveryConfig};
use pipette_shared::{Command, ErrorRecoveryType, ExecutionError, ExecutionErrorKind, RecoveryPolicyError};

use crate::state::EngineState;

/// Decides how the engine responds to one command failure.
///
/// Called exactly once per failure, with the state as it was just before the
/// failure is recorded. Must not have side effects.
pub trait ErrorRecoveryPolicy: Send + Sync {
    fn classify(
        &self,
        error: &ExecutionError,
        command: &Command,
        state: &EngineState,
    ) -> Result<ErrorRecoveryType, RecoveryPolicyError>;
}

impl<F> ErrorRecoveryPolicy for F
where
    F: Fn(&ExecutionError, &Command, &EngineState) -> Result<ErrorRecoveryType, RecoveryPolicyError> + Send + Sync,
{
    fn classify(
        &self,
        error: &ExecutionError,
        command: &Command,
        state: &EngineState,
    ) -> Result<ErrorRecoveryType, RecoveryPolicyError> {
        self(error, command, state)
    }
}

/// Table-driven policy built from `[recovery]` configuration.
#[derive(Debug, Clone)]
pub struct StandardRecoveryPolicy {
    enabled: bool,
    defined_error_default: ErrorRecoveryType,
    overrides: HashMap<ExecutionErrorKind, ErrorRecoveryType>,
}

impl StandardRecoveryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Result<Self, ConfigError> {
        let overrides = config.parsed_overrides().map_err(ConfigError::Invalid)?;
        Ok(Self {
            enabled: config.enabled,
            defined_error_default: config.defined_error_default,
            overrides,
        })
    }
}

impl Default for StandardRecoveryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            defined_error_default: ErrorRecoveryType::WaitForRecovery,
            overrides: HashMap::new(),
        }
    }
}

impl ErrorRecoveryPolicy for StandardRecoveryPolicy {
    fn classify(
        &self,
        error: &ExecutionError,
        _command: &Command,
        _state: &EngineState,
    ) -> Result<ErrorRecoveryType, RecoveryPolicyError> {
        if !self.enabled {
            return Ok(ErrorRecoveryType::FailRun);
        }
        let recovery = match self.overrides.get(&error.kind) {
            Some(recovery) => *recovery,
            None if error.kind.is_defined() => self.defined_error_default,
            None => ErrorRecoveryType::FailRun,
        };
        if recovery == ErrorRecoveryType::AssumeFalsePositiveAndContinue
            && error.state_update_if_false_positive.is_empty()
        {
            return Err(RecoveryPolicyError(format!(
                "'{}' has no false-positive correction to apply",
                error.kind
            )));
        }
        Ok(recovery)
    }
}
