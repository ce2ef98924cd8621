// pipette_shared: command model, state updates and boundary traits shared by
// the engine, the simulated robot and the tests.

pub mod command;
pub mod config;
pub mod errors;
pub mod hardware_traits;
pub mod recovery;
pub mod state_update;

pub use command::{
    Command, CommandId, CommandIntent, CommandOutcome, CommandParams, CommandRequest,
    CommandResult, CommandStatus, Mount, WellLocation,
};
pub use errors::{
    CacheInconsistencyError, ErrorOccurrence, ExecutionError, ExecutionErrorKind,
    RecoveryPolicyError, ValidationError,
};
pub use hardware_traits::{CommandExecutor, HardwareStateCache};
pub use recovery::ErrorRecoveryType;
pub use state_update::{StateUpdate, TipGeometry};
