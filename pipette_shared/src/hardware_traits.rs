// Seams between the engine and the hardware side.

use async_trait::async_trait;

use crate::command::{Command, CommandOutcome};
use crate::errors::{CacheInconsistencyError, ExecutionError};
use crate::state_update::StateUpdate;

/// Runs one command against the robot.
///
/// Implementations route on the command's params variant. A call may take a
/// long time but must eventually resolve, with a failure if it was cancelled
/// underneath.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &Command) -> Result<CommandOutcome, ExecutionError>;
}

/// State the hardware layer caches about itself (attached tips, volumes...).
///
/// Normal command execution keeps this cache current on its own. The only
/// other writer is the engine's error recovery coordinator, which replays the
/// correction of a failure that is being treated as a success. Once the
/// hardware layer stops caching command context this trait can go away.
pub trait HardwareStateCache: Send + Sync {
    fn apply_state_update(&self, update: &StateUpdate) -> Result<(), CacheInconsistencyError>;
}
