// pipette-rs: command execution engine for a liquid-handling robot.
pub mod actions;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod queue_worker;
pub mod recovery;
pub mod state;

pub use engine::CommandEngine;
pub use error::EngineError;
pub use queue_worker::WorkerState;
pub use recovery::{ErrorRecoveryCoordinator, ErrorRecoveryPolicy, StandardRecoveryPolicy};
pub use state::{EngineState, EngineStatus, QueueStatus, RunResult, StateStore};
