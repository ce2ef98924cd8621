use std::fmt;

use serde::{Deserialize, Serialize};

/// How the engine responds to one command failure.
///
/// Decided once per failure by the recovery policy and never changed after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorRecoveryType {
    /// Stop the run and surface the error.
    FailRun,
    /// Pause and wait for an operator or recovery routine.
    WaitForRecovery,
    /// Carry on as if the command succeeded, applying its false-positive correction.
    AssumeFalsePositiveAndContinue,
    /// Carry on with the next command, no correction.
    IgnoreAndContinue,
}

impl ErrorRecoveryType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorRecoveryType::FailRun => "fail-run",
            ErrorRecoveryType::WaitForRecovery => "wait-for-recovery",
            ErrorRecoveryType::AssumeFalsePositiveAndContinue => "assume-false-positive-and-continue",
            ErrorRecoveryType::IgnoreAndContinue => "ignore-and-continue",
        }
    }

    /// Whether the queue keeps pulling protocol commands after this failure.
    pub fn continues_run(self) -> bool {
        matches!(
            self,
            ErrorRecoveryType::AssumeFalsePositiveAndContinue | ErrorRecoveryType::IgnoreAndContinue
        )
    }
}

impl fmt::Display for ErrorRecoveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_continuing_types_keep_the_run_going() {
        assert!(!ErrorRecoveryType::FailRun.continues_run());
        assert!(!ErrorRecoveryType::WaitForRecovery.continues_run());
        assert!(ErrorRecoveryType::AssumeFalsePositiveAndContinue.continues_run());
        assert!(ErrorRecoveryType::IgnoreAndContinue.continues_run());
    }
}
