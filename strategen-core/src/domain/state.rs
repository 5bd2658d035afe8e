//! Per-strategy loop state.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::classified::ClassifiedError;
use super::outcome::RunOutcome;
use super::program::Program;

/// Where a strategy run stands. Exactly one terminal value ends every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Resolved,
    Exhausted,
    Aborted,
}

impl Resolution {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Resolution::Pending)
    }

    /// Process exit code when the pipeline runs as a CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            Resolution::Resolved => 0,
            Resolution::Exhausted => 2,
            Resolution::Aborted => 3,
            Resolution::Pending => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Resolved => "resolved",
            Resolution::Exhausted => "exhausted",
            Resolution::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient state owned by the pipeline controller for one phase.
#[derive(Debug, Clone)]
pub struct DebugState {
    pub current_program: Program,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<ClassifiedError>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub resolution: Resolution,
}

impl DebugState {
    /// Fresh state at iteration 0. A zero budget is raised to one.
    pub fn new(program: Program, max_iterations: u32) -> Self {
        Self {
            current_program: program,
            last_outcome: None,
            last_error: None,
            iteration: 0,
            max_iterations: max_iterations.max(1),
            resolution: Resolution::Pending,
        }
    }

    pub fn budget_spent(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(Resolution::Resolved.exit_code(), 0);
        assert_eq!(Resolution::Exhausted.exit_code(), 2);
        assert_eq!(Resolution::Aborted.exit_code(), 3);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!Resolution::Pending.is_terminal());
        assert!(Resolution::Resolved.is_terminal());
        assert!(Resolution::Exhausted.is_terminal());
        assert!(Resolution::Aborted.is_terminal());
    }

    #[test]
    fn budget_is_at_least_one() {
        let program = Program::new(String::new(), PathBuf::new(), None);
        let state = DebugState::new(program, 0);
        assert_eq!(state.max_iterations, 1);
        assert!(!state.budget_spent());
    }
}
