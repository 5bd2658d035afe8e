//! Results of executing a program in the sandbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse execution status assigned by the sandbox runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Exit code 0 and no trailing exception trace on stderr.
    Ok,
    /// Non-zero exit, or exit 0 with a trailing exception trace.
    NonzeroExit,
    /// Wall-clock budget exceeded; the child was killed.
    Timeout,
    /// The child could not be started (or its environment was missing).
    LauncherError,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::NonzeroExit => "nonzero_exit",
            RunStatus::Timeout => "timeout",
            RunStatus::LauncherError => "launcher_error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one execution.
///
/// Output is captured in full and decoded lossily as UTF-8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Seconds between spawn and reap.
    pub wall_time: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when an operator cancel killed the child.
    #[serde(default)]
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    /// Outcome used when there is nothing to execute.
    pub fn noop() -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::Ok,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            wall_time: 0.0,
            started_at: now,
            ended_at: now,
            cancelled: false,
        }
    }

    /// Outcome for a child that never started.
    pub fn launcher_error(message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let ended_at = Utc::now();
        Self {
            status: RunStatus::LauncherError,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
            wall_time: (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            started_at,
            ended_at,
            cancelled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_is_ok_with_empty_output() {
        let o = RunOutcome::noop();
        assert!(o.is_ok());
        assert_eq!(o.exit_code, Some(0));
        assert!(o.stdout.is_empty());
    }

    #[test]
    fn launcher_error_has_no_exit_code() {
        let o = RunOutcome::launcher_error("python: not found", Utc::now());
        assert_eq!(o.status, RunStatus::LauncherError);
        assert_eq!(o.exit_code, None);
        assert!(o.stderr.contains("not found"));
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&RunStatus::NonzeroExit).unwrap();
        assert_eq!(json, "\"nonzero_exit\"");
    }
}
