//! Run logs and terminal records as written to the store.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use strategen_core::domain::{ClassifiedError, Phase, Resolution, RunOutcome, StrategyName};

/// `error_excerpt.final.json` of a run that did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// Classified error kind, or the gateway error kind / abort cause when
    /// nothing was classified.
    pub kind: String,
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub iteration: u32,
    pub terminal_state: Resolution,
    pub phase: Phase,
    /// Path of the last program attempted, if one was extracted.
    pub program: Option<PathBuf>,
}

impl TerminalRecord {
    pub fn from_error(
        error: &ClassifiedError,
        iteration: u32,
        terminal_state: Resolution,
        phase: Phase,
        program: Option<PathBuf>,
    ) -> Self {
        Self {
            kind: error.kind.as_str().to_string(),
            excerpt: error.excerpt.clone(),
            hint: error.hint.clone(),
            iteration,
            terminal_state,
            phase,
            program,
        }
    }
}

/// Header fields shared by every run log.
pub struct LogHeader<'a> {
    pub strategy: &'a StrategyName,
    pub phase: Phase,
    pub iteration: u32,
    pub command: Option<String>,
}

/// Human-readable log of one attempt. `outcome` is `None` when the program
/// was not executed; `note` then says why.
pub fn render_run_log(header: &LogHeader<'_>, outcome: Option<&RunOutcome>, note: Option<&str>) -> String {
    let mut log = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(log, "strategy: {}", header.strategy);
    let _ = writeln!(log, "phase: {}", header.phase);
    let _ = writeln!(log, "iteration: {}", header.iteration);
    if let Some(command) = &header.command {
        let _ = writeln!(log, "command: {command}");
    }

    match outcome {
        Some(o) => {
            let _ = writeln!(log, "status: {}", o.status);
            match o.exit_code {
                Some(code) => {
                    let _ = writeln!(log, "exit_code: {code}");
                }
                None => log.push_str("exit_code: none\n"),
            }
            let _ = writeln!(log, "wall_time: {:.3}s", o.wall_time);
            let _ = writeln!(log, "started_at: {}", o.started_at.to_rfc3339());
            let _ = writeln!(log, "ended_at: {}", o.ended_at.to_rfc3339());
            if o.cancelled {
                log.push_str("cancelled: true\n");
            }
        }
        None => log.push_str("status: not_executed\n"),
    }
    if let Some(note) = note {
        let _ = writeln!(log, "note: {note}");
    }

    if let Some(o) = outcome {
        log.push_str("\n--- stdout ---\n");
        log.push_str(&o.stdout);
        if !o.stdout.is_empty() && !o.stdout.ends_with('\n') {
            log.push('\n');
        }
        log.push_str("--- stderr ---\n");
        log.push_str(&o.stderr);
        if !o.stderr.is_empty() && !o.stderr.ends_with('\n') {
            log.push('\n');
        }
    }
    log
}

/// Final run log: the terminal state stamped above the last attempt's log.
pub fn stamp_run_log(terminal: Resolution, reason: &str, last_log: Option<&str>) -> String {
    let mut log = format!("terminal_state: {terminal}\nreason: {reason}\n");
    if let Some(last) = last_log {
        log.push('\n');
        log.push_str(last);
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strategen_core::domain::{ErrorKind, RunStatus};

    fn header(name: &StrategyName) -> LogHeader<'_> {
        LogHeader {
            strategy: name,
            phase: Phase::Debug,
            iteration: 2,
            command: Some("python /a/extracted_code.2.py".into()),
        }
    }

    #[test]
    fn run_log_has_header_and_streams() {
        let name = StrategyName::parse("Rsi").unwrap();
        let outcome = RunOutcome {
            status: RunStatus::NonzeroExit,
            exit_code: Some(1),
            stdout: "loading".into(),
            stderr: "KeyError: 'Close'\n".into(),
            wall_time: 0.25,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            cancelled: false,
        };
        let log = render_run_log(&header(&name), Some(&outcome), None);
        assert!(log.starts_with("strategy: Rsi\nphase: debug\niteration: 2\n"));
        assert!(log.contains("status: nonzero_exit\nexit_code: 1\n"));
        assert!(log.contains("--- stdout ---\nloading\n--- stderr ---\nKeyError: 'Close'\n"));
    }

    #[test]
    fn unexecuted_attempt_says_why() {
        let name = StrategyName::parse("Rsi").unwrap();
        let log = render_run_log(&header(&name), None, Some("extracted program is empty"));
        assert!(log.contains("status: not_executed\nnote: extracted program is empty\n"));
        assert!(!log.contains("--- stdout ---"));
    }

    #[test]
    fn terminal_record_serialises_state_and_kind() {
        let err = ClassifiedError::new(ErrorKind::ValueOrType, "ValueError: bad");
        let record = TerminalRecord::from_error(&err, 2, Resolution::Exhausted, Phase::Debug, None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "value_or_type");
        assert_eq!(json["terminal_state"], "exhausted");
        assert_eq!(json["iteration"], 2);
        assert!(json.get("hint").is_none());
    }

    #[test]
    fn stamp_prefixes_terminal_state() {
        let log = stamp_run_log(Resolution::Aborted, "data_missing", Some("strategy: X\n"));
        assert_eq!(log, "terminal_state: aborted\nreason: data_missing\n\nstrategy: X\n");
    }
}
