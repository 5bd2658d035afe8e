//! End-to-end pipeline runs against a scripted model.
//!
//! Generated "programs" are POSIX shell scripts run with `sh`, so these
//! tests need no Python install. Tracebacks are emulated on stderr.
#![cfg(unix)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use proptest::prelude::*;

use strategen_core::domain::{
    ArtifactKey, ArtifactKind, ErrorKind, Iteration, Phase, Resolution, RunId, RunOutcome,
    RunStatus, StrategyBrief,
};
use strategen_core::gateway::{RetryPolicy, ScriptedProvider, ScriptedReply};
use strategen_core::{CancelToken, Gateway, GatewayErrorKind};
use strategen_runner::{
    AbortCause, LoopState, PhaseGateways, Pipeline, PipelineConfig, PipelineError, StrategyReport,
    TerminalRecord,
};

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    _root: tempfile::TempDir,
    provider: Arc<ScriptedProvider>,
    pipeline: Pipeline,
}

fn run_id() -> RunId {
    RunId::for_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
}

fn config(root: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        artifact_root: root.to_path_buf(),
        interpreter: "sh".into(),
        execution_timeout_seconds: 20,
        kill_grace_seconds: 1,
        max_debug_iterations: 3,
        ..PipelineConfig::default()
    }
}

fn harness_with(replies: Vec<ScriptedReply>, tweak: impl FnOnce(&mut PipelineConfig)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = config(root.path());
    tweak(&mut config);

    let provider = Arc::new(ScriptedProvider::new(replies));
    let gateway = Gateway::new(Box::new(Arc::clone(&provider))).with_retry_policy(RetryPolicy::immediate());
    let pipeline = Pipeline::new(&config, PhaseGateways::shared(gateway))
        .unwrap()
        .with_run_id(run_id());
    Harness {
        _root: root,
        provider,
        pipeline,
    }
}

fn harness(replies: Vec<ScriptedReply>) -> Harness {
    harness_with(replies, |_| {})
}

impl Harness {
    fn run(&self, brief: &StrategyBrief) -> StrategyReport {
        self.pipeline.run_strategy(brief, &CancelToken::new()).unwrap()
    }

    fn key(&self, phase: Phase, iteration: Iteration, kind: ArtifactKind) -> ArtifactKey {
        ArtifactKey::new(run_id(), sma_cross().name, phase, iteration, kind)
    }

    fn read(&self, phase: Phase, iteration: Iteration, kind: ArtifactKind) -> String {
        self.pipeline
            .store()
            .get_string(&self.key(phase, iteration, kind))
            .unwrap()
    }

    fn has(&self, phase: Phase, iteration: Iteration, kind: ArtifactKind) -> bool {
        self.pipeline.store().contains(&self.key(phase, iteration, kind))
    }

    fn terminal_record(&self, phase: Phase) -> TerminalRecord {
        let json = self.read(phase, Iteration::Final, ArtifactKind::ErrorExcerpt);
        serde_json::from_str(&json).unwrap()
    }
}

fn sma_cross() -> StrategyBrief {
    StrategyBrief::new("SmaCross", "SMA(10) over SMA(30) on Close, long-only", "/tmp/ok.csv").unwrap()
}

const RESEARCH: &str = "## SmaCross\n\nGo long when SMA(10) crosses above SMA(30); exit on the cross back.\n";

/// A model reply wrapping `body` in a python fence with some prose around it.
fn reply(body: &str) -> ScriptedReply {
    ScriptedReply::text(format!(
        "Here is the program:\n\n```python\n{body}```\n\nIt prints a summary when done.\n"
    ))
}

fn good_program(tag: &str) -> String {
    format!("# {tag}\necho 'Return [%] 12.5'\necho 'Sharpe Ratio 1.1'\n")
}

fn value_error_program(tag: &str) -> String {
    format!(
        "# {tag}\n\
         echo 'Traceback (most recent call last):' >&2\n\
         echo '  File \"bt.py\", line 40, in <module>' >&2\n\
         echo 'ValueError: window must be positive' >&2\n\
         exit 1\n"
    )
}

fn syntax_error_program() -> String {
    "echo '  File \"bt.py\", line 12' >&2\n\
     echo '    if fast > slow' >&2\n\
     echo '                  ^' >&2\n\
     echo \"SyntaxError: expected ':'\" >&2\n\
     exit 1\n"
        .to_string()
}

fn targets(report: &StrategyReport) -> Vec<LoopState> {
    report.transitions.iter().map(|t| t.to).collect()
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn happy_path_resolves_at_iteration_zero() {
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(&good_program("v0"))]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.terminal_phase, Phase::Backtest);
    assert_eq!(report.iteration, 0);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.runner_calls, 1);
    assert_eq!(report.gateway_calls, 2);
    assert_eq!(
        targets(&report),
        [LoopState::Extracting, LoopState::Running, LoopState::Classifying, LoopState::Resolved]
    );

    // Research notes, first program, promoted program and run log.
    assert_eq!(h.read(Phase::Research, Iteration::Final, ArtifactKind::RawResponse), RESEARCH);
    let first = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::ExtractedCode);
    let promoted = h.read(Phase::Backtest, Iteration::Final, ArtifactKind::ExtractedCode);
    assert_eq!(first, good_program("v0"));
    assert_eq!(promoted, first);
    assert_eq!(report.final_program, Some(h.pipeline.store().path_for(&h.key(
        Phase::Backtest,
        Iteration::Final,
        ArtifactKind::ExtractedCode
    ))));
    let log = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::RunLog);
    assert!(log.contains("status: ok"));
    assert!(log.contains("Return [%] 12.5"));
    assert!(h.has(Phase::Backtest, Iteration::Final, ArtifactKind::RunLog));
    assert!(!h.has(Phase::Backtest, Iteration::Final, ArtifactKind::ErrorExcerpt));
}

#[test]
fn research_notes_reach_the_backtest_prompt_verbatim() {
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(&good_program("v0"))]);
    h.run(&sma_cross());

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user_content.contains(RESEARCH.trim_end()));
    assert!(requests[1].user_content.contains("/tmp/ok.csv"));
}

#[test]
fn syntax_error_is_repaired_on_the_next_iteration() {
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        reply(&syntax_error_program()),
        reply(&good_program("fixed")),
    ]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.terminal_phase, Phase::Debug);
    assert_eq!(report.iteration, 1);
    assert_eq!(report.runner_calls, 2);

    let json = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::ErrorExcerpt);
    let error: strategen_core::domain::ClassifiedError = serde_json::from_str(&json).unwrap();
    assert_eq!(error.kind, ErrorKind::Syntax);
    assert!(error.excerpt.contains("line 12"));

    // The repair request carries the whole failed program and its kind.
    let repair = &h.provider.requests()[2].user_content;
    assert!(repair.contains(&syntax_error_program()));
    assert!(repair.contains("Kind: syntax"));
    assert!(repair.contains("line 12"));

    assert_eq!(
        h.read(Phase::Debug, Iteration::Final, ArtifactKind::ExtractedCode),
        good_program("fixed")
    );
}

#[test]
fn budget_exhaustion_after_max_repairs() {
    let h = harness_with(
        vec![
            ScriptedReply::text(RESEARCH),
            reply(&value_error_program("v0")),
            reply(&value_error_program("v1")),
            reply(&value_error_program("v2")),
        ],
        |c| c.max_debug_iterations = 2,
    );
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Exhausted);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.runner_calls, 3);
    assert_eq!(report.code_generations, 3);
    assert_eq!(report.iteration, 2);
    assert_eq!(report.final_program, None);
    assert_eq!(report.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::ValueOrType));

    // Last attempted program and its excerpt are recorded as final.
    assert_eq!(
        h.read(Phase::Debug, Iteration::Final, ArtifactKind::ExtractedCode),
        value_error_program("v2")
    );
    let record = h.terminal_record(Phase::Debug);
    assert_eq!(record.kind, "value_or_type");
    assert_eq!(record.iteration, 2);
    assert_eq!(record.terminal_state, Resolution::Exhausted);
    assert!(record.excerpt.contains("ValueError: window must be positive"));

    let log = h.read(Phase::Debug, Iteration::Final, ArtifactKind::RunLog);
    assert!(log.starts_with("terminal_state: exhausted\n"));
}

#[test]
fn identical_repair_stops_without_running() {
    // The queue repeats its last reply, so the repair equals iteration 0.
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(&value_error_program("same"))]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Exhausted);
    assert_eq!(report.runner_calls, 1);
    assert_eq!(report.iteration, 1);
    assert!(h.has(Phase::Debug, Iteration::Attempt(1), ArtifactKind::ExtractedCode));
    assert!(!h.has(Phase::Debug, Iteration::Attempt(1), ArtifactKind::RunLog));
    assert_eq!(targets(&report).last(), Some(&LoopState::Exhausted));
}

#[test]
fn identical_repair_reruns_when_shortcut_disabled() {
    let h = harness_with(
        vec![ScriptedReply::text(RESEARCH), reply(&value_error_program("same"))],
        |c| {
            c.no_progress_shortcut = false;
            c.max_debug_iterations = 1;
        },
    );
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Exhausted);
    assert_eq!(report.runner_calls, 2);
}

#[test]
fn timeout_is_classified_and_fed_back() {
    let h = harness_with(
        vec![
            ScriptedReply::text(RESEARCH),
            reply("echo starting\nsleep 30\n"),
            reply(&good_program("fast")),
        ],
        |c| c.execution_timeout_seconds = 1,
    );
    let report = h.run(&sma_cross());

    let json = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::Outcome);
    let outcome: RunOutcome = serde_json::from_str(&json).unwrap();
    assert_eq!(outcome.status, RunStatus::Timeout);
    assert_eq!(outcome.exit_code, None);
    assert!(
        (1.0..3.0).contains(&outcome.wall_time),
        "wall time {}",
        outcome.wall_time
    );

    let repair = &h.provider.requests()[2].user_content;
    assert!(repair.contains("Kind: timeout"));
    assert!(repair.contains("timed out after"));
    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.iteration, 1);
}

#[test]
fn missing_dependency_is_sent_back_for_repair() {
    let missing = "echo 'Traceback (most recent call last):' >&2\n\
                   echo '  File \"bt.py\", line 3, in <module>' >&2\n\
                   echo \"ModuleNotFoundError: No module named 'talib'\" >&2\n\
                   exit 1\n";
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        reply(missing),
        reply(&good_program("no-talib")),
    ]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.terminal_phase, Phase::Debug);
    assert_eq!(report.iteration, 1);
    assert_eq!(report.runner_calls, 2);
    assert_eq!(report.abort_cause, None);

    let json = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::ErrorExcerpt);
    let error: strategen_core::domain::ClassifiedError = serde_json::from_str(&json).unwrap();
    assert_eq!(error.kind, ErrorKind::DependencyMissing);
    assert!(h.provider.requests()[2].user_content.contains("Kind: dependency_missing"));
}

#[test]
fn missing_data_file_aborts_without_repair() {
    let program = "data=\"/nonexistent/x.csv\"\n\
                   echo 'Traceback (most recent call last):' >&2\n\
                   echo '  File \"bt.py\", line 5, in <module>' >&2\n\
                   echo \"FileNotFoundError: [Errno 2] No such file or directory: '$data'\" >&2\n\
                   exit 1\n";
    let brief = StrategyBrief::new("SmaCross", "SMA cross", "/nonexistent/x.csv").unwrap();
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(program)]);
    let report = h.run(&brief);

    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.abort_cause, Some(AbortCause::DataMissing));
    assert_eq!(report.iteration, 0);
    assert_eq!(report.gateway_calls, 2);
    assert_eq!(h.provider.call_count(), 2);

    let record = h.terminal_record(Phase::Backtest);
    assert_eq!(record.kind, "data_missing");
    assert_eq!(record.terminal_state, Resolution::Aborted);
    assert!(record.program.is_some());
}

// ── Aborts ───────────────────────────────────────────────────────────

#[test]
fn research_gateway_failure_aborts_in_research() {
    let h = harness(vec![ScriptedReply::fail(GatewayErrorKind::QuotaOrAuth, "invalid x-api-key")]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.terminal_phase, Phase::Research);
    assert_eq!(report.runner_calls, 0);
    assert!(matches!(
        report.abort_cause,
        Some(AbortCause::Gateway { kind: GatewayErrorKind::QuotaOrAuth, .. })
    ));

    let record = h.terminal_record(Phase::Research);
    assert_eq!(record.kind, "quota_or_auth");
    assert!(record.program.is_none());
}

#[test]
fn debug_gateway_failure_keeps_last_program() {
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        reply(&value_error_program("v0")),
        ScriptedReply::fail(GatewayErrorKind::ProviderUnavailable, "connection refused"),
    ]);
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.terminal_phase, Phase::Debug);
    assert_eq!(report.runner_calls, 1);
    assert_eq!(
        h.read(Phase::Debug, Iteration::Final, ArtifactKind::ExtractedCode),
        value_error_program("v0")
    );
    let log = h.read(Phase::Debug, Iteration::Final, ArtifactKind::RunLog);
    assert!(log.starts_with("terminal_state: aborted\n"));
    assert!(log.contains("ValueError: window must be positive"));
}

#[test]
fn cancelled_before_start_aborts_without_calls() {
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(&good_program("v0"))]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = h.pipeline.run_strategy(&sma_cross(), &cancel).unwrap();

    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.abort_cause, Some(AbortCause::Cancelled));
    assert_eq!(report.gateway_calls, 0);
    assert_eq!(h.provider.call_count(), 0);
}

#[test]
fn cancel_during_run_kills_the_child_and_aborts() {
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        reply("echo started\nsleep 30\n"),
        reply(&good_program("never")),
    ]);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(500));
        trigger.cancel();
    });

    let clock = std::time::Instant::now();
    let report = h.pipeline.run_strategy(&sma_cross(), &cancel).unwrap();
    canceller.join().unwrap();

    assert!(clock.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.abort_cause, Some(AbortCause::Cancelled));
    assert_eq!(report.terminal_phase, Phase::Backtest);
    assert_eq!(report.runner_calls, 1);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(targets(&report).last(), Some(&LoopState::Aborted));
    assert!(h.has(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::RunLog));
    assert_eq!(h.terminal_record(Phase::Backtest).kind, "cancelled");
}

#[test]
fn missing_interpreter_aborts_as_launcher_error() {
    let h = harness_with(
        vec![ScriptedReply::text(RESEARCH), reply(&good_program("v0"))],
        |c| c.interpreter = "strategen-no-such-interpreter".into(),
    );
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Aborted);
    assert_eq!(report.abort_cause, Some(AbortCause::LauncherError));
    assert_eq!(report.gateway_calls, 2);
}

// ── Lint and extraction ──────────────────────────────────────────────

#[test]
fn forbidden_import_is_rejected_without_running() {
    let h = harness_with(
        vec![
            ScriptedReply::text(RESEARCH),
            reply("import requests\necho 'Return [%] 1.0'\n"),
            reply(&good_program("clean")),
        ],
        |c| c.classifier.forbidden_imports = vec!["requests".into()],
    );
    let report = h.run(&sma_cross());

    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.iteration, 1);
    assert_eq!(report.runner_calls, 1);
    assert_eq!(report.code_generations, 2);

    let json = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::ErrorExcerpt);
    assert!(json.contains("\"import\""));
    assert!(!h.has(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::Outcome));
}

#[test]
fn reply_without_code_counts_as_empty_output() {
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        ScriptedReply::text("I cannot write that program right now."),
        reply(&good_program("v1")),
    ]);
    let report = h.run(&sma_cross());

    let json = h.read(Phase::Backtest, Iteration::Attempt(0), ArtifactKind::ErrorExcerpt);
    assert!(json.contains("\"empty_output\""));
    assert_eq!(report.resolution, Resolution::Resolved);
    assert_eq!(report.runner_calls, 1);
}

// ── Store invariants ─────────────────────────────────────────────────

#[test]
fn artifacts_are_uniquely_keyed() {
    let h = harness(vec![
        ScriptedReply::text(RESEARCH),
        reply(&value_error_program("v0")),
        reply(&value_error_program("v1")),
        reply(&good_program("v2")),
    ]);
    h.run(&sma_cross());

    let keys = h.pipeline.store().list(&run_id(), &sma_cross().name).unwrap();
    let unique: HashSet<_> = keys.iter().map(|k| (k.phase, k.iteration, k.kind)).collect();
    assert_eq!(unique.len(), keys.len());
    assert!(keys.len() > 10);
    assert!(unique.contains(&(Phase::Debug, Iteration::Attempt(2), ArtifactKind::ExtractedCode)));
}

#[test]
fn each_run_appends_to_the_ledger() {
    let h = harness(vec![ScriptedReply::text(RESEARCH), reply(&good_program("v0"))]);
    h.run(&sma_cross());
    h.run(&sma_cross());

    let ledger = std::fs::read_to_string(h.pipeline.store().ledger_path(&run_id())).unwrap();
    let lines: Vec<serde_json::Value> = ledger
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["strategy"], "SmaCross");
    assert_eq!(lines[0]["resolution"], "resolved");
}

// ── Batches ──────────────────────────────────────────────────────────

#[test]
fn batch_runs_every_brief_in_parallel() {
    // Every call gets the same reply, so interleaving does not matter.
    let h = harness_with(vec![reply(&good_program("any"))], |c| c.parallelism = 2);
    let briefs = vec![
        StrategyBrief::new("SmaCross", "moving average cross", "/tmp/a.csv").unwrap(),
        StrategyBrief::new("Donchian", "55-day breakout", "/tmp/b.csv").unwrap(),
        StrategyBrief::new("Rsi2", "RSI(2) mean reversion", "/tmp/c.csv").unwrap(),
    ];

    let results = h.pipeline.run_batch(&briefs, &CancelToken::new()).unwrap();
    assert_eq!(results.len(), 3);
    for (brief, result) in briefs.iter().zip(&results) {
        let report = result.as_ref().unwrap();
        assert_eq!(report.strategy, brief.name);
        assert_eq!(report.resolution, Resolution::Resolved);
    }
    assert_eq!(h.provider.call_count(), 6);
}

#[test]
fn batch_rejects_duplicate_names() {
    let h = harness(vec![reply(&good_program("any"))]);
    let briefs = vec![sma_cross(), sma_cross()];
    let err = h.pipeline.run_batch(&briefs, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateStrategy(_)));
    assert_eq!(h.provider.call_count(), 0);
}

// ── Properties ───────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn iteration_budget_bounds_calls(max in 1u32..4, failures in 0usize..6) {
        let mut replies = vec![ScriptedReply::text(RESEARCH)];
        for i in 0..failures {
            replies.push(reply(&value_error_program(&format!("v{i}"))));
        }
        replies.push(reply(&good_program("ok")));
        let h = harness_with(replies, |c| c.max_debug_iterations = max);
        let report = h.run(&sma_cross());

        prop_assert!(report.code_generations <= max + 1);
        prop_assert!(report.runner_calls <= max + 1);
        let expected = if (failures as u32) <= max {
            Resolution::Resolved
        } else {
            Resolution::Exhausted
        };
        prop_assert_eq!(report.resolution, expected);
        prop_assert!(report.resolution.is_terminal());
    }
}
