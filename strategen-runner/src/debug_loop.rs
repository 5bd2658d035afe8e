//! Debug iterator: generate → extract → run → classify, repeated until the
//! program passes or the budget runs out.
//!
//! The backtest phase performs iteration 0 with [`attempt`]; when it fails,
//! [`DebugIterator`] resumes at the classify step with the carried
//! [`DebugState`] and drives iterations `1..=max_iterations`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use strategen_core::domain::{
    ArtifactKey, ArtifactKind, ClassifiedError, DebugState, ErrorKind, Iteration, Phase,
    Program, Resolution, RunId, RunOutcome, RunStatus, StrategyBrief,
};
use strategen_core::gateway::{Gateway, GatewayErrorKind};
use strategen_core::{extract, CancelToken, Classifier, ImportPolicy, SandboxRunner, Verdict};

use crate::prompts::{self, PromptSet};
use crate::records::{render_run_log, LogHeader};
use crate::store::{ArtifactStore, StoreError};

// ── States and transitions ───────────────────────────────────────────

/// Debug iterator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Generating,
    Extracting,
    Running,
    Classifying,
    Resolved,
    Exhausted,
    Aborted,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Generating => "generating",
            LoopState::Extracting => "extracting",
            LoopState::Running => "running",
            LoopState::Classifying => "classifying",
            LoopState::Resolved => "resolved",
            LoopState::Exhausted => "exhausted",
            LoopState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Resolved | LoopState::Exhausted | LoopState::Aborted)
    }

    pub fn resolution(self) -> Resolution {
        match self {
            LoopState::Resolved => Resolution::Resolved,
            LoopState::Exhausted => Resolution::Exhausted,
            LoopState::Aborted => Resolution::Aborted,
            _ => Resolution::Pending,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub phase: Phase,
    pub iteration: u32,
    pub from: LoopState,
    pub to: LoopState,
}

/// Why a run ended `aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortCause {
    Gateway { kind: GatewayErrorKind, message: String },
    Cancelled,
    LauncherError,
    DataMissing,
}

impl AbortCause {
    /// Kind string used in terminal records.
    pub fn kind(&self) -> &'static str {
        match self {
            AbortCause::Gateway { kind, .. } => kind.as_str(),
            AbortCause::Cancelled => "cancelled",
            AbortCause::LauncherError => "launcher_error",
            AbortCause::DataMissing => ErrorKind::DataMissing.as_str(),
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Gateway { kind, message } => write!(f, "gateway {kind}: {message}"),
            AbortCause::Cancelled => f.write_str("cancelled by operator"),
            AbortCause::LauncherError => f.write_str("interpreter could not be launched"),
            AbortCause::DataMissing => f.write_str("data file missing"),
        }
    }
}

/// State-machine bookkeeping for one strategy: current state, recorded
/// transitions and call counters.
#[derive(Debug)]
pub(crate) struct Tracker {
    strategy: String,
    state: LoopState,
    pub transitions: Vec<Transition>,
    pub gateway_calls: u32,
    pub code_generations: u32,
    pub runner_calls: u32,
    /// Key of the most recent run log written.
    pub last_run_log: Option<ArtifactKey>,
}

impl Tracker {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            state: LoopState::Generating,
            transitions: Vec::new(),
            gateway_calls: 0,
            code_generations: 0,
            runner_calls: 0,
            last_run_log: None,
        }
    }

    pub fn transition(&mut self, phase: Phase, iteration: u32, to: LoopState) {
        let from = self.state;
        info!(
            target: "strategen::loop",
            strategy = %self.strategy,
            phase = %phase,
            iteration,
            from = %from,
            to = %to,
            "transition"
        );
        self.transitions.push(Transition {
            phase,
            iteration,
            from,
            to,
        });
        self.state = to;
    }
}

// ── Attempts ─────────────────────────────────────────────────────────

/// Generation parameters shared by every attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_debug_iterations: u32,
    pub no_progress_shortcut: bool,
}

/// Borrowed services one strategy run works with.
pub(crate) struct LoopContext<'a> {
    pub store: &'a ArtifactStore,
    pub runner: &'a SandboxRunner,
    pub classifier: &'a Classifier,
    pub policy: &'a ImportPolicy,
    pub prompts: &'a PromptSet,
    pub generation: GenerationSettings,
    pub run_id: &'a RunId,
    pub brief: &'a StrategyBrief,
    pub cancel: &'a CancelToken,
}

impl LoopContext<'_> {
    pub fn key(&self, phase: Phase, iteration: Iteration, kind: ArtifactKind) -> ArtifactKey {
        ArtifactKey::new(
            self.run_id.clone(),
            self.brief.name.clone(),
            phase,
            iteration,
            kind,
        )
    }
}

/// How one attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptEnd {
    /// Ran (or deliberately skipped running) and was classified.
    Classified {
        program: Program,
        outcome: Option<RunOutcome>,
        verdict: Verdict,
    },
    /// The repair reproduced the previous program byte for byte.
    NoProgress(Program),
    Aborted(AbortCause),
}

/// Render a prompt artifact.
fn prompt_document(system: &str, user: &str) -> String {
    format!("# System\n\n{}\n\n# User\n\n{}", system.trim_end(), user)
}

/// One generate → extract → run → classify pass, with every intermediate
/// artifact persisted before it returns.
pub(crate) fn attempt(
    ctx: &LoopContext<'_>,
    gateway: &Gateway,
    tracker: &mut Tracker,
    phase: Phase,
    iteration: u32,
    user_content: &str,
    previous: Option<&Program>,
) -> Result<AttemptEnd, StoreError> {
    let slot = Iteration::Attempt(iteration);
    let system = ctx.prompts.system(phase);

    if ctx.cancel.is_cancelled() {
        tracker.transition(phase, iteration, LoopState::Aborted);
        return Ok(AttemptEnd::Aborted(AbortCause::Cancelled));
    }

    ctx.store.put(
        &ctx.key(phase, slot, ArtifactKind::Prompt),
        prompt_document(system, user_content).as_bytes(),
    )?;

    tracker.gateway_calls += 1;
    tracker.code_generations += 1;
    let completion = gateway.generate(
        system,
        user_content,
        ctx.generation.temperature,
        ctx.generation.max_tokens,
    );
    let completion = match completion {
        Ok(c) => c,
        Err(e) => {
            warn!(strategy = %ctx.brief.name, %phase, iteration, error = %e, "generation failed");
            tracker.transition(phase, iteration, LoopState::Aborted);
            return Ok(AttemptEnd::Aborted(AbortCause::Gateway {
                kind: e.kind(),
                message: e.to_string(),
            }));
        }
    };
    if ctx.cancel.is_cancelled() {
        tracker.transition(phase, iteration, LoopState::Aborted);
        return Ok(AttemptEnd::Aborted(AbortCause::Cancelled));
    }

    ctx.store.put(
        &ctx.key(phase, slot, ArtifactKind::RawResponse),
        completion.content.as_bytes(),
    )?;
    tracker.transition(phase, iteration, LoopState::Extracting);

    let extraction = extract(&completion.content);
    let code_key = ctx.key(phase, slot, ArtifactKind::ExtractedCode);
    let entrypoint = ctx.store.put(&code_key, extraction.source.as_bytes())?;
    let program = Program::new(
        extraction.source,
        entrypoint,
        previous.map(|_| iteration.saturating_sub(1)),
    );
    tracing::debug!(
        strategy = %ctx.brief.name,
        iteration,
        method = %extraction.method,
        digest = %program.digest(),
        "program extracted"
    );

    if ctx.generation.no_progress_shortcut && previous.is_some_and(|p| p.same_source(&program)) {
        warn!(strategy = %ctx.brief.name, iteration, "repair returned the previous program unchanged");
        tracker.transition(phase, iteration, LoopState::Exhausted);
        return Ok(AttemptEnd::NoProgress(program));
    }
    tracker.transition(phase, iteration, LoopState::Running);

    let header = LogHeader {
        strategy: &ctx.brief.name,
        phase,
        iteration,
        command: None,
    };
    let (outcome, verdict, log) = if program.is_empty() {
        let error = ClassifiedError::new(ErrorKind::EmptyOutput, "no program could be extracted from the response")
            .with_hint("reply with a single fenced python block");
        let log = render_run_log(&header, None, Some("extracted program is empty"));
        (None, Verdict::Failed(error), log)
    } else if let Some(violation) = ctx.policy.check(&program.source) {
        let note = format!("rejected by import policy: {}", violation.module);
        let log = render_run_log(&header, None, Some(&note));
        (None, Verdict::Failed(violation.to_classified()), log)
    } else {
        tracker.runner_calls += 1;
        let command = ctx.runner.command(&program.entrypoint);
        let outcome = ctx.runner.execute(&command, ctx.cancel);
        let verdict = ctx.classifier.classify(&outcome, &program.source);
        let header = LogHeader {
            command: Some(command.display()),
            ..header
        };
        let log = render_run_log(&header, Some(&outcome), None);
        (Some(outcome), verdict, log)
    };

    let log_key = ctx.key(phase, slot, ArtifactKind::RunLog);
    ctx.store.put(&log_key, log.as_bytes())?;
    tracker.last_run_log = Some(log_key);
    if let Some(outcome) = &outcome {
        ctx.store.put_json(&ctx.key(phase, slot, ArtifactKind::Outcome), outcome)?;
    }
    if let Verdict::Failed(error) = &verdict {
        ctx.store.put_json(&ctx.key(phase, slot, ArtifactKind::ErrorExcerpt), error)?;
    }
    tracker.transition(phase, iteration, LoopState::Classifying);

    Ok(AttemptEnd::Classified {
        program,
        outcome,
        verdict,
    })
}

// ── Iterator ─────────────────────────────────────────────────────────

/// Where and how a strategy's loop ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LoopEnd {
    pub resolution: Resolution,
    pub abort: Option<AbortCause>,
    pub phase: Phase,
    pub iteration: u32,
}

/// Phase an iteration number belongs to.
pub(crate) fn phase_of(iteration: u32) -> Phase {
    if iteration == 0 {
        Phase::Backtest
    } else {
        Phase::Debug
    }
}

/// Decision taken at the classify step.
enum Step {
    Stop(LoopEnd),
    Repair(ClassifiedError),
}

/// Drives a failed backtest attempt through debug repairs.
pub(crate) struct DebugIterator<'c, 'a> {
    ctx: &'c LoopContext<'a>,
    gateway: &'c Gateway,
    tracker: &'c mut Tracker,
}

impl<'c, 'a> DebugIterator<'c, 'a> {
    pub fn new(ctx: &'c LoopContext<'a>, gateway: &'c Gateway, tracker: &'c mut Tracker) -> Self {
        Self { ctx, gateway, tracker }
    }

    /// Drive `state` (sitting at the classify step of its current
    /// iteration) to a terminal resolution.
    pub fn run(mut self, state: &mut DebugState) -> Result<LoopEnd, StoreError> {
        loop {
            let error = match self.decide(state) {
                Step::Stop(end) => {
                    state.resolution = end.resolution;
                    return Ok(end);
                }
                Step::Repair(error) => error,
            };

            let iteration = state.iteration + 1;
            self.tracker.transition(Phase::Debug, iteration, LoopState::Generating);
            let request = prompts::debug_request(
                self.ctx.brief,
                &state.current_program,
                &error,
                state.iteration,
            );

            let end = attempt(
                self.ctx,
                self.gateway,
                self.tracker,
                Phase::Debug,
                iteration,
                &request,
                Some(&state.current_program),
            )?;

            match end {
                AttemptEnd::Aborted(cause) => {
                    state.resolution = Resolution::Aborted;
                    return Ok(LoopEnd {
                        resolution: Resolution::Aborted,
                        abort: Some(cause),
                        phase: Phase::Debug,
                        iteration,
                    });
                }
                AttemptEnd::NoProgress(program) => {
                    state.iteration = iteration;
                    state.current_program = program;
                    state.resolution = Resolution::Exhausted;
                    return Ok(LoopEnd {
                        resolution: Resolution::Exhausted,
                        abort: None,
                        phase: Phase::Debug,
                        iteration,
                    });
                }
                AttemptEnd::Classified { program, outcome, verdict } => {
                    state.iteration = iteration;
                    state.current_program = program;
                    state.last_outcome = outcome;
                    state.last_error = match verdict {
                        Verdict::Passed => None,
                        Verdict::Failed(e) => Some(e),
                    };
                }
            }
        }
    }

    fn decide(&mut self, state: &DebugState) -> Step {
        let iteration = state.iteration;
        let phase = phase_of(iteration);
        let stop = |tracker: &mut Tracker, to: LoopState, abort: Option<AbortCause>| {
            tracker.transition(phase, iteration, to);
            Step::Stop(LoopEnd {
                resolution: to.resolution(),
                abort,
                phase,
                iteration,
            })
        };

        let cancelled = self.ctx.cancel.is_cancelled()
            || state.last_outcome.as_ref().is_some_and(|o| o.cancelled);
        if cancelled {
            return stop(&mut *self.tracker, LoopState::Aborted, Some(AbortCause::Cancelled));
        }

        let Some(error) = state.last_error.clone() else {
            return stop(&mut *self.tracker, LoopState::Resolved, None);
        };

        let launcher_failed = state
            .last_outcome
            .as_ref()
            .is_some_and(|o| o.status == RunStatus::LauncherError);
        if launcher_failed {
            return stop(&mut *self.tracker, LoopState::Aborted, Some(AbortCause::LauncherError));
        }
        if error.kind == ErrorKind::DataMissing {
            return stop(&mut *self.tracker, LoopState::Aborted, Some(AbortCause::DataMissing));
        }
        if state.budget_spent() {
            return stop(&mut *self.tracker, LoopState::Exhausted, None);
        }
        Step::Repair(error)
    }
}
