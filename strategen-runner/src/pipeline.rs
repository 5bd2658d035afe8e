//! Pipeline controller: research → backtest → debug for one strategy, and
//! batches of strategies across a rayon pool.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use strategen_core::domain::{
    ArtifactKind, BriefError, ClassifiedError, DebugState, Iteration, Phase, Resolution, RunId,
    StrategyBrief, StrategyName,
};
use strategen_core::gateway::{ApiKeys, Gateway, GatewayError, ModelSelector};
use strategen_core::{CancelToken, Classifier, ImportPolicy, SandboxRunner};

use crate::config::{ConfigError, PipelineConfig};
use crate::debug_loop::{
    attempt, AbortCause, AttemptEnd, DebugIterator, GenerationSettings, LoopContext, LoopEnd,
    LoopState, Tracker, Transition,
};
use crate::prompts::{self, PromptSet};
use crate::records::{stamp_run_log, TerminalRecord};
use crate::store::{ArtifactStore, StoreError};

// ── Errors ───────────────────────────────────────────────────────────

/// Failures that stop the pipeline itself, as opposed to a strategy ending
/// `exhausted` or `aborted`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot set up {phase} model {model}: {source}")]
    GatewaySetup {
        phase: Phase,
        model: ModelSelector,
        #[source]
        source: GatewayError,
    },

    #[error("no API key found; set one of {0}")]
    NoApiKeys(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Brief(#[from] BriefError),

    #[error("strategy '{0}' appears more than once in the batch")]
    DuplicateStrategy(StrategyName),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}

// ── Gateways ─────────────────────────────────────────────────────────

/// One gateway per phase. Phases selecting the same model share one
/// gateway, and with it the request pacer.
#[derive(Debug, Clone)]
pub struct PhaseGateways {
    pub research: Arc<Gateway>,
    pub backtest: Arc<Gateway>,
    pub debug: Arc<Gateway>,
}

impl PhaseGateways {
    /// Every phase through the same gateway.
    pub fn shared(gateway: Gateway) -> Self {
        let gateway = Arc::new(gateway);
        Self {
            research: Arc::clone(&gateway),
            backtest: Arc::clone(&gateway),
            debug: gateway,
        }
    }

    /// Connect the configured model of each phase.
    pub fn connect(config: &PipelineConfig, keys: &ApiKeys) -> Result<Self, PipelineError> {
        let settings = config.gateway_settings();
        let selectors = Phase::ALL.map(|phase| config.model_for(phase).map(|s| (phase, s)));
        let mut checked = Vec::with_capacity(selectors.len());
        for selector in selectors {
            checked.push(selector?);
        }

        if keys.is_empty() && checked.iter().any(|(_, s)| s.provider.requires_key()) {
            let mut vars: Vec<&str> = checked
                .iter()
                .filter_map(|(_, s)| s.provider.key_var())
                .collect();
            vars.sort_unstable();
            vars.dedup();
            return Err(PipelineError::NoApiKeys(vars.join(", ")));
        }

        let mut connected: HashMap<ModelSelector, Arc<Gateway>> = HashMap::new();
        let mut gateway_for = |phase: Phase| -> Result<Arc<Gateway>, PipelineError> {
            let selector = config.model_for(phase)?;
            if let Some(gateway) = connected.get(&selector) {
                return Ok(Arc::clone(gateway));
            }
            let gateway = Gateway::connect(&selector, keys, &settings).map_err(|source| {
                PipelineError::GatewaySetup {
                    phase,
                    model: selector.clone(),
                    source,
                }
            })?;
            info!(%phase, model = %gateway.describe(), "gateway ready");
            let gateway = Arc::new(gateway);
            connected.insert(selector, Arc::clone(&gateway));
            Ok(gateway)
        };

        Ok(Self {
            research: gateway_for(Phase::Research)?,
            backtest: gateway_for(Phase::Backtest)?,
            debug: gateway_for(Phase::Debug)?,
        })
    }

    pub fn for_phase(&self, phase: Phase) -> &Gateway {
        match phase {
            Phase::Research => &self.research,
            Phase::Backtest => &self.backtest,
            Phase::Debug => &self.debug,
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────

/// Summary of one strategy run. Also appended to the run ledger.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyReport {
    pub strategy: StrategyName,
    pub run_id: RunId,
    pub resolution: Resolution,
    pub terminal_phase: Phase,
    /// Iteration the run ended at.
    pub iteration: u32,
    /// Gateway calls across all phases, research included.
    pub gateway_calls: u32,
    /// Gateway calls that asked for code (backtest and debug).
    pub code_generations: u32,
    pub runner_calls: u32,
    /// Promoted program, for resolved runs only.
    pub final_program: Option<PathBuf>,
    pub last_error: Option<ClassifiedError>,
    pub abort_cause: Option<AbortCause>,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl StrategyReport {
    pub fn exit_code(&self) -> i32 {
        self.resolution.exit_code()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution == Resolution::Resolved
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

pub struct Pipeline {
    gateways: PhaseGateways,
    runner: SandboxRunner,
    classifier: Classifier,
    policy: ImportPolicy,
    store: ArtifactStore,
    prompts: PromptSet,
    generation: GenerationSettings,
    parallelism: usize,
    run_id: RunId,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, gateways: PhaseGateways) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            gateways,
            runner: config.sandbox_runner(),
            classifier: Classifier::new(config.classifier.rules()),
            policy: config.classifier.import_policy(),
            store: ArtifactStore::new(&config.artifact_root),
            prompts: PromptSet::load(&config.prompts)?,
            generation: GenerationSettings {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                max_debug_iterations: config.max_debug_iterations,
                no_progress_shortcut: config.no_progress_shortcut,
            },
            parallelism: config.parallelism,
            run_id: RunId::today(),
        })
    }

    /// Pipeline with gateways connected per the config.
    pub fn from_config(config: &PipelineConfig, keys: &ApiKeys) -> Result<Self, PipelineError> {
        config.validate()?;
        let gateways = PhaseGateways::connect(config, keys)?;
        Self::new(config, gateways)
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Run all three phases for one brief.
    ///
    /// Every outcome of the loop is a report; `Err` means the store failed
    /// and nothing more could be recorded.
    pub fn run_strategy(
        &self,
        brief: &StrategyBrief,
        cancel: &CancelToken,
    ) -> Result<StrategyReport, PipelineError> {
        brief.validate()?;
        let started_at = Utc::now();
        info!(strategy = %brief.name, run_id = %self.run_id, "strategy started");

        let ctx = LoopContext {
            store: &self.store,
            runner: &self.runner,
            classifier: &self.classifier,
            policy: &self.policy,
            prompts: &self.prompts,
            generation: self.generation,
            run_id: &self.run_id,
            brief,
            cancel,
        };
        let mut tracker = Tracker::new(brief.name.as_str());

        let (end, state) = match self.research(&ctx, &mut tracker)? {
            Err(cause) => (
                LoopEnd {
                    resolution: Resolution::Aborted,
                    abort: Some(cause),
                    phase: Phase::Research,
                    iteration: 0,
                },
                None,
            ),
            Ok(research) => self.backtest_and_debug(&ctx, &mut tracker, &research)?,
        };

        let final_program = self.close(&ctx, &tracker, &end, state.as_ref())?;
        let report = StrategyReport {
            strategy: brief.name.clone(),
            run_id: self.run_id.clone(),
            resolution: end.resolution,
            terminal_phase: end.phase,
            iteration: end.iteration,
            gateway_calls: tracker.gateway_calls,
            code_generations: tracker.code_generations,
            runner_calls: tracker.runner_calls,
            final_program,
            last_error: state.and_then(|s| s.last_error),
            abort_cause: end.abort,
            transitions: tracker.transitions,
            started_at,
            ended_at: Utc::now(),
        };
        self.store.append_ledger(&self.run_id, &report)?;

        info!(
            strategy = %report.strategy,
            resolution = %report.resolution,
            phase = %report.terminal_phase,
            iteration = report.iteration,
            runner_calls = report.runner_calls,
            "strategy finished"
        );
        Ok(report)
    }

    /// Run every brief on a pool of `parallelism` threads. The outer error
    /// rejects the batch before anything runs; inner results are per brief,
    /// in input order.
    pub fn run_batch(
        &self,
        briefs: &[StrategyBrief],
        cancel: &CancelToken,
    ) -> Result<Vec<Result<StrategyReport, PipelineError>>, PipelineError> {
        let mut seen = HashSet::new();
        for brief in briefs {
            if !seen.insert(&brief.name) {
                return Err(PipelineError::DuplicateStrategy(brief.name.clone()));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism.max(1))
            .thread_name(|i| format!("strategen-{i}"))
            .build()
            .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;

        info!(strategies = briefs.len(), threads = pool.current_num_threads(), "batch started");
        Ok(pool.install(|| {
            briefs
                .par_iter()
                .map(|brief| self.run_strategy(brief, cancel))
                .collect()
        }))
    }

    // ── Phases ──

    /// Research phase. `Ok(Err(cause))` ends the strategy aborted.
    fn research(
        &self,
        ctx: &LoopContext<'_>,
        tracker: &mut Tracker,
    ) -> Result<Result<String, AbortCause>, StoreError> {
        let phase = Phase::Research;
        if ctx.cancel.is_cancelled() {
            tracker.transition(phase, 0, LoopState::Aborted);
            return Ok(Err(AbortCause::Cancelled));
        }

        let system = self.prompts.system(phase);
        let user = prompts::research_request(ctx.brief);
        let first = Iteration::Attempt(0);
        self.store.put(
            &ctx.key(phase, first, ArtifactKind::Prompt),
            format!("# System\n\n{}\n\n# User\n\n{}", system.trim_end(), user).as_bytes(),
        )?;

        tracker.gateway_calls += 1;
        let gateway = self.gateways.for_phase(phase);
        let completion = gateway.generate(
            system,
            &user,
            self.generation.temperature,
            self.generation.max_tokens,
        );
        let research = match completion {
            Ok(c) => c.content,
            Err(e) => {
                warn!(strategy = %ctx.brief.name, error = %e, "research failed");
                tracker.transition(phase, 0, LoopState::Aborted);
                return Ok(Err(AbortCause::Gateway {
                    kind: e.kind(),
                    message: e.to_string(),
                }));
            }
        };
        if ctx.cancel.is_cancelled() {
            tracker.transition(phase, 0, LoopState::Aborted);
            return Ok(Err(AbortCause::Cancelled));
        }

        let key = ctx.key(phase, first, ArtifactKind::RawResponse);
        self.store.put(&key, research.as_bytes())?;
        self.store.promote(&key)?;
        Ok(Ok(research))
    }

    /// Backtest attempt at iteration 0, then debug repairs if it failed.
    fn backtest_and_debug(
        &self,
        ctx: &LoopContext<'_>,
        tracker: &mut Tracker,
        research: &str,
    ) -> Result<(LoopEnd, Option<DebugState>), StoreError> {
        let request = prompts::backtest_request(ctx.brief, research);
        let first = attempt(
            ctx,
            &self.gateways.backtest,
            tracker,
            Phase::Backtest,
            0,
            &request,
            None,
        )?;

        let (program, outcome, verdict) = match first {
            AttemptEnd::Classified { program, outcome, verdict } => (program, outcome, verdict),
            AttemptEnd::Aborted(cause) => {
                let end = LoopEnd {
                    resolution: Resolution::Aborted,
                    abort: Some(cause),
                    phase: Phase::Backtest,
                    iteration: 0,
                };
                return Ok((end, None));
            }
            // Needs a previous program, which iteration 0 never has.
            AttemptEnd::NoProgress(program) => {
                let end = LoopEnd {
                    resolution: Resolution::Exhausted,
                    abort: None,
                    phase: Phase::Backtest,
                    iteration: 0,
                };
                let state = DebugState::new(program, self.generation.max_debug_iterations);
                return Ok((end, Some(state)));
            }
        };

        let mut state = DebugState::new(program, self.generation.max_debug_iterations);
        state.last_outcome = outcome;
        state.last_error = verdict.error().cloned();

        let end = DebugIterator::new(ctx, &self.gateways.debug, tracker).run(&mut state)?;
        Ok((end, Some(state)))
    }

    /// Write the phase-final artifacts. Returns the promoted program of a
    /// resolved run.
    fn close(
        &self,
        ctx: &LoopContext<'_>,
        tracker: &Tracker,
        end: &LoopEnd,
        state: Option<&DebugState>,
    ) -> Result<Option<PathBuf>, StoreError> {
        let last_log = tracker.last_run_log.as_ref();
        let program = state
            .map(|s| &s.current_program)
            .filter(|p| !p.entrypoint.as_os_str().is_empty());

        if end.resolution == Resolution::Resolved {
            let Some(program) = program else {
                return Ok(None);
            };
            let path = self.store.put(
                &ctx.key(end.phase, Iteration::Final, ArtifactKind::ExtractedCode),
                program.source.as_bytes(),
            )?;
            if let Some(log) = last_log {
                self.store.promote(log)?;
            }
            return Ok(Some(path));
        }

        let program_path = match program {
            Some(p) => Some(self.store.put(
                &ctx.key(end.phase, Iteration::Final, ArtifactKind::ExtractedCode),
                p.source.as_bytes(),
            )?),
            None => None,
        };

        let last_error = state.and_then(|s| s.last_error.as_ref());
        let record = match (&end.abort, last_error) {
            (Some(cause @ (AbortCause::Gateway { .. } | AbortCause::Cancelled)), _) | (Some(cause), None) => {
                TerminalRecord {
                    kind: cause.kind().to_string(),
                    excerpt: match cause {
                        AbortCause::Gateway { message, .. } => message.clone(),
                        other => other.to_string(),
                    },
                    hint: None,
                    iteration: end.iteration,
                    terminal_state: end.resolution,
                    phase: end.phase,
                    program: program_path.clone(),
                }
            }
            (_, Some(error)) => TerminalRecord::from_error(
                error,
                end.iteration,
                end.resolution,
                end.phase,
                program_path.clone(),
            ),
            (None, None) => TerminalRecord {
                kind: end.resolution.as_str().to_string(),
                excerpt: String::new(),
                hint: None,
                iteration: end.iteration,
                terminal_state: end.resolution,
                phase: end.phase,
                program: program_path.clone(),
            },
        };
        self.store.put_json(
            &ctx.key(end.phase, Iteration::Final, ArtifactKind::ErrorExcerpt),
            &record,
        )?;

        let previous_log = match last_log {
            Some(key) => Some(self.store.get_string(key)?),
            None => None,
        };
        let reason = match &end.abort {
            Some(cause) => cause.to_string(),
            None if record.excerpt.is_empty() => record.kind.clone(),
            None => format!("{}: {}", record.kind, last_line(&record.excerpt)),
        };
        self.store.put(
            &ctx.key(end.phase, Iteration::Final, ArtifactKind::RunLog),
            stamp_run_log(end.resolution, &reason, previous_log.as_deref()).as_bytes(),
        )?;

        warn!(
            strategy = %ctx.brief.name,
            resolution = %end.resolution,
            kind = %record.kind,
            "strategy did not resolve"
        );
        Ok(None)
    }
}

/// Last non-blank line, usually the exception line of an excerpt.
fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}
