//! Strategen CLI: research, write and debug backtests with an LLM.
//!
//! Commands:
//! - `run`: one strategy from a brief file or from flags
//! - `batch`: every strategy in a brief file, in parallel
//! - `models`: the model registry and which API keys are set
//!
//! Exit codes: 0 resolved, 2 exhausted, 3 aborted, 1 internal error. A
//! batch exits with the highest code among its strategies.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use strategen_core::domain::StrategyBrief;
use strategen_core::gateway::{ApiKeys, ProviderKind};
use strategen_core::CancelToken;
use strategen_runner::{load_briefs, Pipeline, PipelineConfig, StrategyReport};

const INTERNAL_ERROR: i32 = 1;

#[derive(Parser)]
#[command(
    name = "strategen",
    about = "Strategen: LLM-driven backtest generation with a debug loop"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Research, write and debug a backtest for one strategy.
    Run {
        /// Pipeline config (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Brief file holding a single strategy.
        #[arg(long, conflicts_with_all = ["name", "description", "data"])]
        brief: Option<PathBuf>,

        /// Strategy name, [A-Za-z0-9_]+.
        #[arg(long, required_unless_present = "brief", requires_all = ["description", "data"])]
        name: Option<String>,

        /// Free-text strategy description.
        #[arg(long)]
        description: Option<String>,

        /// OHLCV CSV the generated program reads.
        #[arg(long)]
        data: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run every strategy of a brief file.
    Batch {
        /// Pipeline config (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Brief file with `[[strategy]]` entries.
        briefs: PathBuf,

        /// Strategies run at once. Defaults to the config's `parallelism`.
        #[arg(long)]
        parallelism: Option<usize>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// List supported providers, their models and API key status.
    Models,
}

/// Flags shared by `run` and `batch`; all but `--json` override the config file.
#[derive(Args)]
struct Overrides {
    /// Artifact store root.
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Debug iteration budget.
    #[arg(long)]
    max_debug_iterations: Option<u32>,

    /// Wall-clock cap per program run, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Model for every phase, `provider:model` or a bare model name.
    #[arg(long)]
    model: Option<String>,

    /// Print each strategy report as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(root) = &self.artifact_root {
            config.artifact_root = root.clone();
        }
        if let Some(n) = self.max_debug_iterations {
            config.max_debug_iterations = n;
        }
        if let Some(secs) = self.timeout {
            config.execution_timeout_seconds = secs;
        }
        if let Some(model) = &self.model {
            config.model_name = model.clone();
            config.research_model = Some(model.clone());
            config.backtest_model = Some(model.clone());
            config.debug_model = Some(model.clone());
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            INTERNAL_ERROR
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            brief,
            name,
            description,
            data,
            overrides,
        } => {
            let brief = match brief {
                Some(path) => single_brief(&path)?,
                None => flag_brief(name, description, data)?,
            };
            run_one(&config, &overrides, &brief)
        }
        Commands::Batch {
            config,
            briefs,
            parallelism,
            overrides,
        } => run_batch(&config, &overrides, &briefs, parallelism),
        Commands::Models => {
            list_models();
            Ok(0)
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

fn load_config(path: &Path, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_file(path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let keys = ApiKeys::from_env();
    let pipeline = Pipeline::from_config(config, &keys)?;
    info!(
        root = %pipeline.store().root().display(),
        run_id = %pipeline.run_id(),
        "pipeline ready"
    );
    Ok(pipeline)
}

fn run_one(config_path: &Path, overrides: &Overrides, brief: &StrategyBrief) -> Result<i32> {
    let config = load_config(config_path, overrides)?;
    let pipeline = build_pipeline(&config)?;
    let cancel = CancelToken::new();
    interrupt::install(cancel.clone());

    let report = pipeline.run_strategy(brief, &cancel)?;
    print_report(&report, overrides.json)?;
    Ok(report.exit_code())
}

fn run_batch(
    config_path: &Path,
    overrides: &Overrides,
    briefs_path: &Path,
    parallelism: Option<usize>,
) -> Result<i32> {
    let mut config = load_config(config_path, overrides)?;
    if let Some(n) = parallelism {
        config.parallelism = n;
        config.validate()?;
    }
    let briefs = load_briefs(briefs_path)?;
    let pipeline = build_pipeline(&config)?;
    let cancel = CancelToken::new();
    interrupt::install(cancel.clone());

    let mut worst = 0;
    for (brief, result) in briefs.iter().zip(pipeline.run_batch(&briefs, &cancel)?) {
        let code = match result {
            Ok(report) => {
                print_report(&report, overrides.json)?;
                report.exit_code()
            }
            Err(e) => {
                error!(strategy = %brief.name, error = %e, "strategy failed");
                eprintln!("{}: internal error: {e}", brief.name);
                INTERNAL_ERROR
            }
        };
        worst = worst.max(code);
    }
    Ok(worst)
}

fn list_models() {
    let keys = ApiKeys::from_env();
    for provider in ProviderKind::ALL {
        let key = match provider.key_var() {
            Some(var) if keys.get(provider).is_some() => format!("{var} set"),
            Some(var) => format!("{var} not set"),
            None => "no key needed".to_string(),
        };
        println!("{provider} ({key})");
        for model in provider.known_models() {
            println!("  {provider}:{model}");
        }
    }
}

// ── Briefs ───────────────────────────────────────────────────────────

fn single_brief(path: &Path) -> Result<StrategyBrief> {
    let mut briefs = load_briefs(path)?;
    if briefs.len() != 1 {
        bail!(
            "{} holds {} strategies; use `strategen batch` for more than one",
            path.display(),
            briefs.len()
        );
    }
    Ok(briefs.remove(0))
}

fn flag_brief(
    name: Option<String>,
    description: Option<String>,
    data: Option<PathBuf>,
) -> Result<StrategyBrief> {
    let (Some(name), Some(description), Some(data)) = (name, description, data) else {
        bail!("either --brief or all of --name, --description and --data are required");
    };
    let data = if data.is_relative() {
        std::env::current_dir()
            .context("cannot resolve relative --data path")?
            .join(data)
    } else {
        data
    };
    Ok(StrategyBrief::new(&name, description, data)?)
}

// ── Output ───────────────────────────────────────────────────────────

fn print_report(report: &StrategyReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!(
        "{}: {} in {} at iteration {} ({} generations, {} runs)",
        report.strategy,
        report.resolution,
        report.terminal_phase,
        report.iteration,
        report.code_generations,
        report.runner_calls
    );
    if let Some(path) = &report.final_program {
        println!("  program: {}", path.display());
    }
    if let Some(cause) = &report.abort_cause {
        println!("  aborted: {cause}");
    } else if let (false, Some(err)) = (report.is_resolved(), &report.last_error) {
        let last = err.excerpt.lines().last().unwrap_or("");
        println!("  last error: {} {}", err.kind, last.trim());
    }
    Ok(())
}

// ── Interrupts ───────────────────────────────────────────────────────

#[cfg(unix)]
mod interrupt {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use strategen_core::CancelToken;
    use tracing::warn;

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
        // SAFETY: restoring the default disposition is async-signal-safe, so
        // a second Ctrl-C terminates immediately.
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
        }
    }

    /// Route SIGINT to `token`. Running children are killed by the sandbox
    /// and each strategy aborts at its next classify step.
    pub fn install(token: CancelToken) {
        // SAFETY: the handler only touches an atomic and calls signal(2).
        unsafe {
            libc::signal(
                libc::SIGINT,
                on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }

        let spawned = thread::Builder::new()
            .name("sigint-watch".into())
            .spawn(move || loop {
                if INTERRUPTED.load(Ordering::SeqCst) {
                    warn!("interrupt received; cancelling");
                    token.cancel();
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            });
        if let Err(e) = spawned {
            warn!(error = %e, "cannot watch for interrupts; Ctrl-C will not cancel cleanly");
        }
    }
}

#[cfg(not(unix))]
mod interrupt {
    use strategen_core::CancelToken;

    pub fn install(_token: CancelToken) {}
}
