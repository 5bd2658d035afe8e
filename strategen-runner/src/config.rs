//! Pipeline configuration.
//!
//! One record, parsed from TOML at startup and handed to every component.
//! Nothing below the CLI reads the environment except `ApiKeys::from_env`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use strategen_core::domain::Phase;
use strategen_core::gateway::{GatewaySettings, ModelSelector, ProviderKind};
use strategen_core::{ClassifierRules, ImportPolicy, Launcher, SandboxRunner};

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("execution_timeout_seconds must be positive")]
    ZeroTimeout,

    #[error("max_debug_iterations must be at least 1")]
    ZeroIterations,

    #[error("temperature {0} outside [0, 2]")]
    Temperature(f32),

    #[error("max_tokens must be positive")]
    ZeroMaxTokens,

    #[error("parallelism must be at least 1")]
    ZeroParallelism,

    #[error("unknown model provider '{0}'")]
    UnknownProvider(String),

    #[error("invalid {phase} model: {reason}")]
    BadModel { phase: Phase, reason: String },

    #[error("failed to read {phase} prompt {path}: {source}")]
    PromptFile {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Config types ─────────────────────────────────────────────────────

/// Everything a pipeline run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub artifact_root: PathBuf,
    pub interpreter: String,
    /// Conda environment to launch the interpreter in.
    pub interpreter_env: Option<String>,
    pub execution_timeout_seconds: u64,
    pub kill_grace_seconds: u64,
    pub max_debug_iterations: u32,
    pub model_provider: String,
    pub model_name: String,
    /// Per-phase overrides, `provider:model` or a bare model name.
    pub research_model: Option<String>,
    pub backtest_model: Option<String>,
    pub debug_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,
    pub min_request_interval_ms: u64,
    /// Endpoint override for every HTTP provider (proxies, remote Ollama).
    pub base_url: Option<String>,
    /// Strategies run concurrently in a batch.
    pub parallelism: usize,
    /// Stop as `exhausted` when a repair returns the previous program unchanged.
    pub no_progress_shortcut: bool,
    pub classifier: ClassifierConfig,
    pub prompts: PromptOverrides,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("artifacts"),
            interpreter: "python".into(),
            interpreter_env: None,
            execution_timeout_seconds: 300,
            kill_grace_seconds: 2,
            max_debug_iterations: 3,
            model_provider: "anthropic".into(),
            model_name: "claude-3-5-sonnet-latest".into(),
            research_model: None,
            backtest_model: None,
            debug_model: None,
            temperature: 0.7,
            max_tokens: 4096,
            request_timeout_seconds: 180,
            min_request_interval_ms: 0,
            base_url: None,
            parallelism: 1,
            no_progress_shortcut: true,
            classifier: ClassifierConfig::default(),
            prompts: PromptOverrides::default(),
        }
    }
}

/// `[classifier]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub provided_modules: Vec<String>,
    pub completion_markers: Vec<String>,
    pub min_output_lines: usize,
    pub forbidden_imports: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let rules = ClassifierRules::default();
        Self {
            provided_modules: rules.provided_modules,
            completion_markers: rules.completion_markers,
            min_output_lines: rules.min_output_lines,
            forbidden_imports: Vec::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn rules(&self) -> ClassifierRules {
        ClassifierRules {
            provided_modules: self.provided_modules.clone(),
            completion_markers: self.completion_markers.clone(),
            min_output_lines: self.min_output_lines,
        }
    }

    pub fn import_policy(&self) -> ImportPolicy {
        ImportPolicy::new(self.forbidden_imports.iter().cloned())
    }
}

/// `[prompts]` table: files replacing the built-in system prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptOverrides {
    pub research: Option<PathBuf>,
    pub backtest: Option<PathBuf>,
    pub debug: Option<PathBuf>,
}

impl PromptOverrides {
    pub fn get(&self, phase: Phase) -> Option<&Path> {
        match phase {
            Phase::Research => self.research.as_deref(),
            Phase::Backtest => self.backtest.as_deref(),
            Phase::Debug => self.debug.as_deref(),
        }
    }

    fn resolve_against(&mut self, base: &Path) {
        for slot in [&mut self.research, &mut self.backtest, &mut self.debug] {
            if let Some(path) = slot.as_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}

// ── Loading and validation ───────────────────────────────────────────

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. Relative prompt paths resolve against the file's
    /// directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text)?;
        if let Some(dir) = path.parent() {
            config.prompts.resolve_against(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_debug_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Temperature(self.temperature));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens);
        }
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        for phase in Phase::ALL {
            self.model_for(phase)?;
        }
        Ok(())
    }

    pub fn default_provider(&self) -> Result<ProviderKind, ConfigError> {
        ProviderKind::parse(&self.model_provider)
            .ok_or_else(|| ConfigError::UnknownProvider(self.model_provider.clone()))
    }

    /// Model selection for a phase: the phase override if set, else
    /// `model_provider:model_name`.
    pub fn model_for(&self, phase: Phase) -> Result<ModelSelector, ConfigError> {
        let provider = self.default_provider()?;
        let spec = match phase {
            Phase::Research => self.research_model.as_deref(),
            Phase::Backtest => self.backtest_model.as_deref(),
            Phase::Debug => self.debug_model.as_deref(),
        }
        .unwrap_or(&self.model_name);
        ModelSelector::parse(spec, provider).map_err(|reason| ConfigError::BadModel { phase, reason })
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
            base_url: self.base_url.clone(),
        }
    }

    pub fn sandbox_runner(&self) -> SandboxRunner {
        let launcher = Launcher::new(self.interpreter.clone(), self.interpreter_env.clone());
        SandboxRunner::new(launcher, self.execution_timeout())
            .with_kill_grace(Duration::from_secs(self.kill_grace_seconds))
    }
}
