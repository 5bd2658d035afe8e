//! System prompts and the user content built for each phase.
//!
//! Builders only concatenate: model output is passed on verbatim.

use strategen_core::domain::{ClassifiedError, Phase, Program, StrategyBrief};

use crate::config::{ConfigError, PromptOverrides};

const RESEARCH_SYSTEM: &str = "\
You are a quantitative trading researcher. Given a strategy idea, describe it \
precisely enough for a programmer to implement a backtest: the indicators and \
their parameters, entry and exit rules, position sizing, and any assumptions \
about the data. Write Markdown. Do not write code.";

const BACKTEST_SYSTEM: &str = "\
You write complete, self-contained Python backtest programs. The program must \
load OHLCV data from the CSV path it is given (columns are case-insensitive: a \
datetime column named datetime, date or time, plus open, high, low, close, \
volume), run the strategy over the whole history, and print a summary of the \
results to stdout. Reply with exactly one ```python fenced block containing the \
whole program and nothing else of substance.";

const DEBUG_SYSTEM: &str = "\
You repair Python backtest programs. You are given a program that failed, the \
category of the failure, and the relevant error output. Reply with exactly one \
```python fenced block containing the COMPLETE corrected program. Do not reply \
with a patch, a diff or a fragment: your block replaces the file as a whole. If \
a module is not installed, stop depending on it or use an available library.";

/// System prompts for the three phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub research: String,
    pub backtest: String,
    pub debug: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            research: RESEARCH_SYSTEM.to_string(),
            backtest: BACKTEST_SYSTEM.to_string(),
            debug: DEBUG_SYSTEM.to_string(),
        }
    }
}

impl PromptSet {
    /// Built-in prompts with any configured file overrides applied.
    pub fn load(overrides: &PromptOverrides) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for phase in Phase::ALL {
            if let Some(path) = overrides.get(phase) {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::PromptFile {
                    phase,
                    path: path.to_path_buf(),
                    source,
                })?;
                *set.slot_mut(phase) = text;
            }
        }
        Ok(set)
    }

    pub fn system(&self, phase: Phase) -> &str {
        match phase {
            Phase::Research => &self.research,
            Phase::Backtest => &self.backtest,
            Phase::Debug => &self.debug,
        }
    }

    fn slot_mut(&mut self, phase: Phase) -> &mut String {
        match phase {
            Phase::Research => &mut self.research,
            Phase::Backtest => &mut self.backtest,
            Phase::Debug => &mut self.debug,
        }
    }
}

fn brief_section(brief: &StrategyBrief) -> String {
    format!(
        "## Strategy\n\nName: {}\n\n{}\n\n## Data\n\nOHLCV CSV: {}\n",
        brief.name,
        brief.description.trim(),
        brief.data_path.display()
    )
}

pub fn research_request(brief: &StrategyBrief) -> String {
    format!(
        "{}\nDescribe this strategy for implementation.\n",
        brief_section(brief)
    )
}

/// Backtest request; the research notes are read-only context.
pub fn backtest_request(brief: &StrategyBrief, research: &str) -> String {
    format!(
        "{}\n## Research notes\n\n{}\n\n## Task\n\nWrite the complete Python backtest program for this strategy. \
         Read the data from exactly this path: {}\n",
        brief_section(brief),
        research.trim_end(),
        brief.data_path.display()
    )
}

/// Repair request carrying the full failed program and its classified error.
pub fn debug_request(
    brief: &StrategyBrief,
    program: &Program,
    error: &ClassifiedError,
    iteration: u32,
) -> String {
    let fence = fence_for(&program.source);
    let mut out = format!(
        "{}\n## Failed program (attempt {iteration})\n\n{fence}python\n{}",
        brief_section(brief),
        program.source
    );
    if !program.source.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&fence);
    out.push_str("\n\n");
    out.push_str(&format!("## Failure\n\nKind: {}\n", error.kind));
    if let Some(hint) = &error.hint {
        out.push_str(&format!("Hint: {hint}\n"));
    }
    out.push_str(&format!("\n```text\n{}\n```\n\n", error.excerpt.trim_end()));
    out.push_str(
        "## Task\n\nReturn the complete corrected program as a single ```python block. \
         It replaces the program above in full; do not send a patch.\n",
    );
    out
}

/// A backtick fence longer than any backtick run inside `source`.
fn fence_for(source: &str) -> String {
    let longest = source
        .split(|c: char| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat(longest.max(2) + 1)
}
