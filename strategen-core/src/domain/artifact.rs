//! Artifact addressing: `(run_id, strategy, phase, iteration, kind)`.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::brief::StrategyName;

/// Date-stamped run identifier, rendered `YYYY_MM_DD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format("%Y_%m_%d").to_string())
    }

    pub fn today() -> Self {
        Self::for_date(chrono::Local::now().date_naive())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline phase. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Backtest,
    Debug,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Research, Phase::Backtest, Phase::Debug];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Backtest => "backtest",
            Phase::Debug => "debug",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an artifact holds. Determines the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Prompt,
    RawResponse,
    ExtractedCode,
    RunLog,
    ErrorExcerpt,
    /// Serialised `RunOutcome` of one attempt.
    Outcome,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::Prompt,
        ArtifactKind::RawResponse,
        ArtifactKind::ExtractedCode,
        ArtifactKind::RunLog,
        ArtifactKind::ErrorExcerpt,
        ArtifactKind::Outcome,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Prompt => "prompt",
            ArtifactKind::RawResponse => "raw_response",
            ArtifactKind::ExtractedCode => "extracted_code",
            ArtifactKind::RunLog => "run_log",
            ArtifactKind::ErrorExcerpt => "error_excerpt",
            ArtifactKind::Outcome => "outcome",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Prompt | ArtifactKind::RawResponse => "md",
            ArtifactKind::ExtractedCode => "py",
            ArtifactKind::RunLog => "log",
            ArtifactKind::ErrorExcerpt | ArtifactKind::Outcome => "json",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt number within a phase, or the phase-closing slot.
///
/// Serialises as a bare number or the string `"final"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Iteration {
    Attempt(u32),
    Final,
}

impl Iteration {
    pub fn attempt(self) -> Option<u32> {
        match self {
            Iteration::Attempt(n) => Some(n),
            Iteration::Final => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s == "final" {
            Some(Iteration::Final)
        } else {
            s.parse().ok().map(Iteration::Attempt)
        }
    }
}

impl fmt::Display for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Iteration::Attempt(n) => write!(f, "{n}"),
            Iteration::Final => f.write_str("final"),
        }
    }
}

impl Serialize for Iteration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Iteration::Attempt(n) => serializer.serialize_u32(*n),
            Iteration::Final => serializer.serialize_str("final"),
        }
    }
}

impl<'de> Deserialize<'de> for Iteration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Iteration::Attempt(n)),
            Repr::Text(s) if s == "final" => Ok(Iteration::Final),
            Repr::Text(s) => Err(serde::de::Error::custom(format!(
                "expected an iteration number or \"final\", got \"{s}\""
            ))),
        }
    }
}

/// Unique address of one persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: RunId,
    pub strategy: StrategyName,
    pub phase: Phase,
    pub iteration: Iteration,
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    pub fn new(
        run_id: RunId,
        strategy: StrategyName,
        phase: Phase,
        iteration: Iteration,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            run_id,
            strategy,
            phase,
            iteration,
            kind,
        }
    }

    /// Same slot, different kind.
    pub fn with_kind(&self, kind: ArtifactKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Same slot, different iteration.
    pub fn with_iteration(&self, iteration: Iteration) -> Self {
        Self {
            iteration,
            ..self.clone()
        }
    }

    /// File name within the strategy directory: `<kind>.<iteration>.<ext>`.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.kind.as_str(),
            self.iteration,
            self.kind.extension()
        )
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.run_id,
            self.phase,
            self.strategy,
            self.file_name()
        )
    }
}
