//! Strategy briefs: the operator-supplied seed of a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from brief validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BriefError {
    #[error("strategy name is empty")]
    EmptyName,

    #[error("strategy name '{0}' must match [A-Za-z0-9_]+")]
    InvalidName(String),

    #[error("strategy description is empty")]
    EmptyDescription,

    #[error("data path '{0}' must be absolute")]
    RelativeDataPath(PathBuf),
}

/// A strategy identifier that is always a safe path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StrategyName(String);

impl StrategyName {
    pub fn parse(raw: &str) -> Result<Self, BriefError> {
        if raw.is_empty() {
            return Err(BriefError::EmptyName);
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BriefError::InvalidName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StrategyName {
    type Error = BriefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StrategyName> for String {
    fn from(name: StrategyName) -> Self {
        name.0
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of one strategy to synthesize.
///
/// The data path is recorded, never opened: generated programs read it.
/// A path that does not exist is accepted here and surfaces later as a
/// `data_missing` classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyBrief {
    pub name: StrategyName,
    pub description: String,
    pub data_path: PathBuf,
}

impl StrategyBrief {
    pub fn new(
        name: &str,
        description: impl Into<String>,
        data_path: impl Into<PathBuf>,
    ) -> Result<Self, BriefError> {
        let brief = Self {
            name: StrategyName::parse(name)?,
            description: description.into(),
            data_path: data_path.into(),
        };
        brief.validate()?;
        Ok(brief)
    }

    /// Re-check invariants, e.g. after deserialisation.
    pub fn validate(&self) -> Result<(), BriefError> {
        if self.description.trim().is_empty() {
            return Err(BriefError::EmptyDescription);
        }
        if !self.data_path.is_absolute() {
            return Err(BriefError::RelativeDataPath(self.data_path.clone()));
        }
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_safe_names() {
        assert!(StrategyName::parse("SmaCross").is_ok());
        assert!(StrategyName::parse("rsi_2_reversal").is_ok());
    }

    #[test]
    fn rejects_path_like_names() {
        assert_eq!(
            StrategyName::parse("../etc"),
            Err(BriefError::InvalidName("../etc".into()))
        );
        assert!(StrategyName::parse("a b").is_err());
        assert!(StrategyName::parse("tab\tname").is_err());
        assert_eq!(StrategyName::parse(""), Err(BriefError::EmptyName));
    }

    #[test]
    fn requires_absolute_data_path() {
        let err = StrategyBrief::new("SmaCross", "long only", "data/btc.csv").unwrap_err();
        assert!(matches!(err, BriefError::RelativeDataPath(_)));
    }

    #[test]
    fn missing_data_file_is_not_a_brief_error() {
        let brief = StrategyBrief::new("SmaCross", "long only", "/nonexistent/ohlcv.csv");
        assert!(brief.is_ok());
    }

    #[test]
    fn deserialisation_validates_name() {
        let json = r#"{"name":"bad/name","description":"x","data_path":"/tmp/a.csv"}"#;
        assert!(serde_json::from_str::<StrategyBrief>(json).is_err());
    }
}
