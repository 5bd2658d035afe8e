//! Classified program failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure category derived from a run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    /// Import of a module the environment provides, used incorrectly,
    /// or an import rejected by policy.
    Import,
    NameOrAttribute,
    ValueOrType,
    IndexOrKey,
    Timeout,
    DependencyMissing,
    DataMissing,
    RuntimeOther,
    EmptyOutput,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Import => "import",
            ErrorKind::NameOrAttribute => "name_or_attribute",
            ErrorKind::ValueOrType => "value_or_type",
            ErrorKind::IndexOrKey => "index_or_key",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::DataMissing => "data_missing",
            ErrorKind::RuntimeOther => "runtime_other",
            ErrorKind::EmptyOutput => "empty_output",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure kind plus the stderr excerpt the debug model sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, excerpt: impl Into<String>) -> Self {
        Self {
            kind,
            excerpt: excerpt.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
