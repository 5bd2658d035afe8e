//! Brief files: one strategy per file, or a batch of `[[strategy]]` tables.
//!
//! ```toml
//! [[strategy]]
//! name = "SmaCross"
//! description = "SMA(10) over SMA(30) on Close, long-only"
//! data_path = "/data/spy.csv"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use strategen_core::domain::{BriefError, StrategyBrief};

#[derive(Debug, Error)]
pub enum BriefFileError {
    #[error("failed to read briefs {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid briefs TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("brief #{index}: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: BriefError,
    },

    #[error("brief file lists no strategies")]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBrief {
    name: String,
    description: String,
    data_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BriefDocument {
    Batch { strategy: Vec<RawBrief> },
    Single(RawBrief),
}

/// Parse briefs from TOML text. Data paths must already be absolute.
pub fn parse_briefs(text: &str) -> Result<Vec<StrategyBrief>, BriefFileError> {
    parse_with_base(text, None)
}

/// Load briefs from a file. Relative data paths resolve against the
/// file's directory.
pub fn load_briefs(path: &Path) -> Result<Vec<StrategyBrief>, BriefFileError> {
    let text = fs::read_to_string(path).map_err(|source| BriefFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path
        .parent()
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            }
        })
        .and_then(|dir| fs::canonicalize(dir).ok());
    parse_with_base(&text, base.as_deref())
}

fn parse_with_base(text: &str, base: Option<&Path>) -> Result<Vec<StrategyBrief>, BriefFileError> {
    let raw = match toml::from_str::<BriefDocument>(text)? {
        BriefDocument::Batch { strategy } => strategy,
        BriefDocument::Single(brief) => vec![brief],
    };
    if raw.is_empty() {
        return Err(BriefFileError::Empty);
    }

    raw.into_iter()
        .enumerate()
        .map(|(index, brief)| {
            let data_path = match base {
                Some(dir) if brief.data_path.is_relative() => dir.join(&brief.data_path),
                _ => brief.data_path,
            };
            StrategyBrief::new(&brief.name, brief.description, data_path)
                .map_err(|source| BriefFileError::Invalid { index, source })
        })
        .collect()
}
