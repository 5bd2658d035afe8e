//! Extracted executable programs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The executable form of one model response.
///
/// `entrypoint` is the artifact path the source was persisted to;
/// `parent_iteration` is the attempt this program was repaired from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub source: String,
    pub entrypoint: PathBuf,
    pub parent_iteration: Option<u32>,
}

impl Program {
    pub fn new(source: String, entrypoint: PathBuf, parent_iteration: Option<u32>) -> Self {
        Self {
            source,
            entrypoint,
            parent_iteration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    /// BLAKE3 digest of the source bytes, hex encoded.
    pub fn digest(&self) -> String {
        blake3::hash(self.source.as_bytes()).to_hex().to_string()
    }

    /// Byte-for-byte equality of sources.
    pub fn same_source(&self, other: &Program) -> bool {
        self.source.as_bytes() == other.source.as_bytes()
    }
}
