//! Artifact store: the on-disk layout every run writes into.
//!
//! ```text
//! <root>/<YYYY_MM_DD>/<phase>/<strategy>/<kind>.<iteration>.<ext>
//! <root>/<YYYY_MM_DD>/runs.jsonl
//! ```
//!
//! Strategies write disjoint subtrees, so only the shared ledger needs a
//! lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use strategen_core::domain::{ArtifactKey, ArtifactKind, Iteration, Phase, RunId, StrategyName};

const LEDGER_FILE: &str = "runs.jsonl";

/// Store failures. All of them are fatal to the run that hits them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactKey),

    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Filesystem-backed artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    ledger: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ledger: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    pub fn strategy_dir(&self, run_id: &RunId, phase: Phase, strategy: &StrategyName) -> PathBuf {
        self.run_dir(run_id).join(phase.as_str()).join(strategy.as_str())
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.strategy_dir(&key.run_id, key.phase, &key.strategy)
            .join(key.file_name())
    }

    /// Write `bytes` under `key`, replacing any earlier write. The data is
    /// synced to disk before this returns.
    pub fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_err("create", dir))?;

        let tmp = dir.join(format!(".{}.tmp", key.file_name()));
        {
            let mut file = File::create(&tmp).map_err(io_err("create", &tmp))?;
            file.write_all(bytes).map_err(io_err("write", &tmp))?;
            file.sync_all().map_err(io_err("sync", &tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_err("rename", &path))?;

        debug!(artifact = %key, bytes = bytes.len(), "artifact written");
        Ok(path)
    }

    pub fn put_json<T: Serialize>(&self, key: &ArtifactKey, value: &T) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
            what: key.to_string(),
            source,
        })?;
        self.put(key, &bytes)
    }

    pub fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.clone()))
            }
            Err(e) => Err(io_err("read", &path)(e)),
        }
    }

    pub fn get_string(&self, key: &ArtifactKey) -> Result<String, StoreError> {
        let bytes = self.get(key)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Copy `key` into its phase's `final` slot. The source stays readable.
    pub fn promote(&self, key: &ArtifactKey) -> Result<PathBuf, StoreError> {
        let bytes = self.get(key)?;
        self.put(&key.with_iteration(Iteration::Final), &bytes)
    }

    /// Every artifact written for one strategy in one run, sorted.
    pub fn list(&self, run_id: &RunId, strategy: &StrategyName) -> Result<Vec<ArtifactKey>, StoreError> {
        let mut keys = Vec::new();
        for phase in Phase::ALL {
            let dir = self.strategy_dir(run_id, phase, strategy);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(io_err("list", &dir))? {
                let entry = entry.map_err(io_err("list", &dir))?;
                let name = entry.file_name();
                let Some((kind, iteration)) = name.to_str().and_then(parse_file_name) else {
                    continue;
                };
                keys.push(ArtifactKey::new(
                    run_id.clone(),
                    strategy.clone(),
                    phase,
                    iteration,
                    kind,
                ));
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn ledger_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(LEDGER_FILE)
    }

    /// Append one JSON line to the run ledger.
    pub fn append_ledger<T: Serialize>(&self, run_id: &RunId, entry: &T) -> Result<PathBuf, StoreError> {
        let path = self.ledger_path(run_id);
        let mut line = serde_json::to_string(entry).map_err(|source| StoreError::Encode {
            what: "ledger entry".into(),
            source,
        })?;
        line.push('\n');

        // A poisoned lock only means another writer panicked mid-append.
        let _guard = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(io_err("create", &dir))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err("open", &path))?;
        file.write_all(line.as_bytes()).map_err(io_err("append to", &path))?;
        file.sync_all().map_err(io_err("sync", &path))?;
        Ok(path)
    }
}

/// `<kind>.<iteration>.<ext>` back to its parts; anything else is ignored.
fn parse_file_name(name: &str) -> Option<(ArtifactKind, Iteration)> {
    let mut parts = name.splitn(3, '.');
    let kind = ArtifactKind::from_str_opt(parts.next()?)?;
    let iteration = Iteration::parse(parts.next()?)?;
    (parts.next()? == kind.extension()).then_some((kind, iteration))
}
