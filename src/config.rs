use crate::error::RefreshError;
use anyhow::{Context, Result};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Attempts per file across runs before it is reported unrecoverable.
    pub max_attempts: u32,

    /// None => autotune from disk kind + cores.
    pub workers: Option<usize>,

    pub buffer_size: usize,

    /// Files smaller than this are skipped.
    pub min_size_bytes: u64,

    pub io_timeout_ms: u64,

    /// Regexes matched against the full path.
    pub exclude: Vec<String>,

    pub ledger_path: Option<PathBuf>,
    pub failure_log: Option<PathBuf>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workers: None,
            buffer_size: 64 * 1024,
            min_size_bytes: 0,
            io_timeout_ms: 30_000,
            exclude: Vec::new(),
            ledger_path: None,
            failure_log: None,
        }
    }
}

impl RefreshConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), RefreshError> {
        if self.max_attempts == 0 {
            return Err(RefreshError::Config("max_attempts must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(RefreshError::Config("buffer_size must be non-zero".into()));
        }
        if self.workers == Some(0) {
            return Err(RefreshError::Config("workers must be at least 1".into()));
        }
        self.exclude_set().map(|_| ())
    }

    pub fn exclude_set(&self) -> std::result::Result<RegexSet, RefreshError> {
        RegexSet::new(&self.exclude)
            .map_err(|e| RefreshError::Config(format!("bad exclude pattern: {e}")))
    }
}

/// Load a YAML config. Missing file => None; unreadable or invalid => error.
pub fn load_yaml(path: &Path) -> Result<Option<RefreshConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let cfg: RefreshConfig =
        serde_yaml::from_reader(file).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(cfg))
}
