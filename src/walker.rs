use crate::error::{RefreshError, Result};
use crate::types::FileEntry;
use regex::RegexSet;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix of staging files written during a rewrite.
pub const STAGING_SUFFIX: &str = ".coldrefresh-tmp";

pub fn is_staging_file(p: &Path) -> bool {
    p.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

/// An entry the walker could not stat.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub path: Option<PathBuf>,
    pub reason: String,
    pub permission_denied: bool,
}

pub type WalkItem = std::result::Result<FileEntry, SkippedEntry>;

/// Resolve the root to an absolute path and make sure it can be listed.
pub fn check_root(root: &Path) -> Result<PathBuf> {
    let canon = fs::canonicalize(root).map_err(|e| RefreshError::from_io(root, e))?;
    let meta = fs::metadata(&canon).map_err(|e| RefreshError::from_io(&canon, e))?;
    if meta.is_dir() {
        fs::read_dir(&canon).map_err(|e| RefreshError::from_io(&canon, e))?;
    }
    Ok(canon)
}

pub struct Walker {
    root: PathBuf,
    skip_paths: HashSet<PathBuf>,
    exclude: RegexSet,
}

impl Walker {
    /// `root` should come from [`check_root`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_paths: HashSet::new(),
            exclude: RegexSet::empty(),
        }
    }

    /// Never yield this exact path (ledger, journal, failure log).
    pub fn skip_path(mut self, p: impl Into<PathBuf>) -> Self {
        self.skip_paths.insert(p.into());
        self
    }

    pub fn exclude(mut self, set: RegexSet) -> Self {
        self.exclude = set;
        self
    }

    /// Lazy, single-pass, lexical order by file name.
    pub fn walk(self) -> Walk {
        let inner = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Walk {
            inner,
            skip_paths: self.skip_paths,
            exclude: self.exclude,
        }
    }
}

pub struct Walk {
    inner: walkdir::IntoIter,
    skip_paths: HashSet<PathBuf>,
    exclude: RegexSet,
}

impl Walk {
    fn is_excluded(&self, p: &Path) -> bool {
        !self.exclude.is_empty() && self.exclude.is_match(&p.to_string_lossy())
    }

    fn is_ignored(&self, p: &Path) -> bool {
        is_staging_file(p) || self.skip_paths.contains(p) || self.is_excluded(p)
    }
}

impl Iterator for Walk {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            let entry = match self.inner.next()? {
                Ok(e) => e,
                Err(e) => return Some(Err(skipped_from_walkdir(e))),
            };

            let ft = entry.file_type();
            if ft.is_dir() {
                if entry.depth() > 0 && self.is_excluded(entry.path()) {
                    debug!(path = %entry.path().display(), "excluded directory");
                    self.inner.skip_current_dir();
                }
                continue;
            }
            if ft.is_symlink() {
                debug!(path = %entry.path().display(), "skip symlink");
                continue;
            }
            if !ft.is_file() {
                debug!(path = %entry.path().display(), "skip special file");
                continue;
            }
            if self.is_ignored(entry.path()) {
                continue;
            }

            return Some(stat_entry(entry.path(), entry.metadata()));
        }
    }
}

fn stat_entry(path: &Path, meta: std::result::Result<fs::Metadata, walkdir::Error>) -> WalkItem {
    let meta = match meta {
        Ok(m) => m,
        Err(e) => return Err(skipped_from_walkdir(e)),
    };
    match meta.modified() {
        Ok(modified) => Ok(FileEntry {
            path: path.to_path_buf(),
            size: meta.len(),
            modified,
        }),
        Err(e) => Err(skipped(Some(path.to_path_buf()), &e)),
    }
}

fn skipped_from_walkdir(e: walkdir::Error) -> SkippedEntry {
    let path = e.path().map(Path::to_path_buf);
    match e.io_error() {
        Some(io) => skipped(path, io),
        None => {
            let reason = e.to_string();
            warn!(path = ?path, %reason, "skip entry");
            SkippedEntry {
                path,
                reason,
                permission_denied: false,
            }
        }
    }
}

fn skipped(path: Option<PathBuf>, e: &io::Error) -> SkippedEntry {
    let reason = e.to_string();
    warn!(path = ?path, %reason, "skip unreadable entry");
    SkippedEntry {
        path,
        reason,
        permission_denied: e.kind() == io::ErrorKind::PermissionDenied,
    }
}
