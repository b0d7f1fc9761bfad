//! The refresh engine: walk, classify, and run the
//! checksum → checkpoint → stage → replace → verify cycle per cold file.
//!
//! Ledger transitions per file: `InProgress` is committed before the file is
//! touched, and the terminal `Verified`/`Failed` is committed right after.
//! A crash anywhere in between leaves an `InProgress` record, which the next
//! run resumes instead of trusting.

use crate::cancel::CancelToken;
use crate::classify::is_cold;
use crate::config::RefreshConfig;
use crate::error::{RefreshError, Result};
use crate::fsio;
use crate::ledger::{self, Ledger};
use crate::report::{self, FailureLog};
use crate::types::{
    FailedFile, FileEntry, RefreshRecord, RefreshStatus, RunMode, SizeCategory, Summary, path_key,
    unix_ms,
};
use crate::walker::{self, STAGING_SUFFIX, WalkItem, Walker};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Points in the cycle where a [`FaultInjector`] is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// checkpoint committed, nothing written yet
    BeforeStage,
    /// staging file written and synced, original not replaced yet
    AfterStage,
    /// staging file renamed over the original
    AfterReplace,
}

/// Test hook: returning an error at a point makes the cycle fail there as if
/// the I/O had failed.
pub trait FaultInjector: Send + Sync {
    fn check(&self, point: FaultPoint, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyVerified,
    NotCold,
    BelowMinSize,
    Unreadable,
    Vanished,
}

#[derive(Debug)]
enum Outcome {
    Refreshed { size: u64 },
    Skipped(SkipReason),
    Failed(FailedFile),
    Unrecoverable(FailedFile),
}

enum Stop {
    Cancelled,
    Fatal(RefreshError),
}

struct RunCtx {
    now: SystemTime,
    threshold_days: u32,
    seen: Mutex<HashSet<String>>,
    summary: Mutex<Summary>,
}

impl RunCtx {
    fn record(&self, outcome: Outcome) {
        let mut s = self.summary.lock();
        match outcome {
            Outcome::Refreshed { size } => {
                s.refreshed += 1;
                s.bytes_refreshed += size;
                match SizeCategory::of(size) {
                    SizeCategory::Small => s.categories.small += 1,
                    SizeCategory::Medium => s.categories.medium += 1,
                    SizeCategory::Large => s.categories.large += 1,
                }
            }
            Outcome::Skipped(_) => s.skipped += 1,
            Outcome::Failed(f) => {
                s.failed += 1;
                s.failures.push(f);
            }
            Outcome::Unrecoverable(f) => {
                s.skipped += 1;
                s.unrecoverable.push(f);
            }
        }
    }
}

pub struct RefreshEngine {
    config: RefreshConfig,
    workers: usize,
    ledger: Mutex<Ledger>,
    cancel: CancelToken,
    faults: Option<Arc<dyn FaultInjector>>,
    failure_log: Option<FailureLog>,
    skip_paths: Vec<PathBuf>,
}

impl RefreshEngine {
    /// The engine owns `ledger` until [`RefreshEngine::close`].
    ///
    /// Failures go to `config.failure_log`, or beside a file-backed ledger
    /// when unset. An in-memory ledger without a configured log gets none.
    pub fn new(config: RefreshConfig, ledger: Ledger) -> Result<Self> {
        config.validate()?;
        let location = absolutize(&ledger.location());
        let journal = ledger::journal_path(&location);
        let log_path = match &config.failure_log {
            Some(p) => Some(p.clone()),
            None if ledger.is_file_backed() => Some(report::default_failure_log(&location)),
            None => None,
        };

        let mut skip_paths = vec![location, journal];
        let failure_log = log_path.map(|p| {
            skip_paths.push(absolutize(&p));
            FailureLog::new(p)
        });

        Ok(Self {
            workers: config.workers.unwrap_or(1),
            config,
            ledger: Mutex::new(ledger),
            cancel: CancelToken::new(),
            faults: None,
            failure_log,
            skip_paths,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Current ledger record for `path`.
    pub fn record(&self, path: &Path) -> Option<RefreshRecord> {
        self.ledger.lock().get(&path_key(path)).cloned()
    }

    /// Compact the ledger and release it.
    pub fn close(self) -> Result<()> {
        self.ledger.into_inner().close()
    }

    /// Refresh every cold file under `root`. `threshold_days == 0` treats
    /// every file as cold.
    ///
    /// Returns `Err` only for fatal problems (root missing or unreadable,
    /// bad config, ledger unwritable). Per-file failures land in the summary.
    pub fn run(&self, root: &Path, threshold_days: u32) -> Result<Summary> {
        let started = Instant::now();
        let root = walker::check_root(root)?;
        let exclude = self.config.exclude_set()?;

        let mut walk = Walker::new(&root).exclude(exclude);
        for p in &self.skip_paths {
            walk = walk.skip_path(p.clone());
        }

        let ctx = RunCtx {
            now: SystemTime::now(),
            threshold_days,
            seen: Mutex::new(HashSet::new()),
            summary: Mutex::new(Summary::default()),
        };

        let mode = RunMode::for_workers(self.workers);
        info!(
            root = %root.display(),
            threshold_days,
            workers = self.workers,
            mode = ?mode,
            max_attempts = self.config.max_attempts,
            "refresh run starting"
        );

        let completed = match mode {
            RunMode::Single => self.run_single(walk.walk(), &ctx)?,
            RunMode::Multi => self.run_multi(walk.walk(), &ctx)?,
        };

        if completed {
            let seen = ctx.seen.lock();
            self.prune_vanished(&root, &seen)?;
        } else {
            info!("cancelled, stopping at file boundary");
        }
        self.ledger.lock().compact()?;

        let mut summary = ctx.summary.into_inner();
        summary.cancelled = !completed;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary.failures.sort_by(|a, b| a.path.cmp(&b.path));
        summary.unrecoverable.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            scanned = summary.scanned,
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed = summary.failed,
            unrecoverable = summary.unrecoverable.len(),
            cancelled = summary.cancelled,
            mb_s = %format!("{:.1}", summary.throughput_mb_s()),
            "refresh run finished"
        );
        Ok(summary)
    }

    /* =========================
       Drivers
       ========================= */

    /// Returns false when cancelled.
    fn run_single(&self, walk: impl Iterator<Item = WalkItem>, ctx: &RunCtx) -> Result<bool> {
        for item in walk {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            self.handle_item(item, ctx)?;
        }
        Ok(true)
    }

    fn run_multi(
        &self,
        walk: impl Iterator<Item = WalkItem> + Send,
        ctx: &RunCtx,
    ) -> Result<bool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| RefreshError::Config(format!("worker pool: {e}")))?;

        // each path is yielded once per walk, so workers never share a file
        let res = pool.install(|| {
            walk.par_bridge().try_for_each(|item| {
                if self.cancel.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                self.handle_item(item, ctx).map_err(Stop::Fatal)
            })
        });

        match res {
            Ok(()) => Ok(true),
            Err(Stop::Cancelled) => Ok(false),
            Err(Stop::Fatal(e)) => Err(e),
        }
    }

    fn handle_item(&self, item: WalkItem, ctx: &RunCtx) -> Result<()> {
        let entry = match item {
            Ok(e) => e,
            Err(skipped) => {
                if let Some(p) = &skipped.path {
                    ctx.seen.lock().insert(path_key(p));
                }
                ctx.record(Outcome::Skipped(SkipReason::Unreadable));
                return Ok(());
            }
        };

        ctx.seen.lock().insert(entry.key());
        ctx.summary.lock().scanned += 1;

        let outcome = self.process(&entry, ctx)?;
        if let Outcome::Skipped(reason) = &outcome {
            debug!(path = %entry.path.display(), ?reason, "skip");
        }
        ctx.record(outcome);
        Ok(())
    }

    /* =========================
       Per-file decisions
       ========================= */

    fn process(&self, entry: &FileEntry, ctx: &RunCtx) -> Result<Outcome> {
        let key = entry.key();
        let mtime = entry.mtime_unix_ms();
        let existing = self.ledger.lock().get(&key).cloned();

        let existing = match existing {
            Some(r) if r.status == RefreshStatus::Verified && r.last_modified_seen == mtime => {
                return Ok(Outcome::Skipped(SkipReason::AlreadyVerified));
            }
            Some(r) if r.status == RefreshStatus::InProgress => return self.resume(entry, r, ctx),
            Some(r) if r.last_modified_seen != mtime => {
                debug!(path = %entry.path.display(), "modified since recorded, dropping record");
                self.forget(&key)?;
                None
            }
            other => other,
        };

        match existing {
            // Failed / Pending with the same mtime: retry within the bound
            Some(r) => {
                if r.attempts >= self.config.max_attempts {
                    return Ok(Outcome::Unrecoverable(failed_file(entry, &r)));
                }
                self.refresh(entry, Some(r))
            }
            None => self.process_new(entry, ctx),
        }
    }

    fn process_new(&self, entry: &FileEntry, ctx: &RunCtx) -> Result<Outcome> {
        if !is_cold(entry, ctx.now, ctx.threshold_days) {
            return Ok(Outcome::Skipped(SkipReason::NotCold));
        }
        if entry.size < self.config.min_size_bytes {
            return Ok(Outcome::Skipped(SkipReason::BelowMinSize));
        }
        self.refresh(entry, None)
    }

    /// Record left `InProgress` by an interrupted run.
    fn resume(&self, entry: &FileEntry, r: RefreshRecord, ctx: &RunCtx) -> Result<Outcome> {
        let key = entry.key();
        info!(path = %entry.path.display(), attempts = r.attempts, "resuming interrupted refresh");
        remove_staging_for(&entry.path);

        if r.last_modified_seen != entry.mtime_unix_ms() {
            // the replace may have landed before the interruption
            let current = match self.hash(&entry.path) {
                Ok(h) => h,
                Err(RefreshError::NotFound(_)) => return self.vanished(&key),
                Err(e) => return self.fail(entry, r, e),
            };
            if r.original_checksum.as_deref() == Some(current.as_str()) {
                let rec = RefreshRecord {
                    status: RefreshStatus::Verified,
                    last_error: None,
                    last_modified_seen: entry.mtime_unix_ms(),
                    size: entry.size,
                    updated_at: report::now_rfc3339(),
                    ..r
                };
                self.put(&key, rec)?;
                info!(path = %entry.path.display(), "interrupted refresh had completed, verified");
                return Ok(Outcome::Refreshed { size: entry.size });
            }
            warn!(path = %entry.path.display(), "modified externally during an interrupted refresh, reclassifying");
            self.forget(&key)?;
            return self.process_new(entry, ctx);
        }

        if r.attempts >= self.config.max_attempts {
            let err = RefreshError::Io {
                path: entry.path.clone(),
                source: io::Error::other("interrupted during final attempt"),
            };
            return match self.fail(entry, r, err)? {
                Outcome::Failed(f) => Ok(Outcome::Unrecoverable(f)),
                other => Ok(other),
            };
        }
        self.refresh(entry, Some(r))
    }

    /* =========================
       The cycle
       ========================= */

    fn refresh(&self, entry: &FileEntry, prev: Option<RefreshRecord>) -> Result<Outcome> {
        let key = entry.key();
        let path = entry.path.as_path();
        let prev = prev.unwrap_or_default();

        let mut rec = RefreshRecord {
            status: RefreshStatus::Pending,
            original_checksum: prev.original_checksum.clone(),
            attempts: prev.attempts + 1,
            last_error: None,
            last_modified_seen: entry.mtime_unix_ms(),
            size: entry.size,
            updated_at: None,
        };

        // integrity anchor
        let before = match self.hash(path) {
            Ok(h) => h,
            Err(RefreshError::NotFound(_)) => return self.vanished(&key),
            Err(e) => return self.fail(entry, rec, e),
        };
        if let Some(orig) = &prev.original_checksum {
            if *orig != before {
                let e = RefreshError::ChecksumMismatch {
                    path: path.to_path_buf(),
                    expected: orig.clone(),
                    actual: before,
                };
                return self.fail(entry, rec, e);
            }
        }

        // checkpoint: from here a crash means "re-verify", never "done"
        rec.status = RefreshStatus::InProgress;
        rec.original_checksum.get_or_insert_with(|| before.clone());
        rec.updated_at = report::now_rfc3339();
        self.put(&key, rec.clone())?;

        if let Err(e) = self.rewrite(path, &before, &mut rec) {
            return self.fail(entry, rec, e);
        }

        let after = match self.hash(path) {
            Ok(h) => h,
            Err(e) => return self.fail(entry, rec, e),
        };

        if after != before {
            let e = RefreshError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: before,
                actual: after,
            };
            return self.fail(entry, rec, e);
        }

        rec.status = RefreshStatus::Verified;
        rec.updated_at = report::now_rfc3339();
        self.put(&key, rec)?;
        info!(path = %path.display(), size = entry.size, "refreshed");
        Ok(Outcome::Refreshed { size: entry.size })
    }

    /// Stream into a sibling staging file, verify, atomically rename over
    /// the original. The original is intact until the rename; right after
    /// it `rec` takes the new mtime, so a later failure is still retried
    /// against the same record.
    fn rewrite(&self, path: &Path, before: &str, rec: &mut RefreshRecord) -> Result<()> {
        self.inject(FaultPoint::BeforeStage, path)?;

        let io_err = |source: io::Error| RefreshError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path
            .parent()
            .ok_or_else(|| io_err(io::Error::other("file has no parent directory")))?;
        let meta = fs::metadata(path).map_err(|e| RefreshError::from_io(path, e))?;

        let mut staged = tempfile::Builder::new()
            .prefix(&staging_prefix(path))
            .suffix(STAGING_SUFFIX)
            .tempfile_in(dir)
            .map_err(io_err)?;

        {
            let mut src = fsio::open_read(path, self.config.io_timeout())?;
            let (_, streamed) =
                fsio::copy_hashing(&mut src, &mut staged, self.config.buffer_size).map_err(io_err)?;
            if streamed != before {
                return Err(RefreshError::ChecksumMismatch {
                    path: path.to_path_buf(),
                    expected: before.to_string(),
                    actual: streamed,
                });
            }
        }

        fs::set_permissions(staged.path(), meta.permissions()).map_err(io_err)?;
        copy_owner(&meta, staged.path()).map_err(|e| RefreshError::from_io(path, e))?;
        staged.as_file().sync_all().map_err(io_err)?;

        self.inject(FaultPoint::AfterStage, path)?;

        let mut pending = Some(staged);
        fsio::retry_busy(path, self.config.io_timeout(), || {
            let f = pending
                .take()
                .ok_or_else(|| io::Error::other("staging file already consumed"))?;
            match f.persist(path) {
                Ok(_) => Ok(()),
                Err(e) => {
                    pending = Some(e.file);
                    Err(e.error)
                }
            }
        })?;
        rec.last_modified_seen = mtime_ms(path)?;
        fsio::sync_dir(dir).map_err(io_err)?;

        self.inject(FaultPoint::AfterReplace, path)?;
        Ok(())
    }

    /* =========================
       Ledger helpers
       ========================= */

    fn fail(&self, entry: &FileEntry, mut rec: RefreshRecord, err: RefreshError) -> Result<Outcome> {
        if err.is_fatal() {
            return Err(err);
        }
        let reason = format!("{}: {}", err.kind(), err);
        rec.status = RefreshStatus::Failed;
        rec.last_error = Some(reason.clone());
        rec.updated_at = report::now_rfc3339();
        let attempts = rec.attempts;
        self.put(&entry.key(), rec)?;

        warn!(
            path = %entry.path.display(),
            attempt = attempts,
            max_attempts = self.config.max_attempts,
            error = %err,
            "refresh failed"
        );
        if let Some(log) = &self.failure_log {
            log.append(&entry.path, err.kind(), &err.to_string());
        }
        Ok(Outcome::Failed(FailedFile {
            path: entry.path.clone(),
            reason,
        }))
    }

    fn vanished(&self, key: &str) -> Result<Outcome> {
        self.forget(key)?;
        Ok(Outcome::Skipped(SkipReason::Vanished))
    }

    /// Durable upsert, then commit barrier.
    fn put(&self, key: &str, rec: RefreshRecord) -> Result<()> {
        let mut ledger = self.ledger.lock();
        ledger.put(key, rec)?;
        ledger.commit()
    }

    fn forget(&self, key: &str) -> Result<()> {
        let mut ledger = self.ledger.lock();
        ledger.remove(key)?;
        ledger.commit()
    }

    /// Drop records under `root` whose files were not seen by a full walk.
    fn prune_vanished(&self, root: &Path, seen: &HashSet<String>) -> Result<()> {
        let mut ledger = self.ledger.lock();
        let stale: Vec<String> = ledger
            .keys_under(root)
            .into_iter()
            .filter(|k| !seen.contains(k))
            .collect();
        for k in &stale {
            ledger.remove(k)?;
        }
        ledger.commit()?;
        if !stale.is_empty() {
            info!(removed = stale.len(), "pruned records of vanished files");
        }
        Ok(())
    }

    fn hash(&self, path: &Path) -> Result<String> {
        fsio::hash_file(path, self.config.buffer_size, self.config.io_timeout())
    }

    fn inject(&self, point: FaultPoint, path: &Path) -> Result<()> {
        match &self.faults {
            Some(f) => f.check(point, path).map_err(|source| RefreshError::Io {
                path: path.to_path_buf(),
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Open the ledger for `root`, run once, compact. The usual entry point.
pub fn refresh_tree(
    root: &Path,
    threshold_days: u32,
    config: &RefreshConfig,
    cancel: CancelToken,
) -> Result<Summary> {
    config.validate()?;
    let root = walker::check_root(root)?;
    let ledger_path = config
        .ledger_path
        .clone()
        .unwrap_or_else(|| ledger::default_ledger_path(&root));

    let ledger = Ledger::open(&ledger_path)?;
    let engine = RefreshEngine::new(config.clone(), ledger)?.with_cancel(cancel);

    let summary = engine.run(&root, threshold_days)?;
    engine.close()?;
    Ok(summary)
}

fn failed_file(entry: &FileEntry, r: &RefreshRecord) -> FailedFile {
    FailedFile {
        path: entry.path.clone(),
        reason: r
            .last_error
            .clone()
            .unwrap_or_else(|| format!("gave up after {} attempts", r.attempts)),
    }
}

fn mtime_ms(path: &Path) -> Result<i64> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(unix_ms)
        .map_err(|e| RefreshError::from_io(path, e))
}

/// Give the staging file the original's owner and group.
#[cfg(unix)]
fn copy_owner(original: &fs::Metadata, staged: &Path) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let current = fs::metadata(staged)?;
    if current.uid() == original.uid() && current.gid() == original.gid() {
        return Ok(());
    }
    std::os::unix::fs::chown(staged, Some(original.uid()), Some(original.gid()))
}

#[cfg(not(unix))]
fn copy_owner(_original: &fs::Metadata, _staged: &Path) -> io::Result<()> {
    Ok(())
}

fn staging_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(".{name}.")
}

/// Delete staging files an interrupted rewrite of `path` left behind.
fn remove_staging_for(path: &Path) {
    let Some(dir) = path.parent() else {
        return;
    };
    let prefix = staging_prefix(path);
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    for entry in rd.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(STAGING_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!(staging = %entry.path().display(), "removed stale staging file"),
                Err(e) => warn!(staging = %entry.path().display(), error = %e, "cannot remove stale staging file"),
            }
        }
    }
}

/// Canonical parent + file name, so skip paths compare equal to walker output.
fn absolutize(p: &Path) -> PathBuf {
    match (p.parent(), p.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|d| d.join(name))
                .unwrap_or_else(|_| p.to_path_buf())
        }
        _ => p.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_staging_only_touches_own_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        fs::write(&target, b"m").unwrap();
        fs::write(dir.path().join(".movie.mkv.a1B2.coldrefresh-tmp"), b"t").unwrap();
        fs::write(dir.path().join(".other.mkv.zz.coldrefresh-tmp"), b"t").unwrap();

        remove_staging_for(&target);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec![".other.mkv.zz.coldrefresh-tmp", "movie.mkv"]);
    }

    #[test]
    fn absolutize_resolves_relative_parent() {
        let dir = tempfile::tempdir().unwrap();
        let canon = fs::canonicalize(dir.path()).unwrap();
        let p = absolutize(&dir.path().join("ledger.json"));
        assert_eq!(p, canon.join("ledger.json"));
    }

    #[test]
    fn summary_counts_by_outcome() {
        let ctx = RunCtx {
            now: SystemTime::now(),
            threshold_days: 0,
            seen: Mutex::new(HashSet::new()),
            summary: Mutex::new(Summary::default()),
        };
        ctx.record(Outcome::Refreshed { size: 20 * 1024 * 1024 });
        ctx.record(Outcome::Refreshed { size: 5 });
        ctx.record(Outcome::Skipped(SkipReason::NotCold));
        ctx.record(Outcome::Failed(FailedFile {
            path: PathBuf::from("/x"),
            reason: "IO: boom".into(),
        }));
        ctx.record(Outcome::Unrecoverable(FailedFile {
            path: PathBuf::from("/y"),
            reason: "IO: boom".into(),
        }));

        let s = ctx.summary.into_inner();
        assert_eq!((s.refreshed, s.skipped, s.failed), (2, 2, 1));
        assert_eq!((s.categories.small, s.categories.medium), (1, 1));
        assert_eq!(s.unrecoverable.len(), 1);
        assert_eq!(s.bytes_refreshed, 20 * 1024 * 1024 + 5);
    }
}
