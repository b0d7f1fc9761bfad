use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tracing::warn;

/// Local time if the offset is known, else UTC.
fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// RFC 3339 timestamp for ledger records.
pub fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

/// Default failure log beside the ledger: `.photos.coldrefresh.json` =>
/// `.photos.coldrefresh.failures.log`.
pub fn default_failure_log(ledger: &Path) -> PathBuf {
    ledger.with_extension("failures.log")
}

/// Append-only, human readable list of failed files.
/// Line format: `YYYY-MM-DD HH:MM|<path>|<kind>|<message>`.
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails the caller: a log write problem is only warned about.
    pub fn append(&self, file: &Path, kind: &str, message: &str) {
        if let Err(e) = self.try_append(file, kind, message) {
            warn!(log = %self.path.display(), error = %e, "failure log write failed");
        }
    }

    fn try_append(&self, file: &Path, kind: &str, message: &str) -> io::Result<()> {
        let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
        let ts = now_local().format(&fmt).map_err(io::Error::other)?;
        // keep one record per line
        let message = message.replace(['\n', '\r'], " ");
        let line = format!("{ts}|{}|{kind}|{message}\n", file.display());

        let _guard = self.lock.lock();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())?;
        f.flush()?;
        f.sync_data()
    }
}
