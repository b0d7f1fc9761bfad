use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MIB: u64 = 1024 * 1024;
/// >= 10MB is medium
pub const MEDIUM_FILE: u64 = 10 * MIB;
/// > 100MB is large
pub const LARGE_FILE: u64 = 100 * MIB;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum RunMode {
    Single,
    Multi,
}

impl RunMode {
    pub fn for_workers(workers: usize) -> Self {
        if workers > 1 { RunMode::Multi } else { RunMode::Single }
    }
}

/// One regular file seen by the walker.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl FileEntry {
    /// Ledger key (lossy path string).
    pub fn key(&self) -> String {
        path_key(&self.path)
    }

    /// mtime in unix milliseconds
    pub fn mtime_unix_ms(&self) -> i64 {
        unix_ms(self.modified)
    }
}

pub fn path_key(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

pub fn unix_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RefreshStatus {
    InProgress,
    Verified,
    Failed,
    /// Also what older ledgers without a (known) status read as.
    #[default]
    #[serde(other)]
    Pending,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshRecord {
    pub status: RefreshStatus,

    /// blake3 hex of the content before the first rewrite
    pub original_checksum: Option<String>,

    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// mtime (unix ms) seen at the last transition
    pub last_modified_seen: i64,

    pub size: u64,

    /// RFC 3339
    pub updated_at: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn of(size: u64) -> Self {
        if size > LARGE_FILE {
            SizeCategory::Large
        } else if size >= MEDIUM_FILE {
            SizeCategory::Medium
        } else {
            SizeCategory::Small
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SizeCounts {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of one engine run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Summary {
    pub scanned: u64,
    pub refreshed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,

    pub bytes_refreshed: u64,
    pub elapsed_ms: u64,
    pub categories: SizeCounts,

    /// failed during this run
    pub failures: Vec<FailedFile>,
    /// past the retry bound, no longer attempted
    pub unrecoverable: Vec<FailedFile>,
}

impl Summary {
    pub fn throughput_mb_s(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        (self.bytes_refreshed as f64 / MIB as f64) / (self.elapsed_ms as f64 / 1000.0)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.unrecoverable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn size_categories_match_thresholds() {
        assert_eq!(SizeCategory::of(0), SizeCategory::Small);
        assert_eq!(SizeCategory::of(MEDIUM_FILE - 1), SizeCategory::Small);
        assert_eq!(SizeCategory::of(MEDIUM_FILE), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(LARGE_FILE), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(LARGE_FILE + 1), SizeCategory::Large);
    }

    #[test]
    fn record_reads_older_format_with_missing_fields() {
        let r: RefreshRecord = serde_json::from_str(r#"{"attempts": 2}"#).unwrap();
        assert_eq!(r.status, RefreshStatus::Pending);
        assert_eq!(r.attempts, 2);
        assert!(r.original_checksum.is_none());

        let r: RefreshRecord = serde_json::from_str(r#"{"status": "Archived"}"#).unwrap();
        assert_eq!(r.status, RefreshStatus::Pending);
    }

    #[test]
    fn record_uses_camel_case_on_disk() {
        let r = RefreshRecord {
            status: RefreshStatus::Verified,
            original_checksum: Some("ab".into()),
            last_modified_seen: 42,
            ..Default::default()
        };
        let s = serde_json::to_string(&r).unwrap();
        assert!(s.contains("\"originalChecksum\":\"ab\""));
        assert!(s.contains("\"lastModifiedSeen\":42"));
        assert!(s.contains("\"status\":\"Verified\""));
        assert!(!s.contains("lastError"));
    }

    #[test]
    fn unix_ms_handles_pre_epoch() {
        let t = UNIX_EPOCH - Duration::from_millis(1500);
        assert_eq!(unix_ms(t), -1500);
        assert_eq!(unix_ms(UNIX_EPOCH + Duration::from_millis(7)), 7);
    }
}
