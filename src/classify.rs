use crate::types::FileEntry;
use std::time::{Duration, SystemTime};

const SECS_PER_DAY: u64 = 86_400;

/// Cold = not written for at least `threshold_days`. 0 => everything is cold.
///
/// `now` is one snapshot per run so a long scan classifies consistently.
pub fn is_cold(entry: &FileEntry, now: SystemTime, threshold_days: u32) -> bool {
    if threshold_days == 0 {
        return true;
    }
    let threshold = Duration::from_secs(u64::from(threshold_days) * SECS_PER_DAY);
    // mtime in the future => Err => not cold
    now.duration_since(entry.modified)
        .map(|age| age >= threshold)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn aged(now: SystemTime, secs: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from("/f"),
            size: 1,
            modified: now - Duration::from_secs(secs),
        }
    }

    #[test]
    fn zero_threshold_matches_everything() {
        let now = SystemTime::now();
        assert!(is_cold(&aged(now, 0), now, 0));
        let future = FileEntry {
            modified: now + Duration::from_secs(3600),
            ..aged(now, 0)
        };
        assert!(is_cold(&future, now, 0));
    }

    #[test]
    fn boundary_is_inclusive() {
        let now = SystemTime::now();
        let n = 30;
        assert!(!is_cold(&aged(now, (n - 1) * SECS_PER_DAY), now, n as u32));
        assert!(!is_cold(&aged(now, n * SECS_PER_DAY - 1), now, n as u32));
        assert!(is_cold(&aged(now, n * SECS_PER_DAY), now, n as u32));
        assert!(is_cold(&aged(now, 400 * SECS_PER_DAY), now, n as u32));
    }

    #[test]
    fn future_mtime_is_never_cold() {
        let now = SystemTime::now();
        let e = FileEntry {
            modified: now + Duration::from_secs(10),
            ..aged(now, 0)
        };
        assert!(!is_cold(&e, now, 1));
    }
}
