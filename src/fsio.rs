//! File helpers shared by the engine and the ledger: lock-contention retry,
//! streamed blake3 hashing, directory fsync.

use crate::error::{RefreshError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const FIRST_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lock-contention style errors worth waiting out.
fn is_busy(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ResourceBusy
    ) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(e.raw_os_error(), Some(32) | Some(33))
}

/// Run `op`, retrying busy errors with exponential backoff until `timeout`.
pub fn retry_busy<T>(
    path: &Path,
    timeout: Duration,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let start = Instant::now();
    let mut backoff = FIRST_BACKOFF;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) => {
                let waited = start.elapsed();
                if waited >= timeout {
                    return Err(RefreshError::Timeout {
                        path: path.to_path_buf(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                debug!(path = %path.display(), error = %e, backoff_ms = backoff.as_millis() as u64, "busy, retrying");
                thread::sleep(backoff.min(timeout - waited));
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(RefreshError::from_io(path, e)),
        }
    }
}

pub fn open_read(path: &Path, timeout: Duration) -> Result<File> {
    retry_busy(path, timeout, || File::open(path))
}

/// read() that swallows EINTR
fn read_some(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match r.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Streamed blake3 of the whole file, hex encoded.
pub fn hash_file(path: &Path, buffer_size: usize, timeout: Duration) -> Result<String> {
    let mut f = open_read(path, timeout)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = read_some(&mut f, &mut buf).map_err(|e| RefreshError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Copy `src` into `dst`, hashing the bytes that were written.
/// Returns (bytes, blake3 hex).
pub fn copy_hashing(
    src: &mut impl Read,
    dst: &mut impl Write,
    buffer_size: usize,
) -> io::Result<(u64, String)> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = read_some(src, &mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    dst.flush()?;
    Ok((total, hasher.finalize().to_hex().to_string()))
}

/// Make a rename inside `dir` durable. No-op where directories can't be opened.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Write `bytes` to `path` atomically: sibling temp file, fsync, rename, dir fsync.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let stem = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "ledger".to_string());

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{stem}."))
        .suffix(crate::walker::STAGING_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn hash_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&p, &data).unwrap();

        let expected = blake3::hash(&data).to_hex().to_string();
        // odd buffer size so chunks don't line up
        assert_eq!(hash_file(&p, 4099, Duration::from_secs(1)).unwrap(), expected);
    }

    #[test]
    fn copy_hashing_reports_length_and_digest() {
        let src = b"hello cold data".to_vec();
        let mut out = Vec::new();
        let (n, h) = copy_hashing(&mut src.as_slice(), &mut out, 4).unwrap();
        assert_eq!(n, src.len() as u64);
        assert_eq!(out, src);
        assert_eq!(h, blake3::hash(&src).to_hex().to_string());
    }

    #[test]
    fn retry_busy_waits_out_transient_errors() {
        let calls = Cell::new(0);
        let v = retry_busy(Path::new("/x"), Duration::from_secs(5), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_busy_times_out() {
        let err = retry_busy::<()>(Path::new("/x"), Duration::from_millis(60), || {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        })
        .unwrap_err();
        assert!(matches!(err, RefreshError::Timeout { .. }));
    }

    #[test]
    fn retry_busy_does_not_retry_hard_errors() {
        let calls = Cell::new(0);
        let err = retry_busy::<()>(Path::new("/x"), Duration::from_secs(5), || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound))
        })
        .unwrap_err();
        assert!(matches!(err, RefreshError::NotFound(_)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("doc.json");
        write_atomic(&p, b"one").unwrap();
        write_atomic(&p, b"two").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
