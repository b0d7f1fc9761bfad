//! Persisted per-path refresh state.
//!
//! Layout on disk:
//! - `<ledger>.json`: snapshot `{ "version": 1, "records": { path: record } }`
//! - `<ledger>.json.journal`: one JSON op per line, appended after the snapshot
//!
//! `put` appends and fsyncs before returning. `remove` appends without fsync
//! and becomes durable at the next `commit`/`put`. `compact` folds the journal
//! into a fresh snapshot (atomic replace) and truncates the journal; replaying
//! a journal over a snapshot that already contains it is idempotent, so a crash
//! between those two steps loses nothing.

use crate::error::{RefreshError, Result};
use crate::fsio;
use crate::types::{RefreshRecord, RefreshStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LEDGER_VERSION: u32 = 1;
/// Journal ops before `put` triggers a compaction.
pub const COMPACT_AFTER: usize = 4096;

/// Where the ledger lives for `root` when not configured:
/// beside the root, e.g. `/data/photos` => `/data/.photos.coldrefresh.json`.
pub fn default_ledger_path(root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("root");
    let file = format!(".{name}.coldrefresh.json");
    match root.parent() {
        Some(parent) => parent.join(file),
        None => PathBuf::from(file),
    }
}

pub fn journal_path(ledger: &Path) -> PathBuf {
    let mut s = OsString::from(ledger.as_os_str());
    s.push(".journal");
    PathBuf::from(s)
}

/* =========================
   Store abstraction
   ========================= */

/// Durable byte storage behind the ledger.
pub trait LedgerStore: Send {
    /// Used in error messages.
    fn location(&self) -> PathBuf;

    /// Whether `location` is a real path on disk.
    fn is_file_backed(&self) -> bool {
        true
    }

    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>>;
    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn read_journal(&self) -> io::Result<Option<Vec<u8>>>;
    fn append_journal(&mut self, line: &[u8]) -> io::Result<()>;
    fn sync_journal(&mut self) -> io::Result<()>;
    fn truncate_journal(&mut self) -> io::Result<()>;
}

pub struct FileStore {
    snapshot: PathBuf,
    journal: PathBuf,
    journal_file: Option<File>,
}

impl FileStore {
    pub fn new(snapshot: impl Into<PathBuf>) -> Self {
        let snapshot = snapshot.into();
        let journal = journal_path(&snapshot);
        Self {
            snapshot,
            journal,
            journal_file: None,
        }
    }

    fn journal_handle(&mut self) -> io::Result<&mut File> {
        let f = match self.journal_file.take() {
            Some(f) => f,
            None => {
                if let Some(dir) = self.journal.parent() {
                    if !dir.as_os_str().is_empty() {
                        fs::create_dir_all(dir)?;
                    }
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.journal)?
            }
        };
        Ok(self.journal_file.insert(f))
    }
}

fn read_optional(p: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(p) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl LedgerStore for FileStore {
    fn location(&self) -> PathBuf {
        self.snapshot.clone()
    }

    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.snapshot)
    }

    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()> {
        fsio::write_atomic(&self.snapshot, bytes)
    }

    fn read_journal(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.journal)
    }

    fn append_journal(&mut self, line: &[u8]) -> io::Result<()> {
        self.journal_handle()?.write_all(line)
    }

    fn sync_journal(&mut self) -> io::Result<()> {
        self.journal_handle()?.sync_data()
    }

    fn truncate_journal(&mut self) -> io::Result<()> {
        self.journal_file = None;
        if !self.journal.exists() {
            return Ok(());
        }
        let f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.journal)?;
        f.sync_all()
    }
}

#[derive(Default)]
struct MemoryInner {
    snapshot: Option<Vec<u8>>,
    journal: Option<Vec<u8>>,
}

/// In-process store. Clones share the same bytes, so a ledger can be dropped
/// and loaded again to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal_bytes(&self) -> Vec<u8> {
        self.inner.lock().journal.clone().unwrap_or_default()
    }

    /// Overwrite the raw journal, e.g. to simulate a torn append.
    pub fn set_journal(&self, bytes: Vec<u8>) {
        self.inner.lock().journal = Some(bytes);
    }

    pub fn set_snapshot(&self, bytes: Vec<u8>) {
        self.inner.lock().snapshot = Some(bytes);
    }
}

impl LedgerStore for MemoryStore {
    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }

    fn is_file_backed(&self) -> bool {
        false
    }

    fn read_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.lock().snapshot = Some(bytes.to_vec());
        Ok(())
    }

    fn read_journal(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().journal.clone())
    }

    fn append_journal(&mut self, line: &[u8]) -> io::Result<()> {
        self.inner
            .lock()
            .journal
            .get_or_insert_with(Vec::new)
            .extend_from_slice(line);
        Ok(())
    }

    fn sync_journal(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_journal(&mut self) -> io::Result<()> {
        self.inner.lock().journal = None;
        Ok(())
    }
}

/* =========================
   Ledger
   ========================= */

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LedgerDoc {
    version: u32,
    records: BTreeMap<String, RefreshRecord>,
}

#[derive(Serialize)]
struct LedgerDocRef<'a> {
    version: u32,
    records: &'a BTreeMap<String, RefreshRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalOp {
    Put { path: String, record: RefreshRecord },
    Remove { path: String },
}

pub struct Ledger {
    store: Box<dyn LedgerStore>,
    records: BTreeMap<String, RefreshRecord>,
    journal_ops: usize,
    unsynced: bool,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("location", &self.store.location())
            .field("records", &self.records.len())
            .field("journal_ops", &self.journal_ops)
            .finish()
    }
}

impl Ledger {
    /// File-backed ledger at `path` (journal beside it).
    pub fn open(path: &Path) -> Result<Self> {
        Self::load(Box::new(FileStore::new(path)))
    }

    /// Open for inspection only: a torn journal tail is ignored in memory
    /// but left on disk, so nothing is written.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::load_inner(Box::new(FileStore::new(path)), false)
    }

    /// Read snapshot + journal. Absent => empty; unparseable => `Corruption`.
    pub fn load(store: Box<dyn LedgerStore>) -> Result<Self> {
        Self::load_inner(store, true)
    }

    fn load_inner(store: Box<dyn LedgerStore>, repair_torn: bool) -> Result<Self> {
        let location = store.location();
        let corrupt = |detail: String| RefreshError::Corruption {
            path: location.clone(),
            detail,
        };

        let mut records = match store.read_snapshot() {
            Ok(None) => BTreeMap::new(),
            Ok(Some(bytes)) => {
                let doc: LedgerDoc = serde_json::from_slice(&bytes)
                    .map_err(|e| corrupt(format!("snapshot: {e}")))?;
                if doc.version > LEDGER_VERSION {
                    warn!(version = doc.version, "ledger written by a newer version, reading known fields");
                }
                doc.records
            }
            Err(e) => return Err(corrupt(format!("snapshot unreadable: {e}"))),
        };

        let journal = store
            .read_journal()
            .map_err(|e| corrupt(format!("journal unreadable: {e}")))?
            .unwrap_or_default();
        let (applied, torn) = replay(&journal, &mut records).map_err(corrupt)?;

        let mut ledger = Self {
            store,
            records,
            journal_ops: applied,
            unsynced: false,
        };
        debug!(records = ledger.records.len(), journal_ops = applied, "ledger loaded");

        if torn && repair_torn {
            warn!(location = %location.display(), "journal tail was torn, compacting");
            // appending after garbage would corrupt the next load
            ledger.compact()?;
        } else if torn {
            warn!(location = %location.display(), "journal tail is torn, ignoring it");
        }
        Ok(ledger)
    }

    pub fn get(&self, path: &str) -> Option<&RefreshRecord> {
        self.records.get(path)
    }

    /// Upsert, durable before returning.
    pub fn put(&mut self, path: &str, record: RefreshRecord) -> Result<()> {
        let op = JournalOp::Put {
            path: path.to_string(),
            record: record.clone(),
        };
        self.append(&op)?;
        self.sync()?;
        self.records.insert(path.to_string(), record);

        if self.journal_ops >= COMPACT_AFTER {
            self.compact()?;
        }
        Ok(())
    }

    /// Drop a record. Durable at the next `commit`/`put`.
    pub fn remove(&mut self, path: &str) -> Result<Option<RefreshRecord>> {
        if !self.records.contains_key(path) {
            return Ok(None);
        }
        self.append(&JournalOp::Remove {
            path: path.to_string(),
        })?;
        self.unsynced = true;
        Ok(self.records.remove(path))
    }

    /// Durability barrier for anything staged since the last sync.
    pub fn commit(&mut self) -> Result<()> {
        if self.unsynced {
            self.sync()?;
        }
        Ok(())
    }

    /// Fold the journal into a new snapshot.
    pub fn compact(&mut self) -> Result<()> {
        let doc = LedgerDocRef {
            version: LEDGER_VERSION,
            records: &self.records,
        };
        let bytes =
            serde_json::to_vec_pretty(&doc).map_err(|e| self.ledger_err(io::Error::other(e)))?;

        self.store
            .write_snapshot(&bytes)
            .map_err(|e| self.ledger_err(e))?;
        self.store
            .truncate_journal()
            .map_err(|e| self.ledger_err(e))?;
        info!(records = self.records.len(), folded_ops = self.journal_ops, "ledger compacted");
        self.journal_ops = 0;
        self.unsynced = false;
        Ok(())
    }

    /// Compact and release the store.
    pub fn close(mut self) -> Result<()> {
        self.compact()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RefreshRecord)> {
        self.records.iter()
    }

    /// Keys under `prefix` (a directory path string).
    pub fn keys_under(&self, prefix: &Path) -> Vec<String> {
        self.records
            .keys()
            .filter(|k| Path::new(k.as_str()).starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut out = BTreeMap::new();
        for r in self.records.values() {
            let k = match r.status {
                RefreshStatus::Pending => "pending",
                RefreshStatus::InProgress => "in_progress",
                RefreshStatus::Verified => "verified",
                RefreshStatus::Failed => "failed",
            };
            *out.entry(k).or_insert(0) += 1;
        }
        out
    }

    pub fn location(&self) -> PathBuf {
        self.store.location()
    }

    pub fn is_file_backed(&self) -> bool {
        self.store.is_file_backed()
    }

    fn append(&mut self, op: &JournalOp) -> Result<()> {
        let mut line = serde_json::to_vec(op).map_err(|e| self.ledger_err(io::Error::other(e)))?;
        line.push(b'\n');
        self.store
            .append_journal(&line)
            .map_err(|e| self.ledger_err(e))?;
        self.journal_ops += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.store.sync_journal().map_err(|e| self.ledger_err(e))?;
        self.unsynced = false;
        Ok(())
    }

    fn ledger_err(&self, source: io::Error) -> RefreshError {
        RefreshError::Ledger {
            path: self.store.location(),
            source,
        }
    }
}

/// Apply journal lines. Returns (ops applied, tail without newline seen).
fn replay(
    journal: &[u8],
    records: &mut BTreeMap<String, RefreshRecord>,
) -> std::result::Result<(usize, bool), String> {
    let mut applied = 0;
    let mut lines = journal.split(|b| *b == b'\n').peekable();
    let mut lineno = 0;

    while let Some(line) = lines.next() {
        lineno += 1;
        let is_last = lines.peek().is_none();
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<JournalOp>(line) {
            Ok(JournalOp::Put { path, record }) => {
                records.insert(path, record);
            }
            Ok(JournalOp::Remove { path }) => {
                records.remove(&path);
            }
            // no trailing newline => the append never finished
            Err(_) if is_last => return Ok((applied, true)),
            Err(e) => return Err(format!("journal line {lineno}: {e}")),
        }
        applied += 1;
        if is_last {
            // complete op but no newline: the next append must not share its line
            return Ok((applied, true));
        }
    }
    Ok((applied, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verified(seen: i64) -> RefreshRecord {
        RefreshRecord {
            status: RefreshStatus::Verified,
            original_checksum: Some("abc".into()),
            attempts: 1,
            last_modified_seen: seen,
            ..Default::default()
        }
    }

    #[test]
    fn absent_store_is_empty() {
        let ledger = Ledger::load(Box::new(MemoryStore::new())).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn put_survives_reload_without_compaction() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::load(Box::new(store.clone())).unwrap();
        ledger.put("/a", verified(1)).unwrap();
        ledger.put("/b", verified(2)).unwrap();
        drop(ledger); // crash: no close

        let ledger = Ledger::load(Box::new(store)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get("/b").unwrap().last_modified_seen, 2);
    }

    #[test]
    fn remove_then_commit_is_replayed() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::load(Box::new(store.clone())).unwrap();
        ledger.put("/a", verified(1)).unwrap();
        assert!(ledger.remove("/a").unwrap().is_some());
        assert!(ledger.remove("/a").unwrap().is_none());
        ledger.commit().unwrap();
        drop(ledger);

        let ledger = Ledger::load(Box::new(store)).unwrap();
        assert!(ledger.get("/a").is_none());
    }

    #[test]
    fn torn_tail_is_dropped_and_compacted() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::load(Box::new(store.clone())).unwrap();
        ledger.put("/a", verified(1)).unwrap();
        drop(ledger);

        let mut j = store.journal_bytes();
        j.extend_from_slice(br#"{"op":"put","path":"/b","rec"#);
        store.set_journal(j);

        let ledger = Ledger::load(Box::new(store.clone())).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.get("/a").is_some());
        assert!(store.journal_bytes().is_empty());
    }

    #[test]
    fn garbage_in_middle_of_journal_is_corruption() {
        let store = MemoryStore::new();
        store.set_journal(b"not json\n{\"op\":\"remove\",\"path\":\"/a\"}\n".to_vec());
        let err = Ledger::load(Box::new(store)).unwrap_err();
        assert!(matches!(err, RefreshError::Corruption { .. }));
    }

    #[test]
    fn corrupt_snapshot_is_corruption() {
        let store = MemoryStore::new();
        store.set_snapshot(b"{ \"records\": [1, 2".to_vec());
        let err = Ledger::load(Box::new(store)).unwrap_err();
        assert!(matches!(err, RefreshError::Corruption { .. }));
    }

    #[test]
    fn older_snapshot_without_fields_loads_as_pending() {
        let store = MemoryStore::new();
        store.set_snapshot(br#"{"records":{"/old":{"attempts":1}}}"#.to_vec());
        let ledger = Ledger::load(Box::new(store)).unwrap();
        let r = ledger.get("/old").unwrap();
        assert_eq!(r.status, RefreshStatus::Pending);
        assert_eq!(r.attempts, 1);
    }

    #[test]
    fn compaction_folds_journal_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.put("/a", verified(1)).unwrap();
        ledger.put("/b", verified(2)).unwrap();
        ledger.remove("/a").unwrap();
        ledger.close().unwrap();

        assert_eq!(fs::metadata(journal_path(&path)).unwrap().len(), 0);
        let snap = fs::read_to_string(&path).unwrap();
        assert!(snap.contains("\"/b\""));
        assert!(!snap.contains("\"/a\""));

        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.counts().get("verified"), Some(&1));
    }

    #[test]
    fn read_only_open_leaves_torn_journal_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.put("/a", verified(1)).unwrap();
        drop(ledger);

        let journal = journal_path(&path);
        let mut bytes = fs::read(&journal).unwrap();
        bytes.extend_from_slice(b"{\"op\":\"pu");
        fs::write(&journal, &bytes).unwrap();

        let ledger = Ledger::open_read_only(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        drop(ledger);
        assert_eq!(fs::read(&journal).unwrap(), bytes);
        assert!(!path.exists());

        // a regular open repairs it
        let ledger = Ledger::open(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(path.exists());
        assert_eq!(fs::metadata(&journal).unwrap().len(), 0);
    }

    #[test]
    fn memory_store_is_not_file_backed() {
        let ledger = Ledger::load(Box::new(MemoryStore::new())).unwrap();
        assert!(!ledger.is_file_backed());
        let dir = tempfile::tempdir().unwrap();
        assert!(Ledger::open(&dir.path().join("l.json")).unwrap().is_file_backed());
    }

    #[test]
    fn keys_under_matches_whole_components() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::load(Box::new(store)).unwrap();
        ledger.put("/data/a", verified(1)).unwrap();
        ledger.put("/data2/b", verified(1)).unwrap();
        assert_eq!(ledger.keys_under(Path::new("/data")), vec!["/data/a".to_string()]);
    }

    #[test]
    fn default_path_sits_beside_root() {
        assert_eq!(
            default_ledger_path(Path::new("/data/photos")),
            PathBuf::from("/data/.photos.coldrefresh.json")
        );
        assert_eq!(
            journal_path(Path::new("/data/.photos.coldrefresh.json")),
            PathBuf::from("/data/.photos.coldrefresh.json.journal")
        );
    }
}
