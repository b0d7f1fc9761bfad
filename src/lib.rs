//! Cold data refresh: find files that have not been rewritten for a while and
//! rewrite them in place (stage + atomic replace), verifying content with
//! blake3 before and after, with a resumable on-disk ledger.

pub mod autotune;
pub mod bench;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod error;
pub mod fsio;
pub mod hw;
pub mod ledger;
pub mod refresh;
pub mod report;
pub mod types;
pub mod walker;

pub use cancel::CancelToken;
pub use config::RefreshConfig;
pub use error::{RefreshError, Result};
pub use ledger::{FileStore, Ledger, LedgerStore, MemoryStore};
pub use refresh::{FaultInjector, FaultPoint, RefreshEngine, refresh_tree};
pub use types::{FailedFile, FileEntry, RefreshRecord, RefreshStatus, Summary};
