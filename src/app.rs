use cold_refresh::hw::HwInfo;
use cold_refresh::ledger::{self, Ledger};
use cold_refresh::types::{RefreshStatus, RunMode, Summary};
use cold_refresh::{CancelToken, RefreshConfig, autotune, refresh_tree, walker};

use anyhow::{Context, Result};
use std::path::PathBuf;

pub struct AppConfig {
    pub root: PathBuf,
    pub threshold_days: u32,
    pub refresh: RefreshConfig,
    pub hw: HwInfo,
}

/* =========================
   Helpers
   ========================= */

fn size_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn ledger_path(root: &std::path::Path, refresh: &RefreshConfig) -> PathBuf {
    refresh
        .ledger_path
        .clone()
        .unwrap_or_else(|| ledger::default_ledger_path(root))
}

/* =========================
   Run
   ========================= */

pub fn run(cfg: &AppConfig, cancel: CancelToken) -> Result<Summary> {
    let mut refresh = cfg.refresh.clone();
    let workers = autotune::resolve_workers(refresh.workers, &cfg.hw);
    refresh.workers = Some(workers);

    println!(
        "AUTO-TUNE: disk={:?}, cores={}, workers={} (override={:?}), mode={:?}",
        cfg.hw.disk_kind,
        cfg.hw.logical_cpus,
        workers,
        cfg.refresh.workers,
        RunMode::for_workers(workers)
    );

    let summary = refresh_tree(&cfg.root, cfg.threshold_days, &refresh, cancel)
        .with_context(|| format!("refresh {}", cfg.root.display()))?;

    print_summary(&summary);
    Ok(summary)
}

pub fn print_summary(s: &Summary) {
    println!("\n=== REFRESH SUMMARY ===");
    println!("Scanned     : {}", s.scanned);
    println!("Refreshed   : {} ({:.1} MB)", s.refreshed, size_mb(s.bytes_refreshed));
    println!("Skipped     : {}", s.skipped);
    println!("Failed      : {}", s.failed);
    println!(
        "Categories  : large(>100MB)={} medium(10-100MB)={} small(<10MB)={}",
        s.categories.large, s.categories.medium, s.categories.small
    );
    println!(
        "Elapsed     : {:.1}s  ({:.1} MB/s)",
        s.elapsed_ms as f64 / 1000.0,
        s.throughput_mb_s()
    );
    if s.cancelled {
        println!("Status      : CANCELLED (re-run to continue)");
    }

    if !s.failures.is_empty() {
        println!("\nFailed this run:");
        for f in &s.failures {
            println!("  - {}\n    {}", f.path.display(), f.reason);
        }
    }
    if !s.unrecoverable.is_empty() {
        println!("\nUnrecoverable (retry limit reached, no longer attempted):");
        for f in &s.unrecoverable {
            println!("  - {}\n    {}", f.path.display(), f.reason);
        }
    }
}

/* =========================
   Status
   ========================= */

pub fn status(root: &std::path::Path, refresh: &RefreshConfig) -> Result<()> {
    let root = walker::check_root(root)?;
    let path = ledger_path(&root, refresh);
    let ledger = Ledger::open_read_only(&path)?;

    println!("=== LEDGER ===");
    println!("Path    : {}", path.display());
    println!("Records : {}", ledger.len());
    for (status, n) in ledger.counts() {
        println!("  {:<12} {}", status, n);
    }

    let failed: Vec<_> = ledger
        .iter()
        .filter(|(_, r)| r.status == RefreshStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!("\nFailed:");
        for (p, r) in failed {
            let gave_up = if r.attempts >= refresh.max_attempts {
                " [gave up]"
            } else {
                ""
            };
            println!(
                "  - {} (attempts={}){}\n    {}",
                p,
                r.attempts,
                gave_up,
                r.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}
