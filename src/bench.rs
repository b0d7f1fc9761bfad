use crate::cancel::CancelToken;
use crate::config::RefreshConfig;
use crate::refresh::refresh_tree;
use crate::types::SizeCounts;
use anyhow::{Context, Result};
use filetime::FileTime;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::info;

const MIB: usize = 1024 * 1024;
const ONE_YEAR: Duration = Duration::from_secs(365 * 86_400);

/// Write `count` pseudo-random files (blake3 XOF stream) cycling through
/// `sizes_mb`, with mtime one year back so they classify as cold.
pub fn create_test_files(dir: &Path, count: usize, sizes_mb: &[u64]) -> Result<Vec<PathBuf>> {
    anyhow::ensure!(!sizes_mb.is_empty(), "sizes_mb must not be empty");
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let old = FileTime::from_system_time(SystemTime::now() - ONE_YEAR);
    let mut out = Vec::with_capacity(count);
    let mut chunk = vec![0u8; MIB];

    for i in 0..count {
        let size_mb = sizes_mb[i % sizes_mb.len()];
        let path = dir.join(format!("test_file_{}_{}MB.dat", i + 1, size_mb));

        let mut xof = blake3::Hasher::new()
            .update(&(i as u64).to_le_bytes())
            .finalize_xof();
        let f = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(f);
        for _ in 0..size_mb {
            xof.fill(&mut chunk);
            w.write_all(&chunk)?;
        }
        w.flush()?;
        drop(w);

        filetime::set_file_mtime(&path, old)
            .with_context(|| format!("set mtime {}", path.display()))?;
        out.push(path);
    }

    info!(dir = %dir.display(), files = out.len(), "test files created");
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchIteration {
    pub iteration: usize,
    pub total_files: u64,
    pub total_time: f64,
    pub avg_speed_mb_s: f64,
    pub files_refreshed: u64,
    pub failed_files: u64,
    pub file_categories: SizeCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchSummary {
    pub avg_time: f64,
    pub avg_speed: f64,
    pub total_iterations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub benchmark_results: Vec<BenchIteration>,
    pub summary: BenchSummary,
}

/// Refresh everything under `dir` `iterations` times, each with a fresh
/// throwaway ledger so every run does the full work.
pub fn run_benchmark(
    dir: &Path,
    iterations: usize,
    base: &RefreshConfig,
    cancel: CancelToken,
) -> Result<BenchReport> {
    let mut results = Vec::with_capacity(iterations);

    for i in 0..iterations {
        if cancel.is_cancelled() {
            break;
        }
        let scratch = tempfile::tempdir().context("create scratch dir for ledger")?;
        let cfg = RefreshConfig {
            ledger_path: Some(scratch.path().join("bench.coldrefresh.json")),
            failure_log: Some(scratch.path().join("bench.failures.log")),
            ..base.clone()
        };

        let s = refresh_tree(dir, 0, &cfg, cancel.clone())
            .with_context(|| format!("benchmark iteration {}", i + 1))?;

        let it = BenchIteration {
            iteration: i + 1,
            total_files: s.scanned,
            total_time: s.elapsed_ms as f64 / 1000.0,
            avg_speed_mb_s: s.throughput_mb_s(),
            files_refreshed: s.refreshed,
            failed_files: s.failed,
            file_categories: s.categories.clone(),
        };
        info!(
            iteration = it.iteration,
            secs = %format!("{:.2}", it.total_time),
            mb_s = %format!("{:.2}", it.avg_speed_mb_s),
            "benchmark iteration done"
        );
        results.push(it);
    }

    let n = results.len().max(1) as f64;
    let summary = BenchSummary {
        avg_time: results.iter().map(|r| r.total_time).sum::<f64>() / n,
        avg_speed: results.iter().map(|r| r.avg_speed_mb_s).sum::<f64>() / n,
        total_iterations: results.len(),
    };
    Ok(BenchReport {
        benchmark_results: results,
        summary,
    })
}

pub fn save_results(report: &BenchReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let s = serde_json::to_string_pretty(report)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_are_cold_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let files = create_test_files(dir.path(), 3, &[1]).unwrap();
        assert_eq!(files.len(), 3);

        let a = fs::read(&files[0]).unwrap();
        let b = fs::read(&files[1]).unwrap();
        assert_eq!(a.len(), MIB);
        assert_ne!(a, b);

        let age = SystemTime::now()
            .duration_since(fs::metadata(&files[2]).unwrap().modified().unwrap())
            .unwrap();
        assert!(age >= ONE_YEAR - Duration::from_secs(60));
    }

    #[test]
    fn benchmark_refreshes_everything_each_iteration() {
        let data = tempfile::tempdir().unwrap();
        create_test_files(data.path(), 2, &[1]).unwrap();

        let report = run_benchmark(data.path(), 2, &RefreshConfig::default(), CancelToken::new())
            .unwrap();
        assert_eq!(report.summary.total_iterations, 2);
        for it in &report.benchmark_results {
            assert_eq!(it.files_refreshed, 2);
            assert_eq!(it.failed_files, 0);
        }

        let out = data.path().join("results").join("bench.json");
        save_results(&report, &out).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&fs::read(&out).unwrap()).unwrap();
        assert_eq!(v["summary"]["total_iterations"], 2);
    }
}
