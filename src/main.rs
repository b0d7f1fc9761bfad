mod app;

use clap::{Parser, Subcommand};
use cold_refresh::{CancelToken, RefreshConfig, bench, config, hw};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Refresh cold data by rewriting long-unwritten files in place")]
struct Cli {
    /// YAML config (see RefreshConfig)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh files under ROOT not modified for DAYS days (0 = all files).
    Run {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value_t = 0)]
        days: u32,
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Skip files smaller than this many bytes.
        #[arg(long)]
        min_size: Option<u64>,
    },
    /// Show ledger state for ROOT.
    Status {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Write pseudo-random test files aged one year.
    CreateTestFiles {
        #[arg(long, default_value = "./benchmark_test")]
        dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, value_delimiter = ',', default_value = "1,10,100")]
        sizes_mb: Vec<u64>,
    },
    /// Refresh DIR several times with throwaway ledgers and report throughput.
    Benchmark {
        #[arg(long, default_value = "./benchmark_test")]
        dir: PathBuf,
        #[arg(long, default_value_t = 3)]
        iterations: usize,
        #[arg(long, default_value = "benchmark_results.json")]
        out: PathBuf,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<RefreshConfig> {
    let mut cfg = match &cli.config {
        Some(p) => config::load_yaml(p)?
            .ok_or_else(|| anyhow::anyhow!("config not found: {}", p.display()))?,
        None => RefreshConfig::default(),
    };
    if cli.workers.is_some() {
        cfg.workers = cli.workers;
    }
    Ok(cfg)
}

/// First SIGINT/SIGTERM sets the flag; a second SIGINT exits immediately
/// (still safe: replacement is an atomic rename).
fn install_signals(cancel: &CancelToken) -> anyhow::Result<()> {
    let flag = cancel.flag();
    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, flag.clone())?;
    signal_hook::flag::register(SIGINT, flag.clone())?;
    signal_hook::flag::register(SIGTERM, flag)?;
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut refresh = load_config(&cli)?;

    let cancel = CancelToken::new();
    install_signals(&cancel)?;

    match cli.cmd {
        Commands::Run {
            root,
            days,
            ledger,
            max_attempts,
            min_size,
        } => {
            if ledger.is_some() {
                refresh.ledger_path = ledger;
            }
            if let Some(n) = max_attempts {
                refresh.max_attempts = n;
            }
            if let Some(n) = min_size {
                refresh.min_size_bytes = n;
            }

            println!("ROOT      = {:?}", root);
            println!("THRESHOLD = {} day(s){}", days, if days == 0 { " (all files)" } else { "" });

            let hwinfo = hw::detect_hw(&root);
            let cfg = app::AppConfig {
                root,
                threshold_days: days,
                refresh,
                hw: hwinfo,
            };
            let summary = app::run(&cfg, cancel)?;

            if summary.cancelled {
                return Ok(ExitCode::from(130));
            }
            if !summary.is_clean() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Status { root, ledger } => {
            if ledger.is_some() {
                refresh.ledger_path = ledger;
            }
            app::status(&root, &refresh)?;
        }
        Commands::CreateTestFiles {
            dir,
            count,
            sizes_mb,
        } => {
            bench::create_test_files(&dir, count, &sizes_mb)?;
            println!("Test files written to {}", dir.display());
        }
        Commands::Benchmark {
            dir,
            iterations,
            out,
        } => {
            if !dir.exists() {
                println!("Test dir not found: {}", dir.display());
                println!("Create it first with `create-test-files --dir {}`", dir.display());
                return Ok(ExitCode::from(2));
            }
            let report = bench::run_benchmark(&dir, iterations, &refresh, cancel)?;
            bench::save_results(&report, &out)?;

            println!("\n=== BENCHMARK ===");
            println!("Avg time   : {:.2}s", report.summary.avg_time);
            println!("Avg speed  : {:.2} MB/s", report.summary.avg_speed);
            println!("Iterations : {}", report.summary.total_iterations);
            println!("Saved to   : {}", out.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}
