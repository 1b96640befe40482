mod config;
mod cpu;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};

use stope_core::pool::strategy::Strategy;
use stope_core::{Core, Options, PoolConfig};

use config::Config;
use cpu::CpuDriver;

#[derive(Parser, Debug)]
#[command(
    name = "stope-miner",
    version,
    about = "Pool-multiplexing mining coordinator",
    long_about = None
)]
struct Cli {
    /// Pool URL (stratum+tcp://host:port or http://host:port); repeatable,
    /// priority follows the order given
    #[arg(short = 'o', long = "pool")]
    pools: Vec<String>,

    /// Username (or wallet.worker) used for every pool given on the CLI
    #[arg(short, long, default_value = "")]
    user: String,

    /// Password used for every pool given on the CLI
    #[arg(short, long, default_value = "x")]
    pass: String,

    /// Pool strategy: failover, round-robin, rotate, load-balance, balance
    #[arg(short, long)]
    strategy: Option<String>,

    /// Minutes between switches under the rotate strategy
    #[arg(long)]
    rotate_period: Option<u64>,

    /// Only mine from the highest-priority alive pool
    #[arg(long)]
    failover_only: bool,

    /// Number of CPU mining threads (0 = one per CPU)
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Works staged ahead per mining thread
    #[arg(long)]
    queue: Option<usize>,

    /// Seconds a work may mine before being considered exhausted
    #[arg(long)]
    scantime: Option<u64>,

    /// Seconds before an unsubmitted share is abandoned
    #[arg(long)]
    expiry: Option<u64>,

    /// Thermal cutoff in degrees C
    #[arg(long)]
    cutoff_temp: Option<f32>,

    /// Degrees below cutoff before a device re-enables
    #[arg(long)]
    hysteresis: Option<f32>,

    /// Share difficulty to suggest to stratum pools
    #[arg(long)]
    suggest_diff: Option<f64>,

    /// Seconds between hashmeter lines
    #[arg(long)]
    log_interval: Option<u64>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mine deterministic benchmark work, no pools needed
    #[arg(long)]
    benchmark: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Errors and warnings only
    #[arg(short, long)]
    quiet: bool,
}

fn init_logger(cli: &Cli, cfg: &Config) {
    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        cfg.logging.level.as_str()
    };
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();
}

fn build_options(cli: &Cli, cfg: &Config) -> Result<Options> {
    let strategy_name = cli
        .strategy
        .clone()
        .unwrap_or_else(|| cfg.mining.strategy.clone());
    let strategy = Strategy::from_str(&strategy_name)
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid --strategy")?;

    let mut opts = Options::default();
    opts.strategy = strategy;
    opts.rotate_period = Duration::from_secs(
        60 * cli.rotate_period.unwrap_or(cfg.mining.rotate_period_mins),
    );
    opts.queue_depth = cli.queue.unwrap_or(cfg.mining.queue);
    opts.scantime = Duration::from_secs(cli.scantime.unwrap_or(cfg.mining.scantime));
    opts.expiry = Duration::from_secs(cli.expiry.unwrap_or(cfg.mining.expiry));
    opts.cutoff_temp = cli.cutoff_temp.unwrap_or(cfg.hardware.cutoff_temp);
    opts.hysteresis = cli.hysteresis.unwrap_or(cfg.hardware.hysteresis);
    opts.failover_only = cli.failover_only || cfg.mining.failover_only;
    opts.log_interval =
        Duration::from_secs(cli.log_interval.unwrap_or(cfg.logging.interval).max(1));
    opts.benchmark = cli.benchmark;
    opts.suggest_diff = cli.suggest_diff.or(cfg.mining.suggest_difficulty);
    Ok(opts)
}

fn register_pools(core: &Arc<Core>, cli: &Cli, cfg: &Config) -> Result<()> {
    for entry in &cfg.pools {
        core.add_pool(PoolConfig {
            url: entry.url.clone(),
            user: entry.user.clone(),
            pass: entry.pass.clone(),
            prio: entry.prio,
            quota: entry.quota,
        });
    }
    let base_prio = cfg.pools.len();
    for (i, url) in cli.pools.iter().enumerate() {
        core.add_pool(PoolConfig {
            url: url.clone(),
            user: cli.user.clone(),
            pass: cli.pass.clone(),
            prio: base_prio + i,
            quota: 1,
        });
    }
    if core.pools.count() == 0 && !cli.benchmark {
        bail!("no pools configured; pass --pool or a config file (or --benchmark)");
    }
    Ok(())
}

fn worker_suffix() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match cli.config.clone().or_else(Config::default_path) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    init_logger(&cli, &cfg);

    println!(
        "{} v{} ({})",
        "stope-miner".bold(),
        env!("CARGO_PKG_VERSION"),
        worker_suffix()
    );

    let opts = build_options(&cli, &cfg)?;
    let core = Core::new(opts, tokio::runtime::Handle::current());
    register_pools(&core, &cli, &cfg)?;

    let threads = if cli.threads > 0 {
        cli.threads
    } else if cfg.hardware.cpu_threads > 0 {
        cfg.hardware.cpu_threads
    } else {
        num_cpus::get()
    };
    core.add_device(CpuDriver::spec(threads), CpuDriver::kind());
    info!("cpu mining on {} threads", threads);

    let handles = core.start();

    let shutdown_core = Arc::clone(&core);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received");
            shutdown_core.kill_work();
        }
    });

    // Park until shutdown is requested from anywhere.
    let mut rx = core.shutdown_rx();
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }

    let summary_core = Arc::clone(&core);
    tokio::task::spawn_blocking(move || handles.join())
        .await
        .ok();
    info!("{}", summary_core.stats.summary());

    if core.restart_requested() {
        restart_binary()?;
    }
    Ok(())
}

/// Re-exec the binary in place after a requested restart.
#[cfg(unix)]
fn restart_binary() -> Result<()> {
    use std::os::unix::process::CommandExt;
    let exe = std::env::current_exe().context("locating current executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    info!("restarting {}", exe.display());
    let err = std::process::Command::new(exe).args(args).exec();
    bail!("exec failed: {}", err);
}

#[cfg(not(unix))]
fn restart_binary() -> Result<()> {
    warn!("restart requested, but re-exec is unsupported on this platform");
    Ok(())
}
