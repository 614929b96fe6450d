//! s3nbd-sync: cache synchronization and eviction tool.
//!
//! Runs alongside (or without) the s3nbdd daemon, typically from a timer
//! unit or cron. `sync` uploads recently written chunks; `evict` frees
//! cache space when the filesystem fills up. Safe to run while the daemon
//! serves clients: busy chunks are skipped, never waited on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use s3nbd::s3::Pool;
use s3nbd::sync::{statvfs_usage, Syncer, UsageProbe};
use s3nbd::{Config, Device};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "s3nbd-sync", about = "Sync and evict s3nbd chunk caches")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/s3nbd/s3nbd.toml")]
    config: std::path::PathBuf,

    /// Only process this device (default: all configured devices)
    #[arg(long)]
    device: Option<String>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload differing chunks to the backend, most recently used first
    Sync {
        /// Stop after this many seconds
        #[arg(long, default_value_t = 300)]
        runtime_seconds: u64,

        /// Window start in the atime-sorted chunk list, in percent
        #[arg(long, default_value_t = 0)]
        start_pct: u8,

        /// Window end (exclusive), in percent
        #[arg(long, default_value_t = 100)]
        stop_pct: u8,
    },

    /// Delete cold chunks when cache usage exceeds the limit
    Evict {
        /// Start evicting above this filesystem usage, in percent
        #[arg(long, default_value_t = 90)]
        max_used_pct: u8,

        /// Stop evicting at or below this usage, in percent
        #[arg(long, default_value_t = 70)]
        min_used_pct: u8,

        /// Window start in the atime-sorted chunk list, in percent
        #[arg(long, default_value_t = 0)]
        start_pct: u8,

        /// Window end (exclusive), in percent
        #[arg(long, default_value_t = 100)]
        stop_pct: u8,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("load config {:?}", args.config))?;

    let devices: Vec<Device> = match &args.device {
        Some(name) => {
            let device = config
                .devices
                .iter()
                .find(|d| &d.name == name)
                .with_context(|| format!("device {name:?} not in config"))?;
            vec![device.clone()]
        }
        None => config.devices.clone(),
    };
    if devices.is_empty() {
        bail!("no devices configured");
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            running.store(false, Ordering::Relaxed);
        })
        .context("install signal handler")?;
    }

    let pool = Arc::new(Pool::new(config.s3.clone()));
    let syncer = Syncer::new(pool, Arc::clone(&running));

    match args.command {
        Command::Sync {
            runtime_seconds,
            start_pct,
            stop_pct,
        } => {
            if start_pct >= stop_pct || stop_pct > 100 {
                bail!("window must satisfy start_pct < stop_pct <= 100");
            }
            let budget = Duration::from_secs(runtime_seconds);
            for device in &devices {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                syncer
                    .sync_device(device, start_pct, stop_pct, budget)
                    .with_context(|| format!("sync device {:?}", device.name))?;
            }
        }

        Command::Evict {
            max_used_pct,
            min_used_pct,
            start_pct,
            stop_pct,
        } => {
            if min_used_pct >= max_used_pct || max_used_pct > 100 {
                bail!("thresholds must satisfy min_used_pct < max_used_pct <= 100");
            }
            if start_pct >= stop_pct || stop_pct > 100 {
                bail!("window must satisfy start_pct < stop_pct <= 100");
            }
            let probe: UsageProbe = Box::new(statvfs_usage);
            for device in &devices {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let report = syncer
                    .evict_device(device, max_used_pct, min_used_pct, start_pct, stop_pct, &probe)
                    .with_context(|| format!("evict device {:?}", device.name))?;
                info!(
                    device = %device.name,
                    deleted = report.deleted,
                    uploaded = report.uploaded,
                    skipped = report.skipped,
                    failed = report.failed,
                    "eviction done"
                );
            }
        }
    }
    Ok(())
}
