//! s3nbdd: NBD server daemon.
//!
//! Exports the devices from the config file over NBD, serving reads and
//! writes from per-device chunk caches that are populated on demand from
//! the object store. Ctrl-C (or SIGTERM via the same handler) drops the
//! running flag; connection readers and I/O workers notice within a
//! second and drain. SIGHUP reloads the config file and swaps in the new
//! device table; existing connections keep the device they attached to.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3nbd::cache::ChunkCache;
use s3nbd::nbd::{NbdServer, WorkerPool};
use s3nbd::s3::Pool;
use s3nbd::{Config, DeviceTable};

/// Set from the SIGHUP handler, consumed by the reload thread.
static RELOAD: AtomicBool = AtomicBool::new(false);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "s3nbdd", about = "NBD server backed by S3 object storage")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/s3nbd/s3nbd.toml")]
    config: std::path::PathBuf,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
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
    if config.devices.is_empty() {
        bail!("no devices configured");
    }
    for device in &config.devices {
        std::fs::create_dir_all(&device.cache_dir)
            .with_context(|| format!("create cache_dir {:?}", device.cache_dir))?;
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

    let devices = Arc::new(config.device_table());
    install_reload_handler()?;
    {
        let devices = Arc::clone(&devices);
        let running = Arc::clone(&running);
        let path = args.config.clone();
        std::thread::Builder::new()
            .name("config-reload".into())
            .spawn(move || reload_loop(&path, &devices, &running))
            .context("spawn reload thread")?;
    }

    let pool = Arc::new(Pool::new(config.s3.clone()));
    let cache = Arc::new(ChunkCache::new(pool, Arc::clone(&running)));
    let workers = WorkerPool::spawn(config.io_threads, Arc::clone(&cache), Arc::clone(&running));

    let listener = TcpListener::bind(&config.listen)
        .with_context(|| format!("bind {}", config.listen))?;

    let server = Arc::new(NbdServer::new(
        Arc::clone(&devices),
        workers,
        Arc::clone(&running),
    ));
    info!(
        devices = config.devices.len(),
        io_threads = config.io_threads,
        "s3nbdd starting"
    );
    Arc::clone(&server).serve(listener).context("NBD server")?;

    if let Some(workers) = server.into_workers() {
        workers.shutdown();
    }
    info!(
        cache_hits = cache.stats().hits(),
        cache_misses = cache.stats().misses(),
        "s3nbdd stopped"
    );
    Ok(())
}

// ── Config reload ─────────────────────────────────────────────────────────────

#[allow(unsafe_code)] // raw signal disposition; ctrlc owns INT/TERM already
fn install_reload_handler() -> Result<()> {
    extern "C" fn request_reload(_signal: nix::libc::c_int) {
        RELOAD.store(true, Ordering::Relaxed);
    }
    let action = SigAction::new(
        SigHandler::Handler(request_reload),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGHUP, &action) }.context("install SIGHUP handler")?;
    Ok(())
}

fn reload_loop(path: &Path, devices: &DeviceTable, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
        if RELOAD.swap(false, Ordering::Relaxed) {
            reload_devices(path, devices);
        }
    }
}

/// Load the config again and swap the device table. Any failure keeps the
/// current catalog.
fn reload_devices(path: &Path, devices: &DeviceTable) {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping current devices");
            return;
        }
    };
    if config.devices.is_empty() {
        warn!("reloaded config has no devices, keeping current ones");
        return;
    }
    for device in &config.devices {
        if let Err(e) = std::fs::create_dir_all(&device.cache_dir) {
            warn!(
                device = %device.name,
                error = %e,
                "cannot create cache_dir, keeping current devices"
            );
            return;
        }
    }
    let count = config.devices.len();
    devices.replace(config.devices);
    info!(devices = count, "device table reloaded");
}
