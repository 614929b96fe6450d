//! Cache synchronization and eviction.
//!
//! Runs out of process from the server; the only coordination is the OFD
//! locks on the cache files. A chunk is only touched when its lock can be
//! taken without blocking, so an in-flight server request always wins and
//! the affected chunk is simply skipped until the next pass.
//!
//! Three per-chunk modes build the two operations:
//!
//!   * `SyncOnly`: upload the chunk if the backend copy differs
//!   * `DeleteIfEqual`: delete the cache file, but only when the backend
//!     already has identical content (no upload ever happens)
//!   * `SyncAndDelete`: upload if differing, then delete

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use crate::chunk::{chunk_file_name, parse_chunk_file_name};
use crate::config::Device;
use crate::error::{S3Error, SyncError};
use crate::lock::{try_lock_range, LockKind};
use crate::s3::{Pool, Verb};
use crate::{CHUNK_SIZE, COMPR_CHUNK_SIZE};

/// Deletion cap for the equal-content eviction pass, so one run never
/// empties a whole cache in response to a momentary usage spike.
const EVICT_DELETE_CAP: usize = 100;

/// What to do with one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    SyncOnly,
    DeleteIfEqual,
    SyncAndDelete,
}

/// What happened to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Backend copy already matched
    InSync,
    Uploaded,
    Deleted,
    UploadedAndDeleted,
    /// DeleteIfEqual found differing content and left the file alone
    LeftBehind,
}

/// A fully populated cache file found by [`scan_cache_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub index: u64,
    /// Access time (seconds, nanoseconds) used for eviction ordering
    pub atime: (i64, i64),
}

/// List populated chunks in a cache directory, oldest access first.
/// Short files (a fetch in progress or a crash remnant) and foreign names
/// are skipped.
pub fn scan_cache_dir(dir: &Path) -> io::Result<Vec<ChunkEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(parse_chunk_file_name) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !meta.is_file() || meta.len() != CHUNK_SIZE {
            continue;
        }
        entries.push(ChunkEntry {
            index,
            atime: (meta.atime(), meta.atime_nsec()),
        });
    }
    entries.sort_by_key(|e| e.atime);
    Ok(entries)
}

/// Slice `[start_pct, stop_pct)` out of a scan result, interpreting the
/// percentages as positions in the atime-sorted list. Lets several sync
/// processes split a cache between them.
pub fn window(entries: &[ChunkEntry], start_pct: u8, stop_pct: u8) -> &[ChunkEntry] {
    let len = entries.len();
    let start = len * usize::from(start_pct.min(100)) / 100;
    let stop = len * usize::from(stop_pct.min(100)) / 100;
    &entries[start..stop.max(start)]
}

/// Filesystem usage of a cache directory, in whole percent.
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub space_used_pct: u8,
    pub inode_used_pct: u8,
}

impl DiskUsage {
    pub fn exceeds(&self, pct: u8) -> bool {
        self.space_used_pct > pct || self.inode_used_pct > pct
    }
}

/// Injectable usage probe; the default asks statvfs.
pub type UsageProbe = Box<dyn Fn(&Path) -> io::Result<DiskUsage> + Send + Sync>;

pub fn statvfs_usage(path: &Path) -> io::Result<DiskUsage> {
    let vfs = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    let pct = |free: u64, total: u64| -> u8 {
        if total == 0 {
            0
        } else {
            (100 - free * 100 / total) as u8
        }
    };
    Ok(DiskUsage {
        space_used_pct: pct(vfs.blocks_available() as u64, vfs.blocks() as u64),
        inode_used_pct: pct(vfs.files_available() as u64, vfs.files() as u64),
    })
}

/// Open a chunk file for syncing, writable when an exclusive lock will be
/// taken. O_NOATIME keeps the scan ordering stable; not every filesystem
/// grants it, so fall back without.
fn open_chunk_file(path: &Path, writable: bool) -> io::Result<std::fs::File> {
    let open = |noatime: bool| {
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        if noatime {
            options.custom_flags(libc::O_NOATIME);
        }
        options.open(path)
    };
    match open(true) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => open(false),
        other => other,
    }
}

pub struct Syncer {
    pool: Arc<Pool>,
    running: Arc<AtomicBool>,
}

impl Syncer {
    pub fn new(pool: Arc<Pool>, running: Arc<AtomicBool>) -> Self {
        Self { pool, running }
    }

    /// Upload differing chunks, most recently used first, until the time
    /// budget runs out. `start_pct`/`stop_pct` restrict the pass to a
    /// window of the atime-sorted chunk list.
    pub fn sync_device(
        &self,
        device: &Device,
        start_pct: u8,
        stop_pct: u8,
        budget: Duration,
    ) -> io::Result<SyncReport> {
        let deadline = Instant::now() + budget;
        let entries = scan_cache_dir(&device.cache_dir)?;
        let slice = window(&entries, start_pct, stop_pct);
        let mut report = SyncReport::default();

        for entry in slice.iter().rev() {
            if !self.running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                break;
            }
            self.step(device, entry, PassMode::SyncOnly, &mut report);
        }

        info!(
            device = %device.name,
            uploaded = report.uploaded,
            in_sync = report.in_sync,
            skipped = report.skipped,
            "sync pass done"
        );
        Ok(report)
    }

    /// Bring cache usage down below `min_used_pct` when it exceeds
    /// `max_used_pct`. Oldest chunks go first: a cheap pass deletes those
    /// the backend already has, and only if that is not enough a second
    /// pass uploads and deletes the rest.
    pub fn evict_device(
        &self,
        device: &Device,
        max_used_pct: u8,
        min_used_pct: u8,
        start_pct: u8,
        stop_pct: u8,
        probe: &UsageProbe,
    ) -> io::Result<SyncReport> {
        let mut report = SyncReport::default();
        let usage = probe(&device.cache_dir)?;
        if !usage.exceeds(max_used_pct) {
            return Ok(report);
        }
        info!(
            device = %device.name,
            space_used_pct = usage.space_used_pct,
            inode_used_pct = usage.inode_used_pct,
            "cache over limit, evicting"
        );

        let entries = scan_cache_dir(&device.cache_dir)?;
        let slice = window(&entries, start_pct, stop_pct);

        let mut deleted = 0usize;
        for entry in slice {
            if !self.running.load(Ordering::Relaxed) || deleted >= EVICT_DELETE_CAP {
                break;
            }
            if !probe(&device.cache_dir)?.exceeds(min_used_pct) {
                return Ok(report);
            }
            if self.step(device, entry, PassMode::DeleteIfEqual, &mut report) {
                deleted += 1;
            }
        }

        for entry in slice {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if !probe(&device.cache_dir)?.exceeds(min_used_pct) {
                return Ok(report);
            }
            self.step(device, entry, PassMode::SyncAndDelete, &mut report);
        }
        Ok(report)
    }

    /// Run one chunk, folding errors into the report. Returns whether the
    /// chunk was deleted.
    fn step(&self, device: &Device, entry: &ChunkEntry, mode: PassMode, report: &mut SyncReport) -> bool {
        match self.sync_chunk(device, entry.index, mode) {
            Ok(outcome) => {
                report.record(outcome);
                matches!(
                    outcome,
                    ChunkOutcome::Deleted | ChunkOutcome::UploadedAndDeleted
                )
            }
            Err(SyncError::Busy) | Err(SyncError::ShortChunk(_)) => {
                debug!(device = %device.name, chunk = entry.index, "chunk busy, skipped");
                report.skipped += 1;
                false
            }
            // scanned earlier, gone now (evicted or raced), nothing to do
            Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                report.skipped += 1;
                false
            }
            Err(e) => {
                warn!(device = %device.name, chunk = entry.index, error = %e, "chunk failed");
                report.failed += 1;
                false
            }
        }
    }

    /// Process a single chunk under a non-blocking whole-file lock.
    pub fn sync_chunk(
        &self,
        device: &Device,
        index: u64,
        mode: PassMode,
    ) -> Result<ChunkOutcome, SyncError> {
        let name = chunk_file_name(index);
        let path = device.cache_dir.join(&name);

        let kind = match mode {
            PassMode::SyncOnly => LockKind::Shared,
            PassMode::DeleteIfEqual | PassMode::SyncAndDelete => LockKind::Exclusive,
        };
        // an exclusive OFD lock needs a descriptor opened for writing
        let file = open_chunk_file(&path, kind == LockKind::Exclusive)?;
        if !try_lock_range(&file, kind, 0, 0)? {
            return Err(SyncError::Busy);
        }

        let meta = file.metadata()?;
        if meta.len() != CHUNK_SIZE {
            return Err(SyncError::ShortChunk(meta.len()));
        }

        let mut data = vec![0u8; CHUNK_SIZE as usize];
        {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(&mut data, 0)?;
        }
        let compressed = zstd::bulk::compress(&data, 0).map_err(SyncError::Compress)?;
        let md5: [u8; 16] = Md5::digest(&compressed).into();

        let in_sync = {
            let mut conn = self.pool.acquire()?;
            let mut scratch = Vec::new();
            let head = conn.request(Verb::Head, &device.name, &name, None, &mut scratch, 0)?;
            match head.status {
                200 => head.etag_md5 == Some(md5),
                404 => false,
                status => return Err(SyncError::Backend(S3Error::Status(status))),
            }
        };

        match mode {
            PassMode::SyncOnly => {
                if in_sync {
                    Ok(ChunkOutcome::InSync)
                } else {
                    self.upload(device, &name, &compressed, &md5)?;
                    Ok(ChunkOutcome::Uploaded)
                }
            }
            PassMode::DeleteIfEqual => {
                if in_sync {
                    std::fs::remove_file(&path)?;
                    Ok(ChunkOutcome::Deleted)
                } else {
                    Ok(ChunkOutcome::LeftBehind)
                }
            }
            PassMode::SyncAndDelete => {
                let outcome = if in_sync {
                    ChunkOutcome::Deleted
                } else {
                    self.upload(device, &name, &compressed, &md5)?;
                    ChunkOutcome::UploadedAndDeleted
                };
                std::fs::remove_file(&path)?;
                Ok(outcome)
            }
        }
    }

    fn upload(
        &self,
        device: &Device,
        name: &str,
        compressed: &[u8],
        md5: &[u8; 16],
    ) -> Result<(), SyncError> {
        debug_assert!(compressed.len() <= COMPR_CHUNK_SIZE + 1024);
        let mut conn = self.pool.acquire()?;
        let mut scratch = Vec::new();
        let response = conn.request(
            Verb::Put,
            &device.name,
            name,
            Some((compressed, md5)),
            &mut scratch,
            0,
        )?;
        if !(200..300).contains(&response.status) {
            return Err(SyncError::Backend(S3Error::Status(response.status)));
        }
        debug!(device = %device.name, chunk = %name, bytes = compressed.len(), "chunk uploaded");
        Ok(())
    }
}

/// Counters for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub in_sync: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::InSync => self.in_sync += 1,
            ChunkOutcome::Uploaded => self.uploaded += 1,
            ChunkOutcome::Deleted => self.deleted += 1,
            ChunkOutcome::UploadedAndDeleted => {
                self.uploaded += 1;
                self.deleted += 1;
            }
            ChunkOutcome::LeftBehind => {}
        }
    }
}
