//! Local chunk cache with on-demand population from the backend.
//!
//! Every chunk lives in a cache file whose validity is encoded in its
//! length: exactly `CHUNK_SIZE` bytes means fully populated, anything
//! shorter means a fetch is in flight (or crashed). Coordination between
//! server threads and the external sync tool runs entirely over OFD
//! byte-range locks on the cache files, so no shared in-process state is
//! needed:
//!
//!   * I/O takes a shared lock on just the byte range it touches
//!   * population and eviction take an exclusive lock on the whole file
//!
//! The exclusive lock doubles as singleflight for misses: concurrent
//! readers of an unpopulated chunk queue on it and all but the first find
//! the chunk populated when they get their turn.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunk::{chunk_file_name, split_range, ChunkRange};
use crate::config::Device;
use crate::error::{CacheError, S3Error};
use crate::lock::{lock_range, LockKind};
use crate::s3::{Pool, Verb};
use crate::{CHUNK_SIZE, COMPR_CHUNK_SIZE};

/// Poll interval while sleeping in the fetch-retry loop, so shutdown is
/// noticed promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Hit/miss counters, shared across all devices.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// An open, populated chunk file holding a shared lock on the byte range
/// being accessed. Dropping it closes the file, which releases the lock.
pub struct ChunkHandle {
    file: File,
}

impl ChunkHandle {
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }
}

pub struct ChunkCache {
    pool: Arc<Pool>,
    running: Arc<AtomicBool>,
    fetch_cooldown: Duration,
    stats: CacheStats,
}

impl ChunkCache {
    pub fn new(pool: Arc<Pool>, running: Arc<AtomicBool>) -> Self {
        Self {
            pool,
            running,
            fetch_cooldown: Duration::from_secs(1),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Read `buf.len()` bytes at `offset` from the device.
    pub fn read(&self, device: &Device, offset: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        self.check_bounds(device, offset, buf.len() as u64)?;
        let mut pos = 0usize;
        for range in split_range(offset, buf.len() as u64) {
            let handle = self.open_chunk(device, &range)?;
            let slice = &mut buf[pos..pos + range.len() as usize];
            handle.read_at(slice, range.start)?;
            pos += range.len() as usize;
        }
        Ok(())
    }

    /// Write `data` at `offset`. Touched chunks are populated first so a
    /// partial chunk write lands on real data.
    pub fn write(&self, device: &Device, offset: u64, data: &[u8]) -> Result<(), CacheError> {
        self.check_bounds(device, offset, data.len() as u64)?;
        let mut pos = 0usize;
        for range in split_range(offset, data.len() as u64) {
            let handle = self.open_chunk(device, &range)?;
            let slice = &data[pos..pos + range.len() as usize];
            handle.write_at(slice, range.start)?;
            pos += range.len() as usize;
        }
        Ok(())
    }

    /// Flush the filesystem holding the device's cache directory.
    #[allow(unsafe_code)] // syncfs has no std or nix wrapper
    pub fn flush(&self, device: &Device) -> Result<(), CacheError> {
        let dir = File::open(&device.cache_dir)?;
        let rc = unsafe { libc::syncfs(dir.as_raw_fd()) };
        if rc == -1 {
            return Err(CacheError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn check_bounds(&self, device: &Device, offset: u64, len: u64) -> Result<(), CacheError> {
        let size = device.size_bytes();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(CacheError::OutOfBounds { offset, len, size });
        }
        Ok(())
    }

    /// Open the chunk for `range` with a shared lock on that byte range,
    /// populating the chunk from the backend first when needed.
    ///
    /// The cache file can be deleted by the eviction tool between our
    /// `open` and the lock grant, so after every lock acquisition the file
    /// is re-checked against a fresh `stat` of its path; a vanished or
    /// replaced file sends us around the loop with a fresh descriptor.
    fn open_chunk(&self, device: &Device, range: &ChunkRange) -> Result<ChunkHandle, CacheError> {
        let path = device.cache_dir.join(chunk_file_name(range.index));
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            lock_range(&file, LockKind::Shared, range.start, range.len())
                .map_err(CacheError::Lock)?;

            match self.still_current(&file, &path)? {
                None => continue,
                Some(len) if len == CHUNK_SIZE => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(ChunkHandle { file });
                }
                Some(_) => {}
            }

            // Miss. Release the shared range before requesting the
            // exclusive whole-file lock: two upgraders each holding a
            // shared range would wait on each other forever. Whoever gets
            // the exclusive lock first populates, the rest find a full
            // chunk afterwards.
            crate::lock::unlock_range(&file, range.start, range.len()).map_err(CacheError::Lock)?;
            lock_range(&file, LockKind::Exclusive, 0, 0).map_err(CacheError::Lock)?;
            match self.still_current(&file, &path)? {
                None => continue,
                Some(len) => {
                    if len != CHUNK_SIZE {
                        self.stats.misses.fetch_add(1, Ordering::Relaxed);
                        self.populate(device, range.index, &file)?;
                    } else {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            self.downgrade(&file, range)?;
            return Ok(ChunkHandle { file });
        }
    }

    /// Check that `file` is still the file at `path`, returning its
    /// current length, or `None` if it was deleted or replaced.
    fn still_current(&self, file: &File, path: &Path) -> Result<Option<u64>, CacheError> {
        let meta = file.metadata()?;
        match std::fs::metadata(path) {
            Ok(by_path) if by_path.ino() == meta.ino() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Convert the exclusive whole-file lock into a shared lock covering
    /// only `range`. OFD locks replace overlapping portions per call, so
    /// the chunk is never unlocked in between.
    fn downgrade(&self, file: &File, range: &ChunkRange) -> Result<(), CacheError> {
        lock_range(file, LockKind::Shared, range.start, range.len()).map_err(CacheError::Lock)?;
        if range.start > 0 {
            crate::lock::unlock_range(file, 0, range.start).map_err(CacheError::Lock)?;
        }
        if range.end < CHUNK_SIZE {
            crate::lock::unlock_range(file, range.end, 0).map_err(CacheError::Lock)?;
        }
        Ok(())
    }

    /// Fetch one chunk from the backend into `file`. Retries with a
    /// cooldown until it succeeds or shutdown is signaled; the server can
    /// not answer the client without the data, so giving up early only
    /// turns a backend outage into corruption.
    fn populate(&self, device: &Device, index: u64, file: &File) -> Result<(), CacheError> {
        let object = chunk_file_name(index);
        let mut compressed = Vec::new();

        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Err(CacheError::Shutdown);
            }

            let outcome = self.pool.acquire().and_then(|mut conn| {
                conn.request(
                    Verb::Get,
                    &device.name,
                    &object,
                    None,
                    &mut compressed,
                    COMPR_CHUNK_SIZE,
                )
            });

            match outcome {
                Ok(response) if response.status == 200 => {
                    let data = zstd::bulk::decompress(&compressed, CHUNK_SIZE as usize)
                        .map_err(CacheError::Decompress)?;
                    if data.len() as u64 != CHUNK_SIZE {
                        return Err(CacheError::BadChunkSize {
                            got: data.len(),
                            expected: CHUNK_SIZE,
                        });
                    }
                    file.write_all_at(&data, 0)?;
                    debug!(device = %device.name, chunk = %object, "chunk fetched");
                    return Ok(());
                }
                // never stored: the chunk reads as zeros
                Ok(response) if response.status == 404 => {
                    file.set_len(CHUNK_SIZE)?;
                    debug!(device = %device.name, chunk = %object, "chunk not in backend, zero-filled");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        device = %device.name,
                        chunk = %object,
                        status = response.status,
                        "chunk fetch rejected, retrying"
                    );
                }
                // a body that cannot be a valid compressed chunk will not
                // shrink on retry
                Err(e @ S3Error::BodyTooLarge { .. }) => {
                    return Err(CacheError::Fetch(e));
                }
                Err(e) => {
                    warn!(device = %device.name, chunk = %object, error = %e, "chunk fetch failed, retrying");
                }
            }

            self.cooldown()?;
        }
    }

    fn cooldown(&self) -> Result<(), CacheError> {
        let deadline = Instant::now() + self.fetch_cooldown;
        while Instant::now() < deadline {
            if !self.running.load(Ordering::Relaxed) {
                return Err(CacheError::Shutdown);
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_device, MockS3};

    fn setup(size_chunks: u64) -> (MockS3, tempfile::TempDir, Arc<ChunkCache>, Device) {
        let mock = MockS3::spawn();
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(Pool::new(mock.s3_config()));
        let running = Arc::new(AtomicBool::new(true));
        let cache = Arc::new(ChunkCache::new(pool, running));
        let device = test_device("disk0", dir.path(), size_chunks * CHUNK_SIZE);
        (mock, dir, cache, device)
    }

    fn compressed_chunk(fill: u8) -> Vec<u8> {
        zstd::bulk::compress(&vec![fill; CHUNK_SIZE as usize], 0).unwrap()
    }

    #[test]
    fn missing_chunk_reads_as_zeros() {
        let (mock, _dir, cache, device) = setup(2);
        let mut buf = vec![0xFFu8; 100];
        cache.read(&device, CHUNK_SIZE + 5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(mock.counters.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn fetch_decompresses_backend_object() {
        let (mock, dir, cache, device) = setup(1);
        mock.put_object("/bucket/disk0/0000000000000000", compressed_chunk(0xAB));

        let mut buf = vec![0u8; 16];
        cache.read(&device, 10, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));

        // cache file is fully populated afterwards
        let meta = std::fs::metadata(dir.path().join(chunk_file_name(0))).unwrap();
        assert_eq!(meta.len(), CHUNK_SIZE);
    }

    #[test]
    fn concurrent_misses_fetch_once() {
        let (mock, _dir, cache, device) = setup(1);
        mock.put_object("/bucket/disk0/0000000000000000", compressed_chunk(0x5A));

        let mut threads = Vec::new();
        for i in 0..8u64 {
            let cache = Arc::clone(&cache);
            let device = device.clone();
            threads.push(std::thread::spawn(move || {
                let mut buf = vec![0u8; 512];
                cache.read(&device, i * 4096, &mut buf).unwrap();
                assert!(buf.iter().all(|&b| b == 0x5A));
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(mock.counters.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn waiting_reader_holds_no_range_lock() {
        use crate::lock::{lock_range, try_lock_range, unlock_range, LockKind};

        let (_mock, dir, cache, device) = setup(1);
        let path = dir.path().join(chunk_file_name(0));
        std::fs::write(&path, b"").unwrap();

        // another description pins the whole chunk shared, so the reader
        // below gets stuck waiting for its populate lock
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        lock_range(&holder, LockKind::Shared, 0, 0).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            let device = device.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 512];
                cache.read(&device, 0, &mut buf).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(200));

        // the blocked reader must have dropped its shared range lock, or
        // concurrent upgraders on the same short chunk would deadlock
        assert!(try_lock_range(&holder, LockKind::Exclusive, 0, 512).unwrap());

        unlock_range(&holder, 0, 0).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn write_then_read_across_chunks() {
        let (_mock, _dir, cache, device) = setup(2);
        let data: Vec<u8> = (0u8..16).collect();
        cache.write(&device, CHUNK_SIZE - 8, &data).unwrap();

        let mut buf = vec![0u8; 32];
        cache.read(&device, CHUNK_SIZE - 16, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..24], &data[..]);
        assert_eq!(&buf[24..], &[0u8; 8]);
    }

    #[test]
    fn random_writes_read_back_intact() {
        use rand::{Rng, SeedableRng};
        let (_mock, _dir, cache, device) = setup(3);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let mut written: Vec<(u64, Vec<u8>)> = Vec::new();
        for _ in 0..20 {
            let len = rng.gen_range(1..=65536u64);
            let offset = rng.gen_range(0..3 * CHUNK_SIZE - len);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            cache.write(&device, offset, &data).unwrap();
            // drop earlier writes this one overlaps
            written.retain(|(o, d)| *o + d.len() as u64 <= offset || *o >= offset + len);
            written.push((offset, data));
        }

        for (offset, data) in &written {
            let mut buf = vec![0u8; data.len()];
            cache.read(&device, *offset, &mut buf).unwrap();
            assert_eq!(&buf, data);
        }
    }

    #[test]
    fn rejects_out_of_bounds() {
        let (_mock, _dir, cache, device) = setup(1);
        let mut buf = vec![0u8; 16];
        let err = cache.read(&device, CHUNK_SIZE - 8, &mut buf).unwrap_err();
        assert!(matches!(err, CacheError::OutOfBounds { .. }));
        // offset overflow must not panic
        let err = cache.read(&device, u64::MAX - 4, &mut buf).unwrap_err();
        assert!(matches!(err, CacheError::OutOfBounds { .. }));
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (mock, _dir, cache, device) = setup(1);
        let mut buf = vec![0u8; 64];
        cache.read(&device, 0, &mut buf).unwrap();
        cache.read(&device, 4096, &mut buf).unwrap();
        cache.read(&device, 8192, &mut buf).unwrap();
        assert_eq!(mock.counters.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits(), 2);
    }
}
