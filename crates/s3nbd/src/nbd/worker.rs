//! Shared I/O worker pool.
//!
//! Connection reader threads hand each request over a zero-capacity
//! channel, so a send only completes once a worker is actually free.
//! Workers write their reply straight to the client socket under the
//! connection's write mutex; two workers serving the same connection can
//! finish in either order.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ChunkCache;
use crate::config::Device;
use crate::error::{CacheError, ProtocolError};

use super::{NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_WRITE, NBD_EINVAL, NBD_EIO, NBD_REPLY_MAGIC};

const POLL: Duration = Duration::from_millis(500);

/// Per-connection state shared between the reader thread and the workers.
pub struct ConnShared {
    pub writer: Mutex<TcpStream>,
    pub device: Device,
    pub peer: SocketAddr,
}

impl ConnShared {
    /// Send one simple reply, optionally followed by read payload.
    pub fn reply(&self, handle: [u8; 8], error: u32, payload: &[u8]) -> std::io::Result<()> {
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&error.to_be_bytes());
        header[8..16].copy_from_slice(&handle);

        let mut writer = self.writer.lock();
        writer.write_all(&header)?;
        if !payload.is_empty() {
            writer.write_all(payload)?;
        }
        writer.flush()
    }
}

/// One queued NBD command.
pub struct IoRequest {
    pub cmd: u32,
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
    /// Write payload; empty for read and flush
    pub payload: Vec<u8>,
    pub conn: Arc<ConnShared>,
}

pub struct WorkerPool {
    tx: Sender<IoRequest>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(threads: usize, cache: Arc<ChunkCache>, running: Arc<AtomicBool>) -> Self {
        let (tx, rx) = bounded::<IoRequest>(0);
        let handles = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                let cache = Arc::clone(&cache);
                let running = Arc::clone(&running);
                std::thread::Builder::new()
                    .name(format!("io-worker-{i}"))
                    .spawn(move || worker_loop(&rx, &cache, &running))
                    .expect("spawning worker thread")
            })
            .collect();
        Self { tx, handles }
    }

    /// Block until a worker takes the request, checking the running flag
    /// while waiting.
    pub fn dispatch(&self, request: IoRequest, running: &AtomicBool) -> Result<(), ProtocolError> {
        let mut request = request;
        loop {
            match self.tx.send_timeout(request, POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(r)) => {
                    if !running.load(Ordering::Relaxed) {
                        return Err(ProtocolError::Shutdown);
                    }
                    request = r;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(ProtocolError::Dispatch),
            }
        }
    }

    /// Close the queue and wait for in-flight requests to finish.
    pub fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Receiver<IoRequest>, cache: &ChunkCache, running: &AtomicBool) {
    loop {
        match rx.recv_timeout(POLL) {
            Ok(request) => process(cache, request),
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn errno_for(e: &CacheError) -> u32 {
    match e {
        CacheError::OutOfBounds { .. } => NBD_EINVAL,
        _ => NBD_EIO,
    }
}

fn process(cache: &ChunkCache, request: IoRequest) {
    let conn = &request.conn;
    let result = match request.cmd {
        NBD_CMD_READ => {
            let mut buf = vec![0u8; request.length as usize];
            match cache.read(&conn.device, request.offset, &mut buf) {
                Ok(()) => conn.reply(request.handle, 0, &buf),
                Err(e) => {
                    warn!(
                        peer = %conn.peer,
                        device = %conn.device.name,
                        offset = request.offset,
                        length = request.length,
                        error = %e,
                        "read failed"
                    );
                    conn.reply(request.handle, errno_for(&e), &[])
                }
            }
        }
        NBD_CMD_WRITE => match cache.write(&conn.device, request.offset, &request.payload) {
            Ok(()) => conn.reply(request.handle, 0, &[]),
            Err(e) => {
                warn!(
                    peer = %conn.peer,
                    device = %conn.device.name,
                    offset = request.offset,
                    length = request.length,
                    error = %e,
                    "write failed"
                );
                conn.reply(request.handle, errno_for(&e), &[])
            }
        },
        NBD_CMD_FLUSH => match cache.flush(&conn.device) {
            Ok(()) => conn.reply(request.handle, 0, &[]),
            Err(e) => {
                warn!(peer = %conn.peer, device = %conn.device.name, error = %e, "flush failed");
                conn.reply(request.handle, NBD_EIO, &[])
            }
        },
        other => {
            debug!(peer = %conn.peer, cmd = other, "unknown command");
            conn.reply(request.handle, NBD_EINVAL, &[])
        }
    };

    // the reader thread will notice the dead socket on its side
    if let Err(e) = result {
        debug!(peer = %conn.peer, error = %e, "reply write failed");
    }
}
