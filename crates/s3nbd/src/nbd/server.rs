//! Listener, handshake and per-connection request reader.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::DeviceTable;
use crate::error::ProtocolError;

use super::worker::{ConnShared, IoRequest, WorkerPool};
use super::{
    MAX_OPTION_BYTES, MAX_REQUEST_BYTES, NBD_CLIENT_FLAG_NO_ZEROES, NBD_CMD_DISC, NBD_CMD_READ,
    NBD_CMD_WRITE, NBD_EINVAL, NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_NO_ZEROES,
    NBD_FLAG_SEND_FLUSH, NBD_IHAVEOPT, NBD_MAGIC, NBD_OPTION_REPLY_MAGIC, NBD_OPT_ABORT,
    NBD_OPT_EXPORT_NAME, NBD_OPT_LIST, NBD_REP_ACK, NBD_REP_ERR_INVALID, NBD_REP_ERR_UNSUP,
    NBD_REP_SERVER, NBD_REPLY_MAGIC, NBD_REQUEST_MAGIC,
};

/// Socket read timeout; doubles as the shutdown poll interval.
const READ_POLL: Duration = Duration::from_secs(1);

pub struct NbdServer {
    /// Shared with the reload path, which swaps in whole new catalogs
    devices: Arc<DeviceTable>,
    workers: WorkerPool,
    running: Arc<AtomicBool>,
}

impl NbdServer {
    pub fn new(devices: Arc<DeviceTable>, workers: WorkerPool, running: Arc<AtomicBool>) -> Self {
        Self {
            devices,
            workers,
            running,
        }
    }

    /// Accept clients until the running flag drops, then drain the worker
    /// pool. Each client gets its own reader thread.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "NBD server listening");

        let mut clients = Vec::new();
        while self.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let handle = std::thread::Builder::new()
                        .name(format!("nbd-{peer}"))
                        .spawn(move || {
                            if let Err(e) = server.handle_client(stream, peer) {
                                match e {
                                    ProtocolError::Disconnected | ProtocolError::Shutdown => {}
                                    other => warn!(peer = %peer, error = %other, "client error"),
                                }
                            }
                            info!(peer = %peer, "client disconnected");
                        })?;
                    clients.push(handle);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }

        for handle in clients {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Stop accepting new work and join the I/O workers.
    pub fn into_workers(self: Arc<Self>) -> Option<WorkerPool> {
        Arc::into_inner(self).map(|s| s.workers)
    }

    fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), ProtocolError> {
        info!(peer = %peer, "client connected");
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;

        // Server greeting: NBDMAGIC + IHAVEOPT + handshake flags
        let mut greeting = [0u8; 18];
        greeting[..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        greeting[8..16].copy_from_slice(&NBD_IHAVEOPT.to_be_bytes());
        greeting[16..18]
            .copy_from_slice(&(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes());
        stream.write_all(&greeting)?;

        let client_flags = self.read_u32(&mut stream)?;
        let no_zeroes = client_flags & NBD_CLIENT_FLAG_NO_ZEROES != 0;

        let device = self.negotiate(&mut stream)?;
        info!(peer = %peer, device = %device.name, "export selected");

        // Export block: size + transmission flags (+ legacy zero padding)
        let mut export = Vec::with_capacity(134);
        export.extend_from_slice(&device.size_bytes().to_be_bytes());
        export.extend_from_slice(&(NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH).to_be_bytes());
        if !no_zeroes {
            export.extend_from_slice(&[0u8; 124]);
        }
        stream.write_all(&export)?;

        let conn = Arc::new(ConnShared {
            writer: Mutex::new(stream.try_clone()?),
            device,
            peer,
        });
        self.transmission(&mut stream, &conn)
    }

    fn negotiate(&self, stream: &mut TcpStream) -> Result<crate::config::Device, ProtocolError> {
        loop {
            let magic = self.read_u64(stream)?;
            if magic != NBD_IHAVEOPT {
                return Err(ProtocolError::BadOptionMagic(magic));
            }
            let option = self.read_u32(stream)?;
            let data_len = self.read_u32(stream)?;

            if data_len >= MAX_OPTION_BYTES {
                self.send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[])?;
                return Err(ProtocolError::OversizedOption(data_len));
            }
            let mut data = vec![0u8; data_len as usize];
            self.read_exact_poll(stream, &mut data)?;

            match option {
                NBD_OPT_EXPORT_NAME => {
                    // No error reply is possible for this option; a bad
                    // name just drops the connection.
                    let name = String::from_utf8_lossy(&data).to_string();
                    return self
                        .devices
                        .get(&name)
                        .ok_or(ProtocolError::UnknownExport(name));
                }

                NBD_OPT_ABORT => {
                    self.send_option_reply(stream, option, NBD_REP_ACK, &[])?;
                    return Err(ProtocolError::Aborted);
                }

                NBD_OPT_LIST => {
                    if !data.is_empty() {
                        self.send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[])?;
                        continue;
                    }
                    for device in self.devices.snapshot().iter() {
                        let name = device.name.as_bytes();
                        let mut entry = Vec::with_capacity(4 + name.len());
                        entry.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        entry.extend_from_slice(name);
                        self.send_option_reply(stream, option, NBD_REP_SERVER, &entry)?;
                    }
                    self.send_option_reply(stream, option, NBD_REP_ACK, &[])?;
                }

                _ => {
                    self.send_option_reply(stream, option, NBD_REP_ERR_UNSUP, &[])?;
                }
            }
        }
    }

    fn send_option_reply(
        &self,
        stream: &mut TcpStream,
        option: u32,
        reply_type: u32,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut reply = Vec::with_capacity(20 + data.len());
        reply.extend_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        reply.extend_from_slice(&option.to_be_bytes());
        reply.extend_from_slice(&reply_type.to_be_bytes());
        reply.extend_from_slice(&(data.len() as u32).to_be_bytes());
        reply.extend_from_slice(data);
        stream.write_all(&reply)?;
        Ok(())
    }

    fn transmission(
        &self,
        stream: &mut TcpStream,
        conn: &Arc<ConnShared>,
    ) -> Result<(), ProtocolError> {
        loop {
            // magic(4) + command(4) + handle(8) + offset(8) + length(4)
            let mut header = [0u8; 28];
            self.read_exact_poll(stream, &mut header)?;

            let magic = u32::from_be_bytes(header[..4].try_into().unwrap());
            let cmd = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let mut handle = [0u8; 8];
            handle.copy_from_slice(&header[8..16]);
            let offset = u64::from_be_bytes(header[16..24].try_into().unwrap());
            let length = u32::from_be_bytes(header[24..28].try_into().unwrap());

            if magic != NBD_REQUEST_MAGIC {
                warn!(peer = %conn.peer, magic = format_args!("{magic:#x}"), "bad request magic");
                conn.reply(handle, NBD_EINVAL, &[])?;
                continue;
            }

            if cmd == NBD_CMD_DISC {
                return Ok(());
            }

            if (cmd == NBD_CMD_READ || cmd == NBD_CMD_WRITE) && length > MAX_REQUEST_BYTES {
                return Err(ProtocolError::OversizedRequest(length));
            }

            let mut payload = Vec::new();
            if cmd == NBD_CMD_WRITE {
                payload.resize(length as usize, 0);
                self.read_exact_poll(stream, &mut payload)?;
            }

            self.workers.dispatch(
                IoRequest {
                    cmd,
                    handle,
                    offset,
                    length,
                    payload,
                    conn: Arc::clone(conn),
                },
                &self.running,
            )?;
        }
    }

    // ── Shutdown-aware socket reads ──────────────────────────────────────────

    fn read_exact_poll(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(ProtocolError::Disconnected),
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if !self.running.load(Ordering::Relaxed) {
                        return Err(ProtocolError::Shutdown);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_u32(&self, stream: &mut TcpStream) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.read_exact_poll(stream, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&self, stream: &mut TcpStream) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 8];
        self.read_exact_poll(stream, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }
}
