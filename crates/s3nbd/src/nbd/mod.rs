//! NBD (Network Block Device) fixed-newstyle server.
//!
//! One TCP listener; clients pick a device by export name during the
//! handshake, then enter the transmission phase. Request processing is
//! handed to a shared worker pool so a slow chunk fetch on one connection
//! never stalls the others; replies may therefore complete out of order,
//! which the protocol permits.

mod server;
mod worker;

pub use server::NbdServer;
pub use worker::{ConnShared, IoRequest, WorkerPool};

// ── NBD protocol constants ────────────────────────────────────────────────────

pub const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
pub const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
pub const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags (mirror the handshake flags)
pub const NBD_CLIENT_FLAG_NO_ZEROES: u32 = 0x0002;

// Option IDs
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

// Option reply types
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
pub const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
pub const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;

// Commands
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;

/// Option payloads at or above this are rejected and the connection closed.
pub const MAX_OPTION_BYTES: u32 = 1024;

/// Largest read/write a client may request in one command.
pub const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

// Errno values carried in simple replies
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
