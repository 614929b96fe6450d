//! s3nbd: network block devices backed by S3-compatible object storage
//!
//! Exports virtual block devices over the NBD fixed-newstyle protocol and
//! backs them with a local disk cache of fixed-size chunks. Chunks are
//! lazily fetched from the object store on first access and asynchronously
//! reconciled back by a separate sync/eviction process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  NBD Client  │  (qemu, nbd-client, ...)
//! └──────┬───────┘
//!        │ TCP, one server thread per connection
//! ┌──────▼───────┐
//! │  NBD Server  │  handshake / option negotiation / dispatch
//! │  WorkerPool  │  fixed pool of I/O worker threads
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │  ChunkCache  │  8 MiB chunk files, OFD byte-range locks,
//! │              │  fetch-on-miss singleflight
//! └──────┬───────┘
//! ┌──────▼───────┐
//! │  s3::Pool    │  pooled connections, AWS V2 signing,
//! │              │  hand-framed HTTP over TCP or TLS
//! └──────────────┘
//! ```
//!
//! The sync/eviction engine ([`sync`]) runs out-of-band against the same
//! chunk files and the same S3 pool. Cross-process safety rests entirely on
//! the per-chunk OFD byte-range lock ([`lock`]).

pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod lock;
pub mod nbd;
pub mod s3;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheStats, ChunkCache};
pub use chunk::{ChunkRange, chunk_file_name, parse_chunk_file_name, split_range};
pub use config::{Config, Device, DeviceTable, S3Config};
pub use error::{CacheError, ConfigError, ProtocolError, S3Error, SyncError};

/// Fixed chunk size: cache files and backend objects are always images of
/// exactly this many bytes (compressed on the wire).
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Upper bound for a compressed chunk payload. Incompressible data plus
/// codec framing never exceeds this.
pub const COMPR_CHUNK_SIZE: usize = (CHUNK_SIZE + CHUNK_SIZE / 4) as usize;
