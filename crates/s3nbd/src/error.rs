//! Error types, one enum per concern.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration load/validation error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Object-storage client error
#[derive(Error, Debug)]
pub enum S3Error {
    /// No pool slot freed up within the configured timeout.
    #[error("all backend connections busy")]
    PoolBusy,

    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS setup for {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: rustls::Error,
    },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    BadResponse(&'static str),

    /// Declared Content-Length exceeds the caller's buffer limit.
    #[error("response body of {got} bytes exceeds limit of {limit}")]
    BodyTooLarge { got: u64, limit: u64 },

    /// A status the caller cannot handle (fetch expects 200/404, upload 200).
    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

/// Chunk-cache error, resolved at the cache boundary into a single
/// read/write failure. NBD clients only ever see an I/O error code.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("chunk I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("chunk lock failed: {0}")]
    Lock(#[source] io::Error),

    #[error("backend fetch failed: {0}")]
    Fetch(#[from] S3Error),

    #[error("fetched chunk failed to decompress: {0}")]
    Decompress(#[source] io::Error),

    #[error("chunk decompressed to {got} bytes, expected {expected}")]
    BadChunkSize { got: usize, expected: u64 },

    #[error("request beyond device end: offset {offset} + {len} > {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Shutdown was signaled while waiting inside the fetch-retry loop.
    #[error("shutting down")]
    Shutdown,
}

/// NBD protocol error, fatal to the one connection only.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("client disconnected")]
    Disconnected,

    #[error("bad option magic {0:#x}")]
    BadOptionMagic(u64),

    #[error("option payload of {0} bytes too large")]
    OversizedOption(u32),

    #[error("request length {0} too large")]
    OversizedRequest(u32),

    #[error("unknown export {0:?}")]
    UnknownExport(String),

    #[error("client sent abort")]
    Aborted,

    #[error("no free I/O worker")]
    Dispatch,

    #[error("shutting down")]
    Shutdown,
}

/// Sync/eviction engine error. Per-chunk failures are logged and skipped;
/// one chunk never aborts a whole pass.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),

    #[error("chunk is locked by another process")]
    Busy,

    /// File length is not `CHUNK_SIZE`: mid-fetch by the server, skip.
    #[error("chunk file has size {0}, not fully populated")]
    ShortChunk(u64),

    #[error("backend: {0}")]
    Backend(#[from] S3Error),

    #[error("compression failed: {0}")]
    Compress(#[source] io::Error),
}
