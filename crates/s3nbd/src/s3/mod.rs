//! Minimal S3-compatible backend client.
//!
//! Chunks are single objects addressed as `/bucket/device/chunkname`, so
//! the client only needs GET, HEAD and PUT with AWS Signature V2 over a
//! small pool of keep-alive connections. Requests and responses are framed
//! by hand; there is no need for a full HTTP stack.

mod http;
mod pool;
mod sign;

pub use http::{ResponseHead, MAX_HEADER_BYTES};
pub use pool::{Pool, PooledConn, Response};
pub use sign::{authorization, http_date, string_to_sign};

/// HTTP verb subset used against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Head,
    Put,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Put => "PUT",
        }
    }
}
