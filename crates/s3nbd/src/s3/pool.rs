//! Keep-alive backend connection pool.
//!
//! A fixed array of slots, each guarded by a mutex. Connections are
//! opened lazily on first use and recycled after a configured number of
//! requests or after any transport failure; every (re)connect takes the
//! next (host, port) pair off a rotating cursor, so all configured
//! endpoints are used even with fewer slots than endpoints.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::S3Config;
use crate::error::S3Error;

use super::http::read_response_head;
use super::sign;
use super::Verb;

/// Cap on drained (non-GET) response bodies, typically error XML.
const DISCARD_BODY_CAP: u64 = 64 * 1024;

/// Outcome of a backend request after the full response was consumed.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub status: u16,
    pub etag_md5: Option<[u8; 16]>,
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

struct Slot {
    /// Endpoint of the current connection, assigned at connect time
    host: String,
    port: u16,
    transport: Option<Transport>,
    /// Requests left before the connection is recycled
    remaining: u16,
    /// Set while a request is in flight, cleared once the response has
    /// been consumed; a poisoned connection is torn down on release
    error: bool,
}

/// Endpoint for a connection ordinal: hosts rotate fastest, then ports.
fn endpoint_for(index: usize, hosts: &[String], ports: &[u16]) -> (String, u16) {
    let host = hosts[index % hosts.len()].clone();
    let port = ports[(index / hosts.len()) % ports.len()];
    (host, port)
}

pub struct Pool {
    slots: Box<[Mutex<Slot>]>,
    hint: AtomicUsize,
    /// Advances on every (re)connect, so all configured endpoints get
    /// their turn even when there are fewer slots than endpoints
    endpoint_cursor: AtomicUsize,
    config: S3Config,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Pool {
    pub fn new(config: S3Config) -> Self {
        let tls = config.tls.then(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        });

        let slots = (0..config.fetchers)
            .map(|_| {
                Mutex::new(Slot {
                    host: String::new(),
                    port: 0,
                    transport: None,
                    remaining: config.max_requests_per_connection,
                    error: false,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            hint: AtomicUsize::new(0),
            endpoint_cursor: AtomicUsize::new(0),
            config,
            tls,
        }
    }

    /// Grab a connection slot. Scans for a free one starting at the
    /// rotating hint; when every slot is busy, waits on the hinted slot
    /// up to the configured timeout before giving up.
    pub fn acquire(&self) -> Result<PooledConn<'_>, S3Error> {
        let hint = self.hint.fetch_add(1, Ordering::Relaxed);
        let n = self.slots.len();
        for i in 0..n {
            if let Some(slot) = self.slots[(hint + i) % n].try_lock() {
                return Ok(PooledConn { slot, pool: self });
            }
        }
        self.slots[hint % n]
            .try_lock_for(self.config.timeout())
            .map(|slot| PooledConn { slot, pool: self })
            .ok_or(S3Error::PoolBusy)
    }

    fn connect(&self, host: &str, port: u16) -> Result<Transport, S3Error> {
        let timeout = self.config.timeout();
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| S3Error::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        let stream = stream.ok_or_else(|| S3Error::Connect {
            host: host.to_string(),
            port,
            source: last_err,
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        debug!(host, port, "backend connection opened");

        match &self.tls {
            None => Ok(Transport::Plain(stream)),
            Some(tls_config) => {
                let name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|_| S3Error::BadResponse("host is not a valid TLS server name"))?;
                let conn = rustls::ClientConnection::new(tls_config.clone(), name)
                    .map_err(|source| S3Error::Tls {
                        host: host.to_string(),
                        source,
                    })?;
                Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(
                    conn, stream,
                ))))
            }
        }
    }
}

/// A checked-out pool slot. Dropping it returns the slot; the connection
/// is torn down first if the last request failed mid-exchange or the
/// per-connection request budget ran out.
pub struct PooledConn<'a> {
    slot: MutexGuard<'a, Slot>,
    pool: &'a Pool,
}

impl PooledConn<'_> {
    /// Perform one request against `/{bucket}/{folder}/{object}`.
    ///
    /// For PUT, `body` carries the payload and its MD5 (sent as
    /// Content-MD5 and signed). GET bodies are appended to `out`, which is
    /// cleared first; bodies larger than `max_body` poison the connection
    /// and fail. Non-2xx statuses are returned, not treated as transport
    /// errors.
    pub fn request(
        &mut self,
        verb: Verb,
        folder: &str,
        object: &str,
        body: Option<(&[u8], &[u8; 16])>,
        out: &mut Vec<u8>,
        max_body: usize,
    ) -> Result<Response, S3Error> {
        if self.slot.transport.is_none() {
            let ordinal = self.pool.endpoint_cursor.fetch_add(1, Ordering::Relaxed);
            let (host, port) =
                endpoint_for(ordinal, &self.pool.config.hosts, &self.pool.config.ports);
            let transport = self.pool.connect(&host, port)?;
            self.slot.host = host;
            self.slot.port = port;
            self.slot.transport = Some(transport);
            self.slot.remaining = self.pool.config.max_requests_per_connection;
        }
        self.slot.error = true;

        let response = self.exchange(verb, folder, object, body, out, max_body)?;

        self.slot.error = false;
        self.slot.remaining = self.slot.remaining.saturating_sub(1);
        Ok(response)
    }

    fn exchange(
        &mut self,
        verb: Verb,
        folder: &str,
        object: &str,
        body: Option<(&[u8], &[u8; 16])>,
        out: &mut Vec<u8>,
        max_body: usize,
    ) -> Result<Response, S3Error> {
        let config = &self.pool.config;
        let date = sign::http_date();
        let md5_b64 = match body {
            Some((_, md5)) => BASE64.encode(md5),
            None => String::new(),
        };
        let sts = sign::string_to_sign(verb, &md5_b64, &date, &config.bucket, folder, object);
        let auth = sign::authorization(&config.access_key, &config.secret_key, &sts);

        let host_header = config
            .host_header
            .as_deref()
            .unwrap_or(self.slot.host.as_str());
        let mut head = format!(
            "{} /{}/{}/{} HTTP/1.1\r\nHost: {}\r\nDate: {}\r\nAuthorization: {}\r\n",
            verb.as_str(),
            config.bucket,
            folder,
            object,
            host_header,
            date,
            auth,
        );
        if let Some((payload, _)) = body {
            head.push_str(&format!(
                "Content-Length: {}\r\nContent-MD5: {}\r\n",
                payload.len(),
                md5_b64
            ));
        }
        head.push_str("\r\n");

        let transport = self
            .slot
            .transport
            .as_mut()
            .ok_or(S3Error::BadResponse("connection lost before request"))?;
        transport.write_all(head.as_bytes())?;
        if let Some((payload, _)) = body {
            transport.write_all(payload)?;
        }
        transport.flush()?;

        let (response_head, leftover) = read_response_head(transport)?;

        // HEAD advertises the object length but carries no body
        let body_len = if verb == Verb::Head {
            0
        } else {
            response_head.content_length
        };

        if verb == Verb::Get && response_head.status == 200 {
            if body_len > max_body as u64 {
                return Err(S3Error::BodyTooLarge {
                    got: body_len,
                    limit: max_body as u64,
                });
            }
            out.clear();
            out.extend_from_slice(&leftover);
            if (out.len() as u64) < body_len {
                let mut remaining = transport.take(body_len - out.len() as u64);
                remaining.read_to_end(out)?;
            }
            if out.len() as u64 != body_len {
                return Err(S3Error::BadResponse("connection closed in response body"));
            }
        } else {
            // drain error bodies so the connection stays framed
            if body_len > DISCARD_BODY_CAP {
                return Err(S3Error::BodyTooLarge {
                    got: body_len,
                    limit: DISCARD_BODY_CAP,
                });
            }
            let mut drained = leftover.len() as u64;
            let mut scratch = [0u8; 4096];
            while drained < body_len {
                let want = ((body_len - drained) as usize).min(scratch.len());
                let n = transport.read(&mut scratch[..want])?;
                if n == 0 {
                    return Err(S3Error::BadResponse("connection closed in response body"));
                }
                drained += n as u64;
            }
        }

        Ok(Response {
            status: response_head.status,
            etag_md5: response_head.etag_md5,
        })
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if self.slot.error || self.slot.remaining == 0 {
            if self.slot.error {
                debug!(
                    host = %self.slot.host,
                    port = self.slot.port,
                    "dropping backend connection after failed exchange"
                );
            }
            self.slot.transport = None;
            self.slot.remaining = self.pool.config.max_requests_per_connection;
            self.slot.error = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn endpoints_rotate_hosts_first() {
        let h = hosts(&["a", "b"]);
        let p = vec![80, 8080];
        assert_eq!(endpoint_for(0, &h, &p), ("a".to_string(), 80));
        assert_eq!(endpoint_for(1, &h, &p), ("b".to_string(), 80));
        assert_eq!(endpoint_for(2, &h, &p), ("a".to_string(), 8080));
        assert_eq!(endpoint_for(3, &h, &p), ("b".to_string(), 8080));
        assert_eq!(endpoint_for(4, &h, &p), ("a".to_string(), 80));
    }

    #[test]
    fn single_endpoint_is_stable() {
        let h = hosts(&["only"]);
        let p = vec![9000];
        for i in 0..5 {
            assert_eq!(endpoint_for(i, &h, &p), ("only".to_string(), 9000));
        }
    }

    #[test]
    fn reconnects_reach_all_endpoints() {
        use crate::testutil::MockS3;

        let a = MockS3::spawn();
        let b = MockS3::spawn();
        let mut config = a.s3_config();
        config.ports = vec![a.addr.port(), b.addr.port()];
        config.fetchers = 1;
        config.max_requests_per_connection = 1;
        let pool = Pool::new(config);

        // each exhausted budget tears the connection down, so the next
        // request connects to the following endpoint
        let mut out = Vec::new();
        for _ in 0..4 {
            let mut conn = pool.acquire().unwrap();
            let response = conn
                .request(Verb::Get, "disk0", "0000000000000000", None, &mut out, 1024)
                .unwrap();
            assert_eq!(response.status, 404);
        }
        assert_eq!(a.counters.gets.load(Ordering::SeqCst), 2);
        assert_eq!(b.counters.gets.load(Ordering::SeqCst), 2);
    }
}
