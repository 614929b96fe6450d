//! In-process S3 stand-in for tests.
//!
//! Speaks just enough HTTP/1.1 to satisfy the client: GET/HEAD/PUT on
//! `/bucket/folder/object` with Content-Length framing and MD5 ETags.
//! Connections are served by one thread each and kept alive across
//! requests; listener threads live until the test process exits.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytesize::ByteSize;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::config::{Device, S3Config};

#[derive(Default)]
pub struct Counters {
    pub gets: AtomicUsize,
    pub heads: AtomicUsize,
    pub puts: AtomicUsize,
}

pub struct MockS3 {
    pub addr: SocketAddr,
    pub objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub counters: Arc<Counters>,
}

impl MockS3 {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let objects: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();
        let counters = Arc::new(Counters::default());

        {
            let objects = Arc::clone(&objects);
            let counters = Arc::clone(&counters);
            std::thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    let objects = Arc::clone(&objects);
                    let counters = Arc::clone(&counters);
                    std::thread::spawn(move || serve_conn(stream, &objects, &counters));
                }
            });
        }

        Self {
            addr,
            objects,
            counters,
        }
    }

    /// Client configuration pointing at this server.
    pub fn s3_config(&self) -> S3Config {
        S3Config {
            hosts: vec![self.addr.ip().to_string()],
            ports: vec![self.addr.port()],
            tls: false,
            host_header: None,
            bucket: "bucket".to_string(),
            access_key: "test-access-key".to_string(),
            secret_key: "test-secret-key".to_string(),
            timeout_ms: 5_000,
            max_requests_per_connection: 100,
            fetchers: 2,
        }
    }

    pub fn put_object(&self, key: &str, body: Vec<u8>) {
        self.objects.lock().insert(key.to_string(), body);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }
}

pub fn test_device(name: &str, cache_dir: &std::path::Path, size: u64) -> Device {
    Device {
        name: name.to_string(),
        cache_dir: cache_dir.to_path_buf(),
        size: ByteSize::b(size),
    }
}

fn serve_conn(
    mut stream: TcpStream,
    objects: &Mutex<HashMap<String, Vec<u8>>>,
    counters: &Counters,
) {
    loop {
        let Some((verb, path, content_length)) = read_request_head(&mut stream) else {
            return;
        };
        let mut body = vec![0u8; content_length];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let response = match verb.as_str() {
            "GET" => {
                counters.gets.fetch_add(1, Ordering::SeqCst);
                match objects.lock().get(&path) {
                    Some(obj) => ok_response(obj, true),
                    None => not_found(),
                }
            }
            "HEAD" => {
                counters.heads.fetch_add(1, Ordering::SeqCst);
                match objects.lock().get(&path) {
                    Some(obj) => ok_response(obj, false),
                    None => not_found(),
                }
            }
            "PUT" => {
                counters.puts.fetch_add(1, Ordering::SeqCst);
                let etag = hex::encode(Md5::digest(&body));
                objects.lock().insert(path, body);
                format!("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nETag: \"{etag}\"\r\n\r\n")
                    .into_bytes()
            }
            _ => b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n".to_vec(),
        };

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn ok_response(obj: &[u8], with_body: bool) -> Vec<u8> {
    let etag = hex::encode(Md5::digest(obj));
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"{etag}\"\r\n\r\n",
        obj.len()
    )
    .into_bytes();
    if with_body {
        response.extend_from_slice(obj);
    }
    response
}

fn not_found() -> Vec<u8> {
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
}

/// Returns (verb, path, content-length), or None when the client hung up.
fn read_request_head(stream: &mut TcpStream) -> Option<(String, String, usize)> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => buf.push(byte[0]),
            _ => return None,
        }
    }
    let text = String::from_utf8(buf).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let verb = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok()?;
            }
        }
    }
    Some((verb, path, content_length))
}
