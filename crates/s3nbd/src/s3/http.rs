//! Hand-rolled HTTP/1.1 response head parsing.
//!
//! The backend speaks plain HTTP/1.1 with Content-Length framing; chunked
//! transfer encoding is never negotiated because requests are HTTP/1.1
//! without `TE` and responses to GET/HEAD/PUT of small objects always
//! carry Content-Length. A response without one is rejected.

use std::io::Read;

use crate::error::S3Error;

/// Upper bound on accumulated response header bytes.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Parsed response status line and the headers the client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: u64,
    /// MD5 from a simple (non-multipart) ETag, when present and well-formed
    pub etag_md5: Option<[u8; 16]>,
}

/// Read from `stream` until the blank line ending the header block, parse
/// the head, and return it together with any body bytes that were read
/// past the header boundary.
pub fn read_response_head<R: Read>(stream: &mut R) -> Result<(ResponseHead, Vec<u8>), S3Error> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut scratch = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(S3Error::BadResponse("response header exceeds 8 KiB"));
        }
        let n = stream.read(&mut scratch)?;
        if n == 0 {
            return Err(S3Error::BadResponse("connection closed in response header"));
        }
        buf.extend_from_slice(&scratch[..n]);
        if buf.len() > MAX_HEADER_BYTES + scratch.len() {
            return Err(S3Error::BadResponse("response header exceeds 8 KiB"));
        }
    };

    let head = parse_head(&buf[..header_end])?;
    let leftover = buf.split_off(header_end + 4);
    Ok((head, leftover))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, S3Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| S3Error::BadResponse("response header is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or(S3Error::BadResponse("empty response header"))?;
    let status = parse_status_line(status_line)?;

    let mut content_length: Option<u64> = None;
    let mut etag_md5: Option<[u8; 16]> = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .parse()
                    .map_err(|_| S3Error::BadResponse("unparseable Content-Length"))?,
            );
        } else if name.eq_ignore_ascii_case("etag") {
            etag_md5 = parse_etag_md5(value);
        }
    }

    let content_length =
        content_length.ok_or(S3Error::BadResponse("response lacks Content-Length"))?;

    Ok(ResponseHead {
        status,
        content_length,
        etag_md5,
    })
}

fn parse_status_line(line: &str) -> Result<u16, S3Error> {
    if !line.starts_with("HTTP/1.") {
        return Err(S3Error::BadResponse("bad HTTP status line"));
    }
    line.split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(S3Error::BadResponse("bad HTTP status line"))
}

/// A simple-upload ETag is the quoted lowercase hex MD5 of the object.
/// Multipart ETags (with a `-N` suffix) and anything else unparseable are
/// treated as absent so callers fall back to uploading.
fn parse_etag_md5(value: &str) -> Option<[u8; 16]> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    if inner.len() != 32 {
        return None;
    }
    let mut md5 = [0u8; 16];
    hex::decode_to_slice(inner, &mut md5).ok()?;
    Some(md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_ok_response_with_etag() {
        let raw = b"HTTP/1.1 200 OK\r\n\
                    Content-Length: 5\r\n\
                    ETag: \"d41d8cd98f00b204e9800998ecf8427e\"\r\n\
                    \r\nhello";
        let mut cursor = Cursor::new(&raw[..]);
        let (head, leftover) = read_response_head(&mut cursor).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, 5);
        assert_eq!(
            head.etag_md5,
            Some([
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec,
                0xf8, 0x42, 0x7e
            ])
        );
        assert_eq!(leftover, b"hello");
    }

    #[test]
    fn multipart_etag_is_ignored() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nETag: \"abc123-4\"\r\n\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        let (head, _) = read_response_head(&mut cursor).unwrap();
        assert_eq!(head.etag_md5, None);
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        assert!(matches!(
            read_response_head(&mut cursor),
            Err(S3Error::BadResponse(_))
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        let mut cursor = Cursor::new(&raw[..]);
        assert!(read_response_head(&mut cursor).is_err());
    }

    #[test]
    fn oversized_header_is_an_error() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        raw.extend(std::iter::repeat(b'x').take(MAX_HEADER_BYTES));
        let mut cursor = Cursor::new(raw);
        assert!(matches!(
            read_response_head(&mut cursor),
            Err(S3Error::BadResponse(_))
        ));
    }

    #[test]
    fn status_line_variants() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found").unwrap(), 404);
        assert_eq!(parse_status_line("HTTP/1.0 200 OK").unwrap(), 200);
        assert!(parse_status_line("SSH-2.0-OpenSSH").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
    }
}
