//! Chunk naming and byte-range translation.
//!
//! Devices are divided into fixed 8 MiB chunks. Each chunk is materialized
//! as a file named by the 16-hex-digit chunk index inside the device's
//! cache directory, and stored under `bucket/device/<name>` in the backend.

use crate::CHUNK_SIZE;

/// A sub-range of one chunk, produced by [`split_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Chunk index within the device
    pub index: u64,
    /// Start offset within the chunk (inclusive)
    pub start: u64,
    /// End offset within the chunk (exclusive)
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Cache file (and backend object) name for a chunk index.
pub fn chunk_file_name(index: u64) -> String {
    format!("{index:016x}")
}

/// Parse a cache directory entry back into a chunk index. Only 16-digit
/// lowercase hex names are chunk files; everything else is ignored by the
/// scanner.
pub fn parse_chunk_file_name(name: &str) -> Option<u64> {
    if name.len() != 16 || !name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Split a device byte range into per-chunk sub-ranges at chunk boundaries.
///
/// The returned ranges are contiguous and in ascending order, so a request
/// buffer can be filled/consumed front to back.
pub fn split_range(offset: u64, len: u64) -> Vec<ChunkRange> {
    if len == 0 {
        return Vec::new();
    }

    let end = offset + len;
    let first = offset / CHUNK_SIZE;
    let last = (end - 1) / CHUNK_SIZE;

    let mut ranges = Vec::with_capacity((last - first + 1) as usize);
    for index in first..=last {
        let chunk_start = index * CHUNK_SIZE;
        let chunk_end = chunk_start + CHUNK_SIZE;
        ranges.push(ChunkRange {
            index,
            start: offset.max(chunk_start) - chunk_start,
            end: end.min(chunk_end) - chunk_start,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        assert_eq!(chunk_file_name(0), "0000000000000000");
        assert_eq!(chunk_file_name(0x1a2b), "0000000000001a2b");
        assert_eq!(parse_chunk_file_name("0000000000001a2b"), Some(0x1a2b));
        assert_eq!(parse_chunk_file_name("0000000000001A2B"), None);
        assert_eq!(parse_chunk_file_name("00000000001a2b"), None);
        assert_eq!(parse_chunk_file_name("000000000000zzzz"), None);
    }

    #[test]
    fn split_within_one_chunk() {
        let r = split_range(CHUNK_SIZE + 100, 200);
        assert_eq!(
            r,
            vec![ChunkRange {
                index: 1,
                start: 100,
                end: 300
            }]
        );
    }

    #[test]
    fn split_spanning_two_chunks() {
        let r = split_range(CHUNK_SIZE - 10, 30);
        assert_eq!(
            r,
            vec![
                ChunkRange {
                    index: 0,
                    start: CHUNK_SIZE - 10,
                    end: CHUNK_SIZE
                },
                ChunkRange {
                    index: 1,
                    start: 0,
                    end: 20
                },
            ]
        );
    }

    #[test]
    fn split_exact_chunk() {
        let r = split_range(0, CHUNK_SIZE);
        assert_eq!(
            r,
            vec![ChunkRange {
                index: 0,
                start: 0,
                end: CHUNK_SIZE
            }]
        );
    }

    #[test]
    fn split_multi_chunk() {
        let r = split_range(CHUNK_SIZE / 2, 3 * CHUNK_SIZE);
        assert_eq!(r.len(), 4);
        assert_eq!(r[0].start, CHUNK_SIZE / 2);
        assert_eq!(r[0].end, CHUNK_SIZE);
        assert_eq!(r[1], ChunkRange { index: 1, start: 0, end: CHUNK_SIZE });
        assert_eq!(r[3], ChunkRange { index: 3, start: 0, end: CHUNK_SIZE / 2 });
        let total: u64 = r.iter().map(ChunkRange::len).sum();
        assert_eq!(total, 3 * CHUNK_SIZE);
    }

    #[test]
    fn split_empty() {
        assert!(split_range(1234, 0).is_empty());
    }
}
