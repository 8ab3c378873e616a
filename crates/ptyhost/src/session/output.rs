//! Append-only record of everything a PTY has emitted.

use std::collections::VecDeque;
use std::time::SystemTime;

/// Default retention bound for captured output (8 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// A single read from the pty, as delivered by the OS.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Raw bytes, escape sequences included.
    pub bytes: Vec<u8>,
    /// When the chunk was read.
    pub timestamp: SystemTime,
}

/// Ordered record of output chunks.
///
/// Chunks are only ever appended. When the retained size exceeds
/// `max_bytes`, whole chunks are evicted from the front; the most recent
/// chunk is always kept even if it alone is larger than the bound.
#[derive(Debug)]
pub struct OutputRecord {
    chunks: VecDeque<OutputChunk>,
    retained_bytes: usize,
    dropped_bytes: u64,
    max_bytes: usize,
}

impl OutputRecord {
    /// Creates an empty record with the given retention bound.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            retained_bytes: 0,
            dropped_bytes: 0,
            max_bytes,
        }
    }

    /// Appends a chunk read from the pty.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        self.retained_bytes += bytes.len();
        self.chunks.push_back(OutputChunk {
            bytes: bytes.to_vec(),
            timestamp: SystemTime::now(),
        });

        while self.retained_bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.retained_bytes -= evicted.bytes.len();
                self.dropped_bytes += evicted.bytes.len() as u64;
            }
        }
    }

    /// Returns the retained bytes, concatenated in arrival order.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.retained_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }

    /// Returns the retained output decoded as UTF-8.
    ///
    /// Decoding happens over the concatenation, so a multi-byte character
    /// split across two reads is reassembled.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// Returns the retained chunks.
    pub fn chunks(&self) -> impl Iterator<Item = &OutputChunk> {
        self.chunks.iter()
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.retained_bytes
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.retained_bytes == 0
    }

    /// Total bytes ever appended, including evicted ones.
    pub fn total_bytes(&self) -> u64 {
        self.dropped_bytes + self.retained_bytes as u64
    }

    /// Bytes evicted by the retention policy.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}

impl Default for OutputRecord {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut record = OutputRecord::default();
        record.append(b"hello ");
        record.append(b"\x1b[31mworld\x1b[0m");
        assert_eq!(record.bytes(), b"hello \x1b[31mworld\x1b[0m".to_vec());
        assert_eq!(record.chunks().count(), 2);
        assert_eq!(record.len(), 20);
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut record = OutputRecord::default();
        record.append(b"");
        assert!(record.is_empty());
        assert_eq!(record.chunks().count(), 0);
    }

    #[test]
    fn test_split_utf8_reassembled() {
        let snowman = "☃".as_bytes();
        let mut record = OutputRecord::default();
        record.append(&snowman[..1]);
        record.append(&snowman[1..]);
        assert_eq!(record.text(), "☃");
    }

    #[test]
    fn test_retention_evicts_oldest_chunks() {
        let mut record = OutputRecord::new(10);
        record.append(b"aaaa");
        record.append(b"bbbb");
        record.append(b"cccc");

        assert_eq!(record.text(), "bbbbcccc");
        assert_eq!(record.dropped_bytes(), 4);
        assert_eq!(record.total_bytes(), 12);
    }

    #[test]
    fn test_retention_keeps_latest_oversized_chunk() {
        let mut record = OutputRecord::new(4);
        record.append(b"ab");
        record.append(b"0123456789");

        assert_eq!(record.text(), "0123456789");
        assert_eq!(record.dropped_bytes(), 2);
    }
}
