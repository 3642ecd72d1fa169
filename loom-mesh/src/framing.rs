//! Newline-delimited JSON framing for mesh connections.
//!
//! Bytes accumulate until a `\n` is seen. A buffer that grows past
//! [`MAX_FRAME_BUFFER`] without completing a line is an attack: the caller
//! must destroy the connection.

use crate::error::FrameError;
use crate::messages::MeshMessage;

/// Maximum bytes buffered while waiting for a newline (10MB).
pub const MAX_FRAME_BUFFER: usize = 10 * 1024 * 1024;

/// Incremental line decoder.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    // Prefix of `buf` already known to hold no newline.
    scanned: usize,
    limit: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_BUFFER)
    }
}

impl LineDecoder {
    /// Create a decoder with a custom buffer cap.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes and return every complete message.
    ///
    /// Lines that are empty or not valid messages are skipped. On overflow
    /// the buffer is discarded.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<MeshMessage>, FrameError> {
        self.buf.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line = &self.buf[start..end];
            start = end + 1;
            search_from = start;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<MeshMessage>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::debug!("Skipping malformed mesh frame: {}", e),
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.limit {
            let size = self.buf.len();
            self.buf = Vec::new();
            self.scanned = 0;
            return Err(FrameError::Overflow {
                size,
                limit: self.limit,
            });
        }

        Ok(messages)
    }
}

/// Encode a message as one line.
pub fn encode_line(message: &MeshMessage) -> Vec<u8> {
    // MeshMessage holds only strings, numbers and vectors of them.
    let mut line = serde_json::to_vec(message).unwrap_or_default();
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(timestamp: u64) -> MeshMessage {
        MeshMessage::Ping { timestamp }
    }

    #[test]
    fn decodes_split_lines() {
        let mut decoder = LineDecoder::default();
        let mut bytes = encode_line(&ping(1));
        bytes.extend(encode_line(&ping(2)));

        let (a, b) = bytes.split_at(5);
        assert!(decoder.push(a).unwrap().is_empty());
        assert_eq!(decoder.push(b).unwrap(), vec![ping(1), ping(2)]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn keeps_partial_tail() {
        let mut decoder = LineDecoder::default();
        let line = encode_line(&ping(7));
        let (head, tail) = line.split_at(line.len() - 3);

        assert!(decoder.push(head).unwrap().is_empty());
        assert_eq!(decoder.buffered(), head.len());
        assert_eq!(decoder.push(tail).unwrap(), vec![ping(7)]);
    }

    #[test]
    fn skips_garbage_lines() {
        let mut decoder = LineDecoder::default();
        let mut bytes = b"not json\n\n{\"type\":\"unknown\"}\n".to_vec();
        bytes.extend(encode_line(&ping(3)));
        assert_eq!(decoder.push(&bytes).unwrap(), vec![ping(3)]);
    }

    #[test]
    fn overflow_discards_buffer() {
        let mut decoder = LineDecoder::new(16);
        let err = decoder.push(&[b'a'; 17]).unwrap_err();
        assert_eq!(err, FrameError::Overflow { size: 17, limit: 16 });
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn complete_lines_do_not_count_toward_cap() {
        let mut decoder = LineDecoder::new(64);
        let line = encode_line(&ping(123_456));
        let mut bytes = Vec::new();
        for _ in 0..10 {
            bytes.extend_from_slice(&line);
        }
        assert!(bytes.len() > 64);
        assert_eq!(decoder.push(&bytes).unwrap().len(), 10);
    }

    #[test]
    fn newline_free_chunks_accumulate_until_cap() {
        let mut decoder = LineDecoder::new(4096);
        let chunk = [b'x'; 256];
        for i in 1..=16 {
            assert!(decoder.push(&chunk).unwrap().is_empty());
            assert_eq!(decoder.buffered(), i * chunk.len());
        }
        let err = decoder.push(&chunk).unwrap_err();
        assert_eq!(err, FrameError::Overflow { size: 17 * 256, limit: 4096 });
        assert_eq!(decoder.buffered(), 0);

        // The decoder is usable again after an overflow.
        assert_eq!(decoder.push(&encode_line(&ping(9))).unwrap(), vec![ping(9)]);
    }

    #[test]
    fn line_split_across_many_chunks_decodes() {
        let mut decoder = LineDecoder::default();
        let mut bytes = encode_line(&ping(42));
        bytes.extend(encode_line(&ping(43)));
        let last = bytes.len() - 1;
        for byte in &bytes[..last] {
            let decoded = decoder.push(std::slice::from_ref(byte)).unwrap();
            if *byte == b'\n' {
                assert_eq!(decoded, vec![ping(42)]);
            } else {
                assert!(decoded.is_empty());
            }
        }
        assert_eq!(decoder.push(&bytes[last..]).unwrap(), vec![ping(43)]);
        assert_eq!(decoder.buffered(), 0);
    }
}
