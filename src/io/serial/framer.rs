// src/io/serial/framer.rs
//
// Newline framing for the serial byte stream.
// Bytes are buffered until `\n`; a trailing `\r` is dropped. A line that grows
// past `max_length` without a newline is discarded up to the next newline
// rather than force-split, since half a CSV line decodes to garbage.

/// Default longest accepted line, in bytes (excluding the terminator)
pub const DEFAULT_MAX_LINE: usize = 256;

#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
    /// Set while skipping the tail of an over-long line
    overflowed: bool,
    discarded: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::with_capacity(max_length),
            max_length,
            overflowed: false,
            discarded: 0,
        }
    }

    /// Feed raw bytes, returning every complete line they finish.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == b'\n' {
                if self.overflowed {
                    self.overflowed = false;
                    self.discarded += 1;
                } else {
                    if self.buffer.last() == Some(&b'\r') {
                        self.buffer.pop();
                    }
                    if !self.buffer.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    }
                }
                self.buffer.clear();
                continue;
            }

            if self.overflowed {
                continue;
            }

            self.buffer.push(byte);

            // No newline within max_length: drop what we have and skip to the next one
            if self.buffer.len() > self.max_length {
                self.buffer.clear();
                self.overflowed = true;
            }
        }

        lines
    }

    /// Number of over-long lines thrown away so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_and_lf_lines() {
        let mut framer = LineFramer::default();
        let lines = framer.feed(b"1,2,3,4\r\n5,6,7,8\n");
        assert_eq!(lines, vec!["1,2,3,4", "5,6,7,8"]);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut framer = LineFramer::default();
        assert!(framer.feed(b"12,34").is_empty());
        assert!(framer.feed(b",56,").is_empty());
        assert_eq!(framer.feed(b"78\r\n9"), vec!["12,34,56,78"]);
        assert_eq!(framer.feed(b",9,9,9\n"), vec!["9,9,9,9"]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.feed(b"\n\r\n1,1,1,1\n"), vec!["1,1,1,1"]);
    }

    #[test]
    fn test_overlong_line_discarded() {
        let mut framer = LineFramer::new(8);
        // 12 bytes with no newline, then the rest of that line, then a good one
        let lines = framer.feed(b"123456789012");
        assert!(lines.is_empty());
        let lines = framer.feed(b"345\n1,2,3,4\n");
        assert_eq!(lines, vec!["1,2,3,4"]);
        assert_eq!(framer.discarded(), 1);
    }
}
