//! Line framer
//!
//! Turns an append-only byte stream into lines. A line ends at `\n`; a `\r`
//! directly before the `\n` is dropped as well. Framing can be switched off,
//! in which case bytes keep accumulating (used to capture raw uploads).

/// Growable byte buffer that yields complete lines
#[derive(Debug, Clone)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    enabled: bool,
    bytes: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    /// Empty, enabled framer
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            enabled: true,
            bytes: 0,
        }
    }

    /// Append a chunk and hand every complete line to `on_line`.
    pub fn feed<F>(&mut self, data: &[u8], mut on_line: F)
    where
        F: FnMut(String),
    {
        self.bytes += data.len() as u64;
        self.buffer.extend_from_slice(data);
        if !self.enabled {
            return;
        }
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let lf = start + offset;
            let end = if lf > start && self.buffer[lf - 1] == b'\r' {
                lf - 1
            } else {
                lf
            };
            on_line(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = lf + 1;
        }
        self.buffer.drain(..start);
    }

    /// Append a chunk and return the complete lines
    pub fn feed_lines(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        self.feed(data, |line| lines.push(line));
        lines
    }

    /// Suspend or resume line extraction
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether lines are being extracted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Total bytes received
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Bytes not yet consumed as lines
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the unconsumed bytes, leaving the buffer empty
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_framing() {
        let mut lb = LineBuffer::new();
        assert_eq!(lb.feed_lines(b"G28\r\nM105\n"), vec!["G28", "M105"]);
        assert!(lb.pending().is_empty());
    }

    #[test]
    fn test_partial_lines_carry_over() {
        let mut lb = LineBuffer::new();
        assert!(lb.feed_lines(b"ok T:2").is_empty());
        assert_eq!(lb.feed_lines(b"10.0\nok"), vec!["ok T:210.0"]);
        assert_eq!(lb.pending(), b"ok");
        assert_eq!(lb.bytes(), 13);
    }

    #[test]
    fn test_empty_lines_and_lone_cr() {
        let mut lb = LineBuffer::new();
        assert_eq!(lb.feed_lines(b"\n\r\na\rb\n"), vec!["", "", "a\rb"]);
    }

    #[test]
    fn test_disabled_accumulates() {
        let mut lb = LineBuffer::new();
        assert_eq!(lb.feed_lines(b"*upload part.gcode\nG1"), vec!["*upload part.gcode"]);
        lb.set_enabled(false);
        assert!(lb.feed_lines(b" X1\nG1 X2\n").is_empty());
        assert_eq!(lb.take_buffer(), b"G1 X1\nG1 X2\n".to_vec());
        assert_eq!(lb.bytes(), 30);
    }
}
