//! In-memory transport
//!
//! Records every written line instead of talking to hardware. Used to drive
//! the engine without a device attached.

use super::Transport;
use gridlink_core::ConnectionError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared log of lines written to a [`MemoryTransport`]
#[derive(Debug, Clone, Default)]
pub struct WireLog {
    lines: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl WireLog {
    /// All lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Remove and return all lines written so far
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    /// Number of lines written so far
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// True when nothing was written
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// True once the transport was closed
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Transport that captures writes into a [`WireLog`]
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    log: WireLog,
    partial: String,
}

impl MemoryTransport {
    /// Create a transport and the log it writes to
    pub fn new(name: impl Into<String>) -> (Self, WireLog) {
        let log = WireLog::default();
        (
            Self {
                name: name.into(),
                log: log.clone(),
                partial: String::new(),
            },
            log,
        )
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.log.is_closed() {
            return Err(ConnectionError::NotConnected);
        }
        self.partial.push_str(&String::from_utf8_lossy(data));
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            self.log.lines.lock().push(line.trim_end().to_string());
        }
        Ok(())
    }

    fn close(&mut self) {
        *self.log.closed.lock() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_split_into_lines() {
        let (mut t, log) = MemoryTransport::new("mem");
        t.write(b"G28\nM1").unwrap();
        t.write(b"05\n").unwrap();
        assert_eq!(log.lines(), vec!["G28", "M105"]);
        t.close();
        assert!(log.is_closed());
        assert!(t.write(b"M114\n").is_err());
    }
}
