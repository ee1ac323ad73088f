//! Serial port transport
//!
//! Opens the device with the `serialport` crate. Reads happen on a blocking
//! task that forwards every chunk as a [`TransportEvent`]; writes go straight
//! to the port from the engine.

use super::{EventSender, Transport, TransportEvent};
use gridlink_core::ConnectionError;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
    /// USB vendor ID if applicable
    pub vid: Option<u16>,
    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List serial ports that look like a motion controller.
///
/// Arduino and Marlin USB devices are preferred; otherwise any USB port is
/// returned in enumeration order.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, ConnectionError> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::FailedToOpen {
            port: "*".to_string(),
            reason: e.to_string(),
        }
    })?;

    let mut found: Vec<SerialPortInfo> = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => Some(SerialPortInfo {
                port_name: port.port_name,
                manufacturer: usb.manufacturer,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            }),
            _ => None,
        })
        .collect();

    found.sort_by_key(|p| !is_known_controller(p));
    Ok(found)
}

fn is_known_controller(port: &SerialPortInfo) -> bool {
    port.manufacturer
        .as_deref()
        .map(|m| {
            let m = m.to_lowercase();
            m.contains("arduino") || m.contains("marlinfw.org")
        })
        .unwrap_or(false)
}

/// Serial transport
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open `path` at `baud` and start the reader task.
    pub fn open(
        path: &str,
        baud: u32,
        generation: u64,
        events: EventSender,
    ) -> Result<Self, ConnectionError> {
        let port = serialport::new(path, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", path, e);
                ConnectionError::FailedToOpen {
                    port: path.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let reader = port
            .try_clone()
            .map_err(|e| ConnectionError::FailedToOpen {
                port: path.to_string(),
                reason: e.to_string(),
            })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        tokio::task::spawn_blocking(move || read_loop(reader, generation, events, stop));

        tracing::info!("Opened serial port {} at {} baud", path, baud);
        Ok(Self {
            name: path.to_string(),
            port: Some(port),
            shutdown,
        })
    }
}

fn read_loop(
    mut reader: Box<dyn serialport::SerialPort>,
    generation: u64,
    events: EventSender,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = events.send(TransportEvent::closed(generation));
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if events.send(TransportEvent::data(generation, &buf[..n])).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Serial read failed: {}", e);
                let _ = events.send(TransportEvent::error(generation, e.to_string()));
                return;
            }
        }
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let port = self.port.as_mut().ok_or(ConnectionError::NotConnected)?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| ConnectionError::WriteFailed {
                reason: e.to_string(),
            })
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.port.take().is_some() {
            tracing::info!("Closed serial port {}", self.name);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
