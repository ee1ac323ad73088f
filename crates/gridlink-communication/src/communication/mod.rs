//! Device transports
//!
//! The engine talks to the device through the [`Transport`] trait only. Bytes
//! read from the device arrive asynchronously as [`TransportEvent`]s tagged
//! with the generation number the transport was opened under, so events from
//! a connection that has since been replaced can be discarded.

pub mod line_buffer;
pub mod memory;
pub mod serial;
pub mod tcp;

use gridlink_core::ConnectionError;
use std::fmt;
use tokio::sync::mpsc;

/// Sending half used by reader tasks to report device activity
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Duplex byte stream to the device
pub trait Transport: Send {
    /// Human-readable endpoint name
    fn name(&self) -> &str;

    /// Write raw bytes to the device
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Close the connection. Further writes fail.
    fn close(&mut self);
}

/// What happened on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Bytes received
    Data(Vec<u8>),
    /// Remote end closed
    Closed,
    /// Read or write failure
    Error(String),
}

/// Activity on the transport opened under `generation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Generation the transport was opened with
    pub generation: u64,
    /// Event payload
    pub kind: TransportEventKind,
}

impl TransportEvent {
    /// Data event
    pub fn data(generation: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Data(data.into()),
        }
    }

    /// Closed event
    pub fn closed(generation: u64) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Closed,
        }
    }

    /// Error event
    pub fn error(generation: u64, reason: impl Into<String>) -> Self {
        Self {
            generation,
            kind: TransportEventKind::Error(reason.into()),
        }
    }
}

/// Where the device lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// Serial device path
    Serial(String),
    /// Networked device
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl PortSpec {
    /// Parse a port string. A `:` after the first character selects TCP
    /// (`host:port`), anything else is a serial device path.
    pub fn parse(port: &str) -> Result<Self, ConnectionError> {
        let port = port.trim();
        if port.is_empty() {
            return Err(ConnectionError::NoPort);
        }
        match port.find(':') {
            Some(idx) if idx > 0 => {
                let (host, tcp_port) = (&port[..idx], &port[idx + 1..]);
                let tcp_port =
                    tcp_port
                        .parse::<u16>()
                        .map_err(|_| ConnectionError::InvalidAddress {
                            address: port.to_string(),
                        })?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port: tcp_port,
                })
            }
            _ => Ok(Self::Serial(port.to_string())),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(path) => write!(f, "{}", path),
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Open a transport and start its reader task.
pub async fn open_transport(
    spec: &PortSpec,
    baud: u32,
    generation: u64,
    events: EventSender,
) -> Result<Box<dyn Transport>, ConnectionError> {
    match spec {
        PortSpec::Serial(path) => {
            let transport = serial::SerialTransport::open(path, baud, generation, events)?;
            Ok(Box::new(transport))
        }
        PortSpec::Tcp { host, port } => {
            let transport = tcp::TcpTransport::connect(host, *port, generation, events).await?;
            Ok(Box::new(transport))
        }
    }
}
