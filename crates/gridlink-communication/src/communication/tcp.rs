//! TCP transport for networked devices (`host:port`).

use super::{EventSender, Transport, TransportEvent};
use gridlink_core::ConnectionError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// TCP transport. Writes are handed to a writer task so the engine never
/// blocks on the socket.
pub struct TcpTransport {
    name: String,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Connect and start the reader and writer tasks.
    pub async fn connect(
        host: &str,
        port: u16,
        generation: u64,
        events: EventSender,
    ) -> Result<Self, ConnectionError> {
        let name = format!("{}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            tracing::warn!("Failed to connect to {}: {}", name, e);
            ConnectionError::FailedToOpen {
                port: name.clone(),
                reason: e.to_string(),
            }
        })?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let write_events = events.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = wr.write_all(&data).await {
                    let _ = write_events.send(TransportEvent::error(generation, e.to_string()));
                    return;
                }
            }
            let _ = wr.shutdown().await;
        });

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::closed(generation));
                        return;
                    }
                    Ok(n) => {
                        if events.send(TransportEvent::data(generation, &buf[..n])).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::error(generation, e.to_string()));
                        return;
                    }
                }
            }
        });

        tracing::info!("Connected to {}", name);
        Ok(Self {
            name,
            outbound: Some(outbound),
            reader,
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(data.to_vec())
            .map_err(|_| ConnectionError::ConnectionLost {
                reason: "writer stopped".to_string(),
            })
    }

    fn close(&mut self) {
        self.outbound = None;
        self.reader.abort();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
