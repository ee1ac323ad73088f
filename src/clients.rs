//! Client front ends
//!
//! The console prints everything it is sent with a timestamp and, when
//! enabled, reads commands from stdin. The control port accepts raw TCP
//! clients speaking the same line protocol. Both register with the
//! [`ClientHub`] and forward lines to the event loop.

use crate::runtime::{EventSender, RuntimeEvent};
use gridlink_communication::LineBuffer;
use gridlink_core::{ClientHub, ClientId, ClientKind};
use gridlink_settings::Config;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Read the persistent controller id, creating it on first start.
pub fn load_or_create_uuid(path: &Path) -> std::io::Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &id)?;
    tracing::info!("created controller id {}", id);
    Ok(id)
}

/// Configured name, else the host name, else `gridlink`
pub fn display_name(config: &Config) -> String {
    config
        .name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "gridlink".to_string())
}

/// Local addresses clients can reach us on. Connecting a UDP socket sends
/// nothing; it only makes the OS pick the outbound interface.
pub fn local_addresses() -> Vec<String> {
    let probe = || -> std::io::Result<SocketAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("192.0.2.1:9")?;
        socket.local_addr()
    };
    match probe() {
        Ok(addr) if !addr.ip().is_unspecified() => vec![addr.ip().to_string()],
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!("no routable address: {}", e);
            Vec::new()
        }
    }
}

/// Register the console client. Output is printed to stdout; commands are
/// read from stdin only when `read_stdin` is set.
pub fn spawn_console(hub: Arc<ClientHub>, events: EventSender, read_stdin: bool) -> ClientId {
    let (id, mut rx) = hub.register(ClientKind::Console);
    let _ = events.send(RuntimeEvent::ClientJoined(id));

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), line);
        }
    });

    if read_stdin {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = RuntimeEvent::ClientLine { id: Some(id), line };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("stdin: {}", e);
                        break;
                    }
                }
            }
        });
    }
    id
}

/// Bind the control port and accept clients in the background. Returns the
/// bound address.
pub async fn bind_control_port(
    port: u16,
    hub: Arc<ClientHub>,
    events: EventSender,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("control port listening on {}", addr);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!("client connected from {}", peer);
                    tokio::spawn(serve_client(stream, hub.clone(), events.clone()));
                }
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    });
    Ok(addr)
}

async fn serve_client(stream: TcpStream, hub: Arc<ClientHub>, events: EventSender) {
    let (id, mut rx) = hub.register(ClientKind::Net);
    let (mut reader, mut writer) = stream.into_split();
    let _ = events.send(RuntimeEvent::ClientJoined(id));

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let mut data = line.into_bytes();
            data.push(b'\n');
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let mut session = NetSession::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in session.feed(&buf[..n]) {
                    let _ = events.send(RuntimeEvent::ClientLine { id: Some(id), line });
                }
            }
            Err(e) => {
                tracing::debug!("{} read failed: {}", id, e);
                break;
            }
        }
    }

    if let Some((name, data)) = session.finish() {
        let _ = events.send(RuntimeEvent::Upload { name, data });
    }
    hub.unregister(id);
    writer_task.abort();
    let _ = events.send(RuntimeEvent::ClientLeft(id));
    tracing::info!("{} disconnected", id);
}

/// Line state of one control port connection.
///
/// `*upload <name>` switches the connection into raw mode: framing stops and
/// everything that follows, up to the close, is the file content.
#[derive(Debug, Default)]
pub struct NetSession {
    framer: LineBuffer,
    upload: Option<String>,
    carried: Vec<u8>,
}

impl NetSession {
    /// Fresh session in line mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the upload in progress
    pub fn upload(&self) -> Option<&str> {
        self.upload.as_deref()
    }

    /// Feed received bytes. Returns the command lines to dispatch.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let upload = &mut self.upload;
        let carried = &mut self.carried;
        let mut lines = Vec::new();
        self.framer.feed(data, |line| {
            if upload.is_some() {
                carried.extend_from_slice(line.as_bytes());
                carried.push(b'\n');
                return;
            }
            match line.trim().strip_prefix("*upload") {
                Some(name) if name.is_empty() || name.starts_with(char::is_whitespace) => {
                    *upload = Some(name.trim().to_string());
                }
                _ => lines.push(line),
            }
        });
        if let Some(name) = &self.upload {
            if self.framer.is_enabled() {
                tracing::debug!("receiving upload {}", name);
                self.framer.set_enabled(false);
            }
        }
        lines
    }

    /// Close the session. Returns the upload name and content when one was
    /// in progress.
    pub fn finish(mut self) -> Option<(String, Vec<u8>)> {
        let name = self.upload.take()?;
        let mut data = std::mem::take(&mut self.carried);
        data.extend(self.framer.take_buffer());
        Some((name, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_lines() {
        let mut session = NetSession::new();
        assert_eq!(session.feed(b"*status\nG2"), vec!["*status"]);
        assert_eq!(session.feed(b"8\r\n"), vec!["G28"]);
        assert!(session.finish().is_none());
    }

    #[test]
    fn test_session_upload() {
        let mut session = NetSession::new();
        let lines = session.feed(b"*status\n*upload part.gcode\nG1 X1\nG1");
        assert_eq!(lines, vec!["*status"]);
        assert_eq!(session.upload(), Some("part.gcode"));
        assert!(session.feed(b" X2\n*abort\n").is_empty());
        let (name, data) = session.finish().unwrap();
        assert_eq!(name, "part.gcode");
        assert_eq!(data, b"G1 X1\nG1 X2\n*abort\n");
    }

    #[test]
    fn test_uploaded_is_not_upload() {
        let mut session = NetSession::new();
        assert_eq!(session.feed(b"*uploaded\n"), vec!["*uploaded"]);
        assert!(session.upload().is_none());
    }

    #[test]
    fn test_uuid_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc").join("uuid");
        let first = load_or_create_uuid(&path).unwrap();
        assert_eq!(first.len(), 36);
        assert_eq!(load_or_create_uuid(&path).unwrap(), first);
    }

    #[test]
    fn test_display_name_prefers_config() {
        let config = Config {
            name: Some("bench".to_string()),
            ..Default::default()
        };
        assert_eq!(display_name(&config), "bench");
    }
}
