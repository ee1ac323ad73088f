//! Event loop
//!
//! One task owns the [`Controller`] and feeds it everything that happens:
//! device bytes, open results, client lines, child process output and timer
//! deadlines. Whatever the controller asks for in return (opening the port,
//! spawning the flasher or an `*exec` command, exiting) is carried out here.

use gridlink_communication::{
    open_transport, Controller, EngineRequest, LineBuffer, ProcessKind, Transport, TransportEvent,
};
use gridlink_core::{ClientHub, ClientId, ClientKind, ConnectionError};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Something for the event loop to hand to the controller
pub enum RuntimeEvent {
    /// An open request finished
    Opened {
        /// Generation the open was requested under
        generation: u64,
        /// The transport, or why it could not be opened
        result: Result<Box<dyn Transport>, ConnectionError>,
    },
    /// A client registered with the hub
    ClientJoined(ClientId),
    /// A client went away
    ClientLeft(ClientId),
    /// A command line from a client
    ClientLine {
        /// Originating client
        id: Option<ClientId>,
        /// Line without terminator
        line: String,
    },
    /// A completed `*upload`
    Upload {
        /// Target file name
        name: String,
        /// File content
        data: Vec<u8>,
    },
    /// A line of child process output
    ProcessLine {
        /// Which process
        kind: ProcessKind,
        /// Line without terminator
        line: String,
    },
    /// A child process exited
    ProcessExit {
        /// Which process
        kind: ProcessKind,
        /// Exit code, `None` if it never ran or was killed
        code: Option<i32>,
    },
}

impl std::fmt::Debug for RuntimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened { generation, result } => f
                .debug_struct("Opened")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            Self::ClientJoined(id) => f.debug_tuple("ClientJoined").field(id).finish(),
            Self::ClientLeft(id) => f.debug_tuple("ClientLeft").field(id).finish(),
            Self::ClientLine { id, line } => f
                .debug_struct("ClientLine")
                .field("id", id)
                .field("line", line)
                .finish(),
            Self::Upload { name, data } => f
                .debug_struct("Upload")
                .field("name", name)
                .field("bytes", &data.len())
                .finish(),
            Self::ProcessLine { kind, line } => f
                .debug_struct("ProcessLine")
                .field("kind", kind)
                .field("line", line)
                .finish(),
            Self::ProcessExit { kind, code } => f
                .debug_struct("ProcessExit")
                .field("kind", kind)
                .field("code", code)
                .finish(),
        }
    }
}

/// Sending half handed to client front ends and helper tasks
pub type EventSender = mpsc::UnboundedSender<RuntimeEvent>;

/// Owns the controller and the channels feeding it
pub struct Runtime {
    controller: Controller,
    hub: Arc<ClientHub>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    stdin_clients: usize,
}

impl Runtime {
    /// Wrap a controller. `stdin` says whether the console accepts commands.
    pub fn new(controller: Controller, hub: Arc<ClientHub>, stdin: bool) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            hub,
            events_tx,
            events_rx,
            transport_tx,
            transport_rx,
            stdin_clients: usize::from(stdin),
        }
    }

    /// Sender for client front ends
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Run until the controller asks to exit or the process is interrupted.
    /// Returns the exit code.
    pub async fn run(mut self) -> anyhow::Result<i32> {
        self.controller.start(Instant::now());
        self.update_clients();
        if let Some(code) = self.perform_requests() {
            return Ok(code);
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                Some(event) = self.transport_rx.recv() => {
                    self.controller.on_transport_event(event, Instant::now());
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
                _ = sleep_until(deadline) => self.controller.on_timers(Instant::now()),
                result = &mut shutdown => {
                    result?;
                    tracing::info!("interrupted, shutting down");
                    return Ok(0);
                }
            }
            if let Some(code) = self.perform_requests() {
                return Ok(code);
            }
        }
    }

    fn on_event(&mut self, event: RuntimeEvent) {
        tracing::trace!(?event, "runtime event");
        let now = Instant::now();
        match event {
            RuntimeEvent::Opened { generation, result } => match result {
                Ok(transport) => self.controller.on_open(generation, transport, now),
                Err(e) => self.controller.on_open_failed(generation, e, now),
            },
            RuntimeEvent::ClientJoined(id) => {
                self.hub.send_to(id, self.controller.greeting());
                self.update_clients();
            }
            RuntimeEvent::ClientLeft(_) => self.update_clients(),
            RuntimeEvent::ClientLine { id, line } => {
                self.controller.handle_client_line(&line, id, now);
            }
            RuntimeEvent::Upload { name, data } => {
                if let Err(e) = self.controller.store_upload(&name, &data) {
                    tracing::warn!("upload {} rejected: {}", name, e);
                }
            }
            RuntimeEvent::ProcessLine { kind, line } => {
                self.controller.on_process_line(kind, &line, now);
            }
            RuntimeEvent::ProcessExit { kind, code } => {
                self.controller.on_process_exit(kind, code, now);
            }
        }
    }

    fn update_clients(&mut self) {
        let net = self.hub.count(ClientKind::Net);
        self.controller.set_clients(net, self.stdin_clients);
    }

    /// Carry out pending controller requests. Returns an exit code when one
    /// of them was an exit.
    fn perform_requests(&mut self) -> Option<i32> {
        for request in self.controller.take_requests() {
            match request {
                EngineRequest::Open {
                    generation,
                    port,
                    baud,
                } => {
                    let transport_tx = self.transport_tx.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        tracing::debug!("opening {} (generation {})", port, generation);
                        let result = open_transport(&port, baud, generation, transport_tx).await;
                        let _ = events.send(RuntimeEvent::Opened { generation, result });
                    });
                }
                EngineRequest::Flash { program, args } => {
                    tracing::info!("running {} {}", program, args.join(" "));
                    let mut cmd = Command::new(&program);
                    cmd.args(&args);
                    spawn_process(ProcessKind::Flash, cmd, self.events_tx.clone());
                }
                EngineRequest::Exec { command, channel } => {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c").arg(&command);
                    spawn_process(ProcessKind::Exec { channel }, cmd, self.events_tx.clone());
                }
                EngineRequest::Exit(code) => {
                    if code != 0 {
                        match self.controller.snapshot(true) {
                            Ok(status) => tracing::error!("exiting with {}:\n{}", code, status),
                            Err(e) => tracing::error!("exiting with {} ({})", code, e),
                        }
                    } else {
                        tracing::info!("exit requested");
                    }
                    return Some(code);
                }
            }
        }
        None
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Spawn a child process and relay its output lines and exit code.
pub fn spawn_process(kind: ProcessKind, mut cmd: Command, events: EventSender) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("failed to start {:?}: {}", kind, e);
            let _ = events.send(RuntimeEvent::ProcessExit { kind, code: None });
            return;
        }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        tokio::join!(
            relay_output(stdout, kind, events.clone()),
            relay_output(stderr, kind, events.clone()),
        );
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!("waiting for {:?}: {}", kind, e);
                None
            }
        };
        let _ = events.send(RuntimeEvent::ProcessExit { kind, code });
    });
}

async fn relay_output<R>(reader: Option<R>, kind: ProcessKind, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut framer = LineBuffer::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.feed_lines(&buf[..n]) {
                    let _ = events.send(RuntimeEvent::ProcessLine { kind, line });
                }
            }
            Err(e) => {
                tracing::debug!("process output closed: {}", e);
                break;
            }
        }
    }
    let rest = framer.take_buffer();
    if !rest.is_empty() {
        let line = String::from_utf8_lossy(&rest).into_owned();
        let _ = events.send(RuntimeEvent::ProcessLine { kind, line });
    }
}
