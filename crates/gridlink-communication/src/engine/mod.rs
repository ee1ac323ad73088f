//! Controller engine
//!
//! [`Controller`] owns the device status, the outbound queue, the in-flight
//! match list and the transport. It is driven entirely by the caller:
//!
//! - device bytes arrive through [`Controller::on_transport_event`]
//! - client lines through [`Controller::handle_client_line`]
//! - deadlines through [`Controller::on_timers`], with the next one given by
//!   [`Controller::next_deadline`]
//!
//! Every entry point takes the current [`Instant`], so the engine itself never
//! reads the clock for scheduling and never blocks. Work it cannot do itself
//! (opening a port, spawning a process, exiting) is returned as
//! [`EngineRequest`]s from [`Controller::take_requests`].
//!
//! Acknowledgments are matched strictly in transmission order: the oldest
//! in-flight command is assumed to be the one an `ok` answers. Marlin and
//! GRBL derived firmware process commands serially so this holds in
//! practice, but nothing on the wire confirms it.

mod boot;
pub mod command;
mod directives;
mod flasher;
mod job;
mod matcher;
pub mod queue;
pub mod timers;
mod transmit;

pub use command::{CommandFlags, CommandRecord, CompletionAction};
pub use job::{list_files, FileEntry};
pub use matcher::replay_set;
pub use timers::{TimerKind, TimerSet, Timing, HISTORY_LEN};

use crate::communication::line_buffer::LineBuffer;
use crate::communication::{PortSpec, Transport, TransportEvent, TransportEventKind};
use crate::protocol::checksum::LineNumbers;
use gridlink_core::{ClientHub, ClientId, DeviceStatus, Emission};
use gridlink_settings::Config;
use queue::{FlowGate, OutboundQueue};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Who this controller is
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Display name
    pub name: String,
    /// Persistent id
    pub uuid: String,
    /// Software version string
    pub version: String,
}

/// Side effects the runtime performs on behalf of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    /// Open the device. Report back with `on_open` / `on_open_failed`.
    Open {
        /// Generation to tag the transport's events with
        generation: u64,
        /// Where the device is
        port: PortSpec,
        /// Serial baud rate
        baud: u32,
    },
    /// Spawn the firmware flasher
    Flash {
        /// Program
        program: String,
        /// Arguments
        args: Vec<String>,
    },
    /// Run a shell command for a client
    Exec {
        /// Command line
        command: String,
        /// Client to send the output to
        channel: Option<ClientId>,
    },
    /// Exit the process
    Exit(i32),
}

/// Child process the runtime reports output for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Firmware flasher
    Flash,
    /// `*exec` command
    Exec {
        /// Client that asked for it
        channel: Option<ClientId>,
    },
}

/// What to do once the in-flight count reaches zero while paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseCompletion {
    /// Run the configured pause sequence
    RunPauseSequence,
    /// End of a resend replay
    ResumeAfterResend,
}

/// The serial protocol engine
pub struct Controller {
    config: Config,
    timing: Timing,
    hub: Arc<ClientHub>,
    status: DeviceStatus,
    now: Instant,

    transport: Option<Box<dyn Transport>>,
    framer: LineBuffer,
    generation: u64,
    opening: bool,
    flashing: bool,

    timers: TimerSet,
    requests: Vec<EngineRequest>,

    queue: OutboundQueue,
    flow: FlowGate,
    in_flight: VecDeque<CommandRecord>,
    history: VecDeque<CommandRecord>,
    collect: Option<Vec<String>>,
    line_numbers: LineNumbers,
    waiting: usize,
    max_outstanding: usize,
    processing: bool,
    paused: bool,
    pause_completion: Option<PauseCompletion>,
    deferred_completion: Option<PauseCompletion>,
    resending: bool,
    resend_set: Vec<CommandRecord>,
    cancel: bool,
    sd_send: bool,

    starting: bool,
    quiescent: bool,
    quiesce_mark: u64,
    boot_pending: Vec<String>,
    next_boot: Option<Vec<String>>,

    debug: bool,
    extrude: bool,
    match_all: bool,
    errors: u64,
    last_temp: Option<Instant>,
    last_pos: Option<Instant>,
}

impl Controller {
    /// Create a controller with default timing
    pub fn new(config: Config, identity: DeviceIdentity, hub: Arc<ClientHub>) -> Self {
        Self::with_timing(config, identity, hub, Timing::default())
    }

    /// Create a controller with explicit timing
    pub fn with_timing(
        config: Config,
        identity: DeviceIdentity,
        hub: Arc<ClientHub>,
        timing: Timing,
    ) -> Self {
        let mut status =
            DeviceStatus::new(identity.name, identity.uuid, config.mode, identity.version);
        status.device.grbl = config.grbl;
        status.device.port = config.listen.unwrap_or(0);
        status.flags.debug = config.debug;
        status.flags.extrude = config.extrude;

        Self {
            max_outstanding: config.max_outstanding(),
            debug: config.debug,
            extrude: config.extrude,
            match_all: config.match_all,
            config,
            timing,
            hub,
            status,
            now: Instant::now(),
            transport: None,
            framer: LineBuffer::new(),
            generation: 0,
            opening: false,
            flashing: false,
            timers: TimerSet::new(),
            requests: Vec::new(),
            queue: OutboundQueue::new(),
            flow: FlowGate::default(),
            in_flight: VecDeque::new(),
            history: VecDeque::with_capacity(HISTORY_LEN + 1),
            collect: None,
            line_numbers: LineNumbers::new(),
            waiting: 0,
            processing: false,
            paused: false,
            pause_completion: None,
            deferred_completion: None,
            resending: false,
            resend_set: Vec::new(),
            cancel: false,
            sd_send: false,
            starting: false,
            quiescent: false,
            quiesce_mark: 0,
            boot_pending: Vec::new(),
            next_boot: None,
            errors: 0,
            last_temp: None,
            last_pos: None,
        }
    }

    /// Requests issued since the last call
    pub fn take_requests(&mut self) -> Vec<EngineRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now`
    pub fn on_timers(&mut self, now: Instant) {
        self.now = now;
        while let Some(kind) = self.timers.pop_expired(now) {
            tracing::trace!("timer {:?}", kind);
            match kind {
                TimerKind::BootWatchdog => self.boot_watchdog(),
                TimerKind::BootFinal => self.boot_final(),
                TimerKind::Quiescence => self.quiescence_check(),
                TimerKind::ResendQuiet => self.finish_resend(),
                TimerKind::PlannerRetry => {
                    if self.flow.acks == self.flow.pln_mark {
                        tracing::debug!("planner timeout");
                        self.flow.pln_free = None;
                        self.drain();
                    }
                }
                TimerKind::BufferRetry => {
                    if self.flow.acks == self.flow.buf_mark {
                        tracing::debug!("buffer timeout");
                        self.flow.buf_free = None;
                        self.drain();
                    }
                }
                TimerKind::Reconnect => self.try_open(),
                TimerKind::IdlePoll => self.idle_poll(),
                TimerKind::StatusPush => self.status_push(),
                TimerKind::FlashExit => self.requests.push(EngineRequest::Exit(0)),
            }
        }
    }

    /// Feed activity from the transport
    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        self.now = now;
        if event.generation != self.generation || self.transport.is_none() {
            tracing::trace!("ignoring event from stale transport {}", event.generation);
            return;
        }
        match event.kind {
            TransportEventKind::Data(bytes) => {
                for line in self.framer.feed_lines(&bytes) {
                    if self.transport.is_none() {
                        break;
                    }
                    self.on_device_line(&line);
                }
            }
            TransportEventKind::Closed => self.transport_lost("closed by device"),
            TransportEventKind::Error(reason) => {
                tracing::error!("transport error: {}", reason);
                self.transport_lost(&reason);
            }
        }
    }

    /// Current status record
    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// Serialized status snapshot
    pub fn snapshot(&mut self, pretty: bool) -> gridlink_core::Result<String> {
        self.sync_status();
        self.status.snapshot_json(pretty)
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Unacknowledged commands in flight
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// In-flight ceiling
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Pending commands
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Pending command lines, head first
    pub fn pending_lines(&self) -> Vec<String> {
        self.queue.lines().map(String::from).collect()
    }

    /// In-flight command lines, oldest first
    pub fn in_flight_lines(&self) -> Vec<String> {
        self.in_flight.iter().map(|r| r.line.clone()).collect()
    }

    /// Queue is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Resend replay in progress
    pub fn is_resending(&self) -> bool {
        self.resending
    }

    /// A transport is open
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Generation of the current or pending transport
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Update client counts shown in the status
    pub fn set_clients(&mut self, net: usize, stdin: usize) {
        self.status.clients.net = net;
        self.status.clients.stdin = stdin;
        self.status.mark_dirty();
    }

    /// Record the host's network addresses
    pub fn set_addresses(&mut self, addrs: Vec<String>) {
        self.status.device.addr = addrs;
        self.status.mark_dirty();
    }

    /// Greeting sent to newly connected clients
    pub fn greeting(&self) -> String {
        let dev = &self.status.device;
        format!(
            "*ready {} {} {} {}",
            dev.name,
            dev.version,
            dev.firm.auth,
            dev.addr.join(",")
        )
    }

    fn sync_status(&mut self) {
        self.sync_buffer();
        self.status.flags.debug = self.debug;
        self.status.flags.extrude = self.extrude;
    }

    fn sync_buffer(&mut self) {
        let buffer = &mut self.status.buffer;
        buffer.waiting = self.waiting;
        buffer.queue = self.queue.len();
        buffer.max = self.queue.high_water();
        buffer.collect = self.collect.clone();
    }

    fn emit(&self, emission: Emission) {
        self.hub.publish(emission);
    }

    /// `*** msg ***` to monitoring clients
    fn evtlog(&self, msg: impl AsRef<str>) {
        tracing::info!("{}", msg.as_ref());
        self.emit(Emission::event(msg));
    }

    /// `*** msg ***` to monitoring clients and `channel`
    fn evtlog_to(&self, msg: impl AsRef<str>, channel: Option<ClientId>) {
        tracing::info!("{}", msg.as_ref());
        self.emit(Emission::event(msg).to(channel));
    }

    /// `*** msg ***` to every client
    fn evtlog_error(&self, msg: impl AsRef<str>) {
        tracing::warn!("{}", msg.as_ref());
        let line = Emission::event(msg).line;
        self.emit(Emission::error(line));
    }

    /// Broadcast a status snapshot to requesters and watchers
    fn publish_status(&mut self, pretty: bool, channel: Option<ClientId>) {
        match self.snapshot(pretty) {
            Ok(json) => self.emit(Emission::status(format!("*** {} ***", json)).to(channel)),
            Err(e) => tracing::error!("status snapshot failed: {}", e),
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.status.state)
            .field("generation", &self.generation)
            .field("waiting", &self.waiting)
            .field("pending", &self.queue.len())
            .field("paused", &self.paused)
            .field("resending", &self.resending)
            .finish()
    }
}
