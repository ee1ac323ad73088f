//! Connection lifecycle: open, boot detection, quiescence, reconnect

use super::command::CommandFlags;
use super::timers::TimerKind;
use super::{Controller, EngineRequest};
use crate::communication::line_buffer::LineBuffer;
use crate::communication::{PortSpec, Transport};
use gridlink_core::{epoch_ms, ConnectionError, DeviceMode, MachineState};
use std::time::Instant;

impl Controller {
    /// Begin operation: arm the periodic timers and request the first open.
    pub fn start(&mut self, now: Instant) {
        self.now = now;
        self.refresh_bed_clear();
        self.timers
            .arm(TimerKind::IdlePoll, now + self.timing.idle_poll);
        self.timers
            .arm(TimerKind::StatusPush, now + self.timing.status_push);
        self.try_open();
    }

    pub(crate) fn try_open(&mut self) {
        if self.transport.is_some() || self.opening {
            return;
        }
        if self.flashing {
            self.status.state = MachineState::Flashing;
            self.arm_reconnect();
            return;
        }
        let Some(port) = self.config.port.clone() else {
            self.status.state = MachineState::NoDevice;
            self.arm_reconnect();
            return;
        };
        match PortSpec::parse(&port) {
            Ok(spec) => {
                self.generation += 1;
                self.opening = true;
                tracing::debug!(generation = self.generation, "opening {}", spec);
                self.requests.push(EngineRequest::Open {
                    generation: self.generation,
                    port: spec,
                    baud: self.config.baud,
                });
            }
            Err(e) => {
                tracing::warn!("bad port '{}': {}", port, e);
                self.status.state = MachineState::NoDevice;
                self.arm_reconnect();
            }
        }
    }

    fn arm_reconnect(&mut self) {
        self.timers
            .arm(TimerKind::Reconnect, self.now + self.timing.reconnect);
    }

    /// The runtime opened the transport requested under `generation`
    pub fn on_open(&mut self, generation: u64, mut transport: Box<dyn Transport>, now: Instant) {
        self.now = now;
        if generation != self.generation || !self.opening || self.flashing {
            tracing::debug!("discarding stale transport {}", transport.name());
            transport.close();
            if generation == self.generation {
                self.opening = false;
            }
            return;
        }
        self.opening = false;
        self.evtlog(format!("open: {}", transport.name()));
        self.transport = Some(transport);
        self.framer = LineBuffer::new();

        self.status.device.connect = epoch_ms();
        self.status.device.lines = 0;
        self.status.state = MachineState::Connecting;
        self.status.print.pause = false;
        self.paused = false;
        self.pause_completion = None;
        self.deferred_completion = None;
        self.line_numbers.reset();
        self.starting = false;
        self.quiescent = false;
        self.resending = false;
        self.resend_set.clear();
        self.waiting = 0;
        self.in_flight.clear();
        self.collect = None;
        self.flow.reset();
        self.boot_pending = self
            .next_boot
            .take()
            .unwrap_or_else(|| self.config.boot_sequence());

        self.timers.cancel(TimerKind::Reconnect);
        self.timers.cancel(TimerKind::Quiescence);
        self.timers.cancel(TimerKind::ResendQuiet);
        self.timers
            .arm(TimerKind::BootWatchdog, now + self.timing.boot_watchdog);
        self.status.mark_dirty();
    }

    /// The open requested under `generation` failed
    pub fn on_open_failed(&mut self, generation: u64, error: ConnectionError, now: Instant) {
        self.now = now;
        if generation != self.generation {
            return;
        }
        self.opening = false;
        tracing::warn!("{}", error);
        self.status.device.ready = false;
        self.status.state = if self.flashing {
            MachineState::Flashing
        } else {
            MachineState::NoDevice
        };
        self.status.mark_dirty();
        self.arm_reconnect();
    }

    /// Close the transport on our own initiative
    pub(crate) fn close_transport(&mut self, reason: &str) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        transport.close();
        self.after_close(reason);
    }

    /// The transport reported closure or failure
    pub(crate) fn transport_lost(&mut self, reason: &str) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.after_close(reason);
        }
    }

    fn after_close(&mut self, reason: &str) {
        tracing::info!("transport closed: {}", reason);
        self.evtlog("close");
        self.status.device.close = epoch_ms();
        self.status.device.ready = false;
        self.status.state = if self.flashing {
            MachineState::Flashing
        } else {
            MachineState::NoDevice
        };
        for kind in [
            TimerKind::BootWatchdog,
            TimerKind::BootFinal,
            TimerKind::Quiescence,
            TimerKind::ResendQuiet,
            TimerKind::PlannerRetry,
            TimerKind::BufferRetry,
        ] {
            self.timers.cancel(kind);
        }
        self.resending = false;
        self.resend_set.clear();
        self.starting = false;
        self.quiescent = false;
        self.status.mark_dirty();
        self.arm_reconnect();
    }

    pub(crate) fn boot_watchdog(&mut self) {
        if self.transport.is_none() || self.status.device.lines > 0 {
            return;
        }
        self.evtlog("device input timeout");
        self.on_quiescence();
        self.timers
            .arm(TimerKind::BootFinal, self.now + self.timing.boot_final);
    }

    pub(crate) fn boot_final(&mut self) {
        if self.transport.is_some() && self.status.device.lines == 0 {
            self.evtlog("device not responding. reopening port.");
            self.close_transport("device not responding");
        }
    }

    pub(crate) fn quiescence_check(&mut self) {
        let lines = self.status.device.lines;
        if lines == self.quiesce_mark {
            self.quiescent = true;
            self.on_quiescence();
        } else {
            self.quiesce_mark = lines;
            self.timers
                .arm(TimerKind::Quiescence, self.now + self.timing.quiescence);
        }
    }

    /// Output has stopped. A device that announced a reset becomes ready;
    /// one that never did is treated as if it just had.
    fn on_quiescence(&mut self) {
        if self.starting {
            self.starting = false;
            self.collect = Some(Vec::new());
            if !self.status.print.run {
                self.status.state = MachineState::Idle;
            }
            self.status.mark_dirty();
            self.evtlog("device ready");
        } else {
            if self.transport.is_none() {
                tracing::warn!("quiescence without a transport");
                return;
            }
            self.evtlog("bump boot");
            self.process_line("start");
            self.status.device.firm.ver = "new".to_string();
            self.status.device.firm.auth = "new".to_string();
            self.starting = true;
            self.quiesce_mark = self.status.device.lines;
            self.timers
                .arm(TimerKind::Quiescence, self.now + self.timing.quiescence);
        }

        let boot = std::mem::take(&mut self.boot_pending);
        if !boot.is_empty() {
            tracing::debug!("running {} boot commands", boot.len());
        }
        for cmd in boot {
            self.enqueue(&cmd, CommandFlags::default());
        }
    }

    /// Refresh stale temperature and position reports while idle.
    pub(crate) fn idle_poll(&mut self) {
        self.timers
            .arm(TimerKind::IdlePoll, self.now + self.timing.idle_poll);
        if self.status.device.mode != DeviceMode::Fdm
            || self.status.print.run
            || self.starting
            || !self.quiescent
            || self.transport.is_none()
        {
            return;
        }
        let now = self.now;
        let age = self.timing.report_age;
        let stale = |at: Option<Instant>| at.map_or(true, |t| now.saturating_duration_since(t) > age);
        if stale(self.last_temp) && !self.queue.contains("M105") {
            self.enqueue("M105", CommandFlags::system());
        }
        if stale(self.last_pos) && !self.queue.contains("M114") {
            self.enqueue("M114", CommandFlags::system());
        }
    }

    pub(crate) fn status_push(&mut self) {
        self.timers
            .arm(TimerKind::StatusPush, self.now + self.timing.status_push);
        if self.status.take_update() {
            self.publish_status(false, None);
        }
    }
}
