//! Inbound path: line classification, acknowledgment matching and resend

use super::command::{CommandFlags, CommandRecord, CompletionAction};
use super::timers::TimerKind;
use super::{Controller, EngineRequest, PauseCompletion};
use crate::protocol::checksum::frame;
use crate::protocol::telemetry::{self, TelemetryAction};
use gridlink_core::{epoch_ms, Emission};
use std::collections::VecDeque;

/// Commands from `history` to retransmit for a resend request starting at
/// line number `from`, in their original order.
pub fn replay_set(history: &VecDeque<CommandRecord>, from: u64) -> Vec<CommandRecord> {
    history
        .iter()
        .filter(|r| r.flags.lineno.is_some_and(|n| n >= from))
        .cloned()
        .collect()
}

impl Controller {
    /// One complete line from the device
    pub(crate) fn on_device_line(&mut self, raw: &str) {
        self.timers.cancel(TimerKind::PlannerRetry);
        self.timers.cancel(TimerKind::BufferRetry);

        self.status.device.lines += 1;
        let lines = self.status.device.lines;
        if lines == 1 {
            self.quiesce_mark = lines;
            self.timers.arm(
                TimerKind::Quiescence,
                self.now + self.timing.quiescence_first,
            );
        } else if self.timers.is_armed(TimerKind::Quiescence) {
            self.quiesce_mark = lines;
            self.timers
                .arm(TimerKind::Quiescence, self.now + self.timing.quiescence);
        }
        self.process_line(raw.trim());
    }

    pub(crate) fn process_line(&mut self, line: &str) {
        if self.debug {
            let flags = self
                .in_flight
                .front()
                .map(|r| r.flags.clone())
                .unwrap_or_default();
            self.cmdlog(&format!("<<- {}", line), &flags);
        }
        tracing::trace!("<< {}", line);
        self.status.device.line = epoch_ms();

        if line.is_empty() {
            return;
        }
        if self.resending {
            self.timers
                .arm(TimerKind::ResendQuiet, self.now + self.timing.resend_quiet);
            return;
        }
        if let Some(rest) = line.strip_prefix("Resend:") {
            match rest.split_whitespace().next().and_then(|n| n.parse::<u64>().ok()) {
                Some(from) => self.begin_resend(from),
                None => tracing::warn!("unparseable resend request: {}", line),
            }
            return;
        }

        let grbl_error = self.status.device.grbl && line.starts_with("error:");
        if line.starts_with("Error:") || grbl_error {
            self.device_error(line);
            if !grbl_error || self.transport.is_none() {
                return;
            }
        }
        let is_ok = grbl_error || line.starts_with("ok");

        if telemetry::parse_temperature(line, is_ok, &mut self.status) {
            self.last_temp = Some(self.now);
            if !is_ok {
                self.drain();
                return;
            }
        }

        if is_ok {
            self.acknowledge(line);
        } else if let Some(collect) = self.collect.as_mut() {
            collect.push(line.to_string());
        }

        if line == "start" {
            self.start_marker();
        }

        let mode = self.status.device.mode;
        let parsed = telemetry::apply(line, &mut self.status, mode);
        if parsed.position_report {
            self.last_pos = Some(self.now);
        }
        for action in parsed.actions {
            self.telemetry_action(action);
        }
        self.sync_buffer();
        self.drain();
    }

    fn acknowledge(&mut self, line: &str) {
        self.flow.acks += 1;
        if let Some(collect) = self.collect.as_mut() {
            let text = if line.starts_with("error:") {
                line
            } else {
                line.get(3..).unwrap_or("")
            };
            collect.push(text.to_string());
        }

        let matched = self.in_flight.pop_front();
        if matched.is_none() {
            tracing::debug!("acknowledgment with nothing in flight: {}", line);
        }
        let expected = matched.as_ref().and_then(|r| r.flags.lineno);
        for word in line.split(' ').map(str::trim) {
            let mut chars = word.chars();
            let Some(key) = chars.next() else {
                continue;
            };
            let value = chars.as_str();
            match key {
                'N' => {
                    if let Ok(n) = value.parse::<u64>() {
                        if expected != Some(n) {
                            tracing::debug!(expected = ?expected, got = n, "line number mismatch: {}", line);
                        }
                    }
                }
                'B' => {
                    if let Ok(free) = value.parse() {
                        self.flow.record_buffer(free);
                    }
                }
                'P' => {
                    if let Ok(free) = value.parse() {
                        self.flow.record_planner(free);
                    }
                }
                _ => {}
            }
        }

        let collected = self.collect.clone().unwrap_or_default();
        if let Some(action) = matched.as_ref().and_then(|r| r.flags.completion.clone()) {
            self.complete(action, &collected);
        }
        if !self.debug && !collected.is_empty() {
            let (from, flags) = matched
                .map(|r| (r.line, r.flags))
                .unwrap_or_else(|| ("???".to_string(), CommandFlags::default()));
            if collected.len() > 1 {
                self.cmdlog(&format!("==> {}", from), &flags);
                for (i, text) in collected.iter().enumerate() {
                    let lead = if i == 0 { "<--" } else { "   " };
                    self.cmdlog(&format!("{} {}", lead, text), &flags);
                }
            } else {
                let rendered = serde_json::to_string(&collected).unwrap_or_default();
                self.cmdlog(&format!("==> {} -- {}", from, rendered), &flags);
            }
        }

        self.waiting = self.waiting.saturating_sub(1);
        if self.paused && self.waiting == 0 {
            if let Some(done) = self.pause_completion.take() {
                self.run_pause_completion(done);
            }
        }
        self.collect = Some(Vec::new());
    }

    fn complete(&mut self, action: CompletionAction, collected: &[String]) {
        match action {
            CompletionAction::JobBodyStart => {
                self.bed_dirty();
                self.status.print.prep = self.status.print.start;
                self.status.print.start = epoch_ms();
                self.status.mark_dirty();
                let name = self.status.print.filename.clone().unwrap_or_default();
                self.evtlog(format!("job body {}", name));
            }
            CompletionAction::ListSd { channel } => {
                let mut files = collected.to_vec();
                if !files.is_empty() {
                    files.remove(0);
                }
                files.pop();
                files.pop();
                match serde_json::to_string(&files) {
                    Ok(json) => self.emit(Emission::list(format!("*** {} ***", json)).to(channel)),
                    Err(e) => tracing::error!("sd listing: {}", e),
                }
            }
        }
    }

    fn device_error(&mut self, line: &str) {
        self.errors += 1;
        self.status.error.time = epoch_ms();
        self.status.error.cause = line.get(6..).map(|s| s.trim().to_string());
        self.status.error.count = self.errors;
        self.status.mark_dirty();
        if !self.debug {
            self.evtlog_error(line);
        }

        if self.config.recover_on_error || self.config.fragile {
            self.next_boot = Some(self.config.error_sequence());
            self.close_transport("device error");
            if self.config.fragile {
                match self.snapshot(true) {
                    Ok(json) => tracing::error!("fatal device error, status: {}", json),
                    Err(e) => tracing::error!("fatal device error: {}", e),
                }
                self.requests.push(EngineRequest::Exit(-1));
            }
        }
    }

    fn begin_resend(&mut self, from: u64) {
        let replay = replay_set(&self.history, from);
        tracing::info!(
            from,
            waiting = self.waiting,
            in_flight = self.in_flight.len(),
            replay = replay.len(),
            "resend requested"
        );
        if replay.is_empty() {
            self.evtlog("nothing to resend");
            self.waiting = 0;
            self.in_flight.clear();
            self.drain();
            return;
        }
        if !self.debug {
            self.evtlog(format!("resending from {}", from));
        }
        self.resend_set = replay;
        self.resending = true;
        self.paused = true;
        self.deferred_completion = self.pause_completion.take();
        self.timers
            .arm(TimerKind::ResendQuiet, self.now + self.timing.resend_quiet);
    }

    /// Device went quiet after a resend request: replay with the original
    /// line numbers.
    pub(crate) fn finish_resend(&mut self) {
        if !self.resending {
            return;
        }
        self.resending = false;
        let replay = std::mem::take(&mut self.resend_set);
        self.waiting = replay.len();
        self.in_flight = replay.iter().cloned().collect();
        self.pause_completion = Some(PauseCompletion::ResumeAfterResend);
        for record in &replay {
            let framed = match record.flags.lineno {
                Some(n) => frame(&record.line, n),
                None => record.line.clone(),
            };
            if self.debug {
                self.cmdlog(&format!("=>> {}", framed), &record.flags);
            }
            if !self.send_raw(&framed) {
                break;
            }
        }
    }

    pub(crate) fn run_pause_completion(&mut self, done: PauseCompletion) {
        match done {
            PauseCompletion::RunPauseSequence => {
                self.evtlog("executing pause handler");
                for cmd in self.config.pause_sequence() {
                    self.enqueue(
                        &cmd,
                        CommandFlags {
                            onpause: true,
                            priority: true,
                            ..Default::default()
                        },
                    );
                }
                self.drain();
            }
            PauseCompletion::ResumeAfterResend => {
                self.paused = self.status.print.pause;
                self.pause_completion = self.deferred_completion.take();
                if self.paused && self.waiting == 0 {
                    if let Some(next) = self.pause_completion.take() {
                        self.run_pause_completion(next);
                    }
                }
                self.drain();
            }
        }
    }

    /// Device announced a reset
    fn start_marker(&mut self) {
        tracing::info!("device reset");
        self.line_numbers.reset();
        self.starting = true;
        self.status.device.ready = true;
        self.status.device.boot = epoch_ms();
        self.waiting = 0;
        self.collect = None;
        self.in_flight.clear();
        self.history.clear();
        self.queue.clear();
        if self.status.print.run {
            self.status.print.abort = true;
        }
        self.status.mark_dirty();
    }

    fn telemetry_action(&mut self, action: TelemetryAction) {
        match action {
            TelemetryAction::Pause(reason) => {
                if let Err(e) = self.pause(reason) {
                    tracing::debug!("pause request ignored: {}", e);
                }
            }
            TelemetryAction::Resume => {
                if let Err(e) = self.resume() {
                    tracing::debug!("resume request ignored: {}", e);
                }
            }
            TelemetryAction::Cancel => {
                if let Err(e) = self.cancel_job() {
                    tracing::debug!("cancel request ignored: {}", e);
                }
            }
            TelemetryAction::RequestSettings => {
                self.evtlog("M503 on eeprom version mismatch");
                self.write(CommandRecord::new("M503", CommandFlags::default()));
            }
            TelemetryAction::GrblDetected => self.evtlog("enabling grbl support"),
            TelemetryAction::Buffers { planner, rx } => {
                self.flow.record_planner(planner);
                self.flow.record_buffer(rx);
            }
            TelemetryAction::UnknownCommand(line) => {
                if self.config.fragile {
                    self.evtlog_error(format!("fatal: {}", line));
                    self.close_transport("unknown command");
                } else {
                    tracing::debug!("firmware rejected: {}", line);
                }
            }
        }
    }
}
