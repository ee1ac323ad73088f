//! Outbound path: enqueue, drain, transmit

use super::command::{CommandFlags, CommandRecord, CompletionAction};
use super::timers::{TimerKind, HISTORY_LEN};
use super::Controller;
use crate::protocol::lenient_f64;
use crate::protocol::tokenizer::tokenize_line;
use gridlink_core::{epoch_ms, Emission};

/// Largest `M808 L<n>` repeat count expanded at enqueue time
const MAX_REPEAT: usize = 1000;

impl Controller {
    /// Queue a command for the device. It is written immediately when
    /// nothing is ahead of it and there is room in flight.
    pub fn enqueue(&mut self, line: &str, flags: CommandFlags) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if line.split_whitespace().next() == Some("M808") && self.repeat_block(line) {
            return;
        }
        let Some(record) = self.queue.capture(CommandRecord::new(line, flags)) else {
            return;
        };

        let runnable = !self.paused || record.flags.onpause;
        if !self.resending
            && runnable
            && self.waiting < self.max_outstanding
            && self.queue.nothing_ahead(record.flags.priority)
        {
            self.write(record);
        } else {
            self.queue.push(record);
        }
        self.sync_buffer();
    }

    /// `M808 L<n>` opens a block, a bare `M808` closes the innermost one and
    /// replays it. Returns false when the line should be passed through.
    fn repeat_block(&mut self, line: &str) -> bool {
        let count = line
            .split_whitespace()
            .nth(1)
            .and_then(|arg| arg.strip_prefix('L'));
        if let Some(count) = count {
            let requested = lenient_f64(count).map_or(0.0, |c| c.max(0.0));
            let count = if requested > MAX_REPEAT as f64 {
                self.evtlog(format!("M808 repeat count clamped to {}", MAX_REPEAT));
                MAX_REPEAT
            } else {
                requested as usize
            };
            self.queue.open_loop(count);
            return true;
        }
        match self.queue.close_loop() {
            Some(block) => {
                for _ in 0..=block.count {
                    for record in &block.body {
                        self.enqueue(&record.line, record.flags.clone());
                    }
                }
                true
            }
            None => {
                self.evtlog("M808 end of non-existent loop");
                false
            }
        }
    }

    /// Release pending commands while the in-flight ceiling and device
    /// buffers allow.
    pub(crate) fn drain(&mut self) {
        if self.processing {
            return;
        }
        self.timers.cancel(TimerKind::PlannerRetry);
        self.timers.cancel(TimerKind::BufferRetry);

        if !self.cancel && !self.queue.is_empty() {
            if self.flow.planner_blocked() {
                self.flow.pln_mark = self.flow.acks;
                self.timers
                    .arm(TimerKind::PlannerRetry, self.now + self.timing.planner_retry);
                return;
            }
            if self.flow.buffer_blocked() {
                self.flow.buf_mark = self.flow.acks;
                self.timers
                    .arm(TimerKind::BufferRetry, self.now + self.timing.buffer_retry);
                return;
            }
        }

        self.processing = true;
        while !self.resending && !self.cancel && self.waiting < self.max_outstanding {
            match self.queue.front() {
                None => break,
                Some(head) if self.paused && !head.flags.onpause => break,
                Some(_) => {}
            }
            let Some(record) = self.queue.pop() else {
                break;
            };
            self.status.print.mark = epoch_ms();
            self.write(record);
        }

        if self.cancel || self.queue.is_empty() {
            self.queue.reset_high_water();
            if self.sd_send && self.cancel {
                self.sd_send = false;
                self.enqueue("M29", CommandFlags::default());
            }
            self.sd_send = false;
            if self.status.print.run {
                self.finish_job();
            }
        } else if self.status.print.run {
            let high_water = self.queue.high_water().max(1) as f64;
            let done = (1.0 - self.queue.len() as f64 / high_water) * 100.0;
            self.status.print.progress = (done.clamp(0.0, 100.0) * 100.0).round() / 100.0;
            self.status.mark_dirty();
        }
        self.processing = false;
        self.sync_buffer();
    }

    /// Transmit one record, handling host-side directives and tracking.
    pub(crate) fn write(&mut self, record: CommandRecord) {
        let CommandRecord { line, mut flags } = record;
        let mut line = match line.find(';') {
            Some(idx) if idx > 0 => line[..idx].trim().to_string(),
            _ => line,
        };

        if line.starts_with('*') {
            if line == "*pos-push" {
                let saved = self.status.pos.save();
                self.status.pos.stack.push(saved);
                self.status.mark_dirty();
                return;
            } else if line == "*pos-pop" {
                match self.status.pos.stack.pop() {
                    Some(p) => {
                        line = format!("G0 X{} Y{} Z{} F{}", p.x, p.y, p.z, p.f.unwrap_or(3000.0));
                    }
                    None => {
                        self.evtlog("no saved position on stack to pop");
                        return;
                    }
                }
            } else if line == "*pause" || line.starts_with("*pause ") {
                let reason = line.split_whitespace().nth(1).map(String::from);
                if let Err(e) = self.pause(reason) {
                    self.report_error(&e, flags.channel);
                }
                return;
            } else {
                tracing::warn!("dropping unknown directive in command stream: {}", line);
                return;
            }
        }

        let tracked = match line.chars().next() {
            Some(';') => return,
            Some('$' | '?' | '~' | 'M' | 'G') => {
                if line.starts_with("M117 Start") {
                    flags.completion = Some(CompletionAction::JobBodyStart);
                }
                let mut toks = tokenize_line(&line);
                match toks.first().map(String::as_str) {
                    Some("G0" | "G1") => {
                        if !self.extrude {
                            let before = toks.len();
                            toks.retain(|t| !t.starts_with('E'));
                            if toks.len() != before {
                                line = toks.join(" ");
                            }
                        }
                        self.track_motion(&toks[1..]);
                    }
                    Some("G90") => self.status.pos.rel = false,
                    Some("G91") => self.status.pos.rel = true,
                    Some("M0" | "M1" | "M2000") => {
                        if let Err(e) = self.pause(toks.get(1).cloned()) {
                            self.report_error(&e, flags.channel);
                        }
                        return;
                    }
                    _ => {}
                }
                true
            }
            _ => self.match_all,
        };

        let mut framed = line.clone();
        if self.transport.is_some() && (self.config.checksum || flags.checksum) {
            let (text, lineno) = self.line_numbers.frame_next(&line);
            flags.lineno = Some(lineno);
            self.status.device.lineno = lineno;
            framed = text;
        }

        if tracked {
            let record = CommandRecord::new(line.clone(), flags.clone());
            self.history.push_back(record.clone());
            while self.history.len() > HISTORY_LEN {
                self.history.pop_front();
            }
            self.in_flight.push_back(record);
            self.waiting += 1;
        }

        if self.transport.is_none() {
            self.evtlog_to(format!("serial port missing: {}", line), flags.channel);
            return;
        }
        let arrow = if self.debug { "->>" } else { "-->" };
        self.cmdlog(&format!("{} {}", arrow, framed), &flags);
        self.send_raw(&framed);
    }

    /// Write a line to the transport without tracking. Returns false when
    /// there is no transport or the write failed.
    pub(crate) fn send_raw(&mut self, line: &str) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        tracing::trace!(">> {}", line);
        match transport.write(format!("{}\n", line).as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("write failed: {}", e);
                self.transport_lost(&e.to_string());
                false
            }
        }
    }

    fn track_motion(&mut self, words: &[String]) {
        for word in words {
            let mut chars = word.chars();
            let Some(axis) = chars.next() else {
                continue;
            };
            let Some(value) = lenient_f64(chars.as_str()) else {
                continue;
            };
            match axis {
                'E' => {
                    self.status.pos.e += value;
                    if self.status.print.run {
                        self.status.print.emit += value;
                    }
                }
                'F' => self.status.pos.f = Some(value),
                _ => {
                    let rel = self.status.pos.rel;
                    if let Some(slot) = self.status.pos.axis_mut(axis) {
                        if rel {
                            *slot += value;
                        } else {
                            *slot = value;
                        }
                    }
                }
            }
        }
        self.status.mark_dirty();
    }

    /// Command echo with the queue state prefix:
    /// `[RPBH,waiting,queued,collected] text`
    pub(crate) fn cmdlog(&self, text: &str, flags: &CommandFlags) {
        if !self.debug && ((flags.print && !self.config.verbose) || flags.system) {
            return;
        }
        let high_water = self.queue.high_water();
        let signs: String = [
            (self.resending, 'R'),
            (self.paused, 'P'),
            (self.waiting == self.max_outstanding, 'B'),
            (self.queue.len() == high_water, 'H'),
        ]
        .iter()
        .map(|&(on, c)| if on { c } else { ' ' })
        .collect();
        let collected = self.collect.as_ref().map_or(0, Vec::len);
        let line = format!(
            "[{},{},{:>width$},{:>2}] {}",
            signs,
            self.waiting,
            self.queue.len(),
            collected,
            text,
            width = high_water.to_string().len()
        );
        self.emit(Emission::plain(line).to(flags.channel));
    }
}
