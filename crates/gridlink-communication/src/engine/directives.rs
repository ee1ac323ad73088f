//! Client command ingestion
//!
//! Lines from clients are either `*` directives handled by the controller,
//! `!` emergency commands written straight to the device, or G-code that is
//! priority-queued (`#` requests checksum framing).

use super::command::{CommandFlags, CompletionAction};
use super::{Controller, EngineRequest};
use crate::protocol::lenient_f64;
use crate::protocol::tokenizer::tokenize_line;
use gridlink_core::{ClientId, CommandError, DeviceMode, Emission, Error, Result};
use gridlink_settings::Config;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Instant;

fn bad_argument(directive: &str, reason: impl Into<String>) -> Error {
    CommandError::BadArgument {
        directive: directive.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn on_off(directive: &str, arg: &str) -> Result<bool> {
    match arg {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(bad_argument(directive, "expected on or off")),
    }
}

impl Controller {
    /// Handle one line from a client.
    pub fn handle_client_line(&mut self, line: &str, channel: Option<ClientId>, now: Instant) {
        self.now = now;
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Err(e) = self.dispatch(line, channel) {
            tracing::warn!(line, "{}", e);
            self.report_error(&e, channel);
        }
    }

    /// Tell the originating client, or everyone when there is none.
    pub(crate) fn report_error(&self, err: &Error, channel: Option<ClientId>) {
        let text = Emission::event(err.to_string()).line;
        match channel {
            Some(id) => {
                self.hub.send_to(id, text);
            }
            None => self.emit(Emission::error(text)),
        }
    }

    fn dispatch(&mut self, line: &str, channel: Option<ClientId>) -> Result<()> {
        if let Some(cmd) = line.strip_prefix('!') {
            self.emergency(cmd.trim(), channel);
            return Ok(());
        }
        if !line.starts_with('*') {
            let (text, checksum) = match line.strip_prefix('#') {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            self.enqueue(
                text,
                CommandFlags {
                    priority: true,
                    onpause: true,
                    checksum,
                    channel,
                    ..Default::default()
                },
            );
            return Ok(());
        }

        let cmd = line.split_whitespace().next().unwrap_or(line);
        let rest = line[cmd.len()..].trim();
        let first = rest.split_whitespace().next().unwrap_or("");

        match cmd {
            "*exit" => self.requests.push(EngineRequest::Exit(0)),
            "*exec" => {
                if rest.is_empty() {
                    return Err(bad_argument(cmd, "missing command"));
                }
                self.evtlog_to(format!("exec: {}", rest), channel);
                self.requests.push(EngineRequest::Exec {
                    command: rest.to_string(),
                    channel,
                });
            }
            "*tok" => self.evtlog_to(tokenize_line(rest).join(","), channel),
            "*buf" => {
                let max = first
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| bad_argument(cmd, "expected a positive count"))?;
                self.max_outstanding = max;
                self.drain();
            }
            "*bounce" => self.close_transport("bounce requested"),
            "*debug" => {
                self.debug = on_off(cmd, first)?;
                self.status.mark_dirty();
            }
            "*extrude" => {
                self.extrude = on_off(cmd, first)?;
                self.status.mark_dirty();
            }
            "*setmode" => {
                self.status.device.mode = DeviceMode::parse(first)
                    .ok_or_else(|| bad_argument(cmd, "expected fdm or cnc"))?;
                self.status.mark_dirty();
            }
            "*match" => {
                self.match_all = first == "all";
                tracing::info!(match_all = self.match_all, "acknowledgment matching changed");
            }
            "*feed" => {
                let scale = lenient_f64(first)
                    .ok_or_else(|| bad_argument(cmd, "expected a feed scale"))?;
                let checksum = self.queue.front().is_some_and(|head| head.flags.checksum);
                self.enqueue(
                    &format!("M220 S{}", (scale * 100.0).round()),
                    CommandFlags {
                        priority: true,
                        checksum,
                        channel,
                        ..Default::default()
                    },
                );
                self.status.feed = scale;
                self.status.mark_dirty();
            }
            "*center" => {
                let max = &self.status.device.max;
                let (Some(x), Some(y)) = (max.get("X").copied(), max.get("Y").copied()) else {
                    return Err(bad_argument(cmd, "machine limits unknown"));
                };
                self.enqueue(
                    &format!("G0 X{} Y{} F6000", x / 2.0, y / 2.0),
                    CommandFlags::priority(channel),
                );
            }
            "*pause" => self.pause((!first.is_empty()).then(|| first.to_string()))?,
            "*resume" => self.resume()?,
            "*cancel" => self.cancel_job()?,
            "*abort" => self.abort_job()?,
            "*send" | "*sendsd" => {
                if rest.is_empty() {
                    return Err(bad_argument(cmd, "missing file"));
                }
                self.send_file(Path::new(rest), cmd == "*sendsd")?;
            }
            "*list" => {
                if let Some(id) = channel {
                    self.hub.request_list(id);
                }
                self.publish_file_list(channel);
            }
            "*list-sd" => {
                if let Some(id) = channel {
                    self.hub.request_list(id);
                }
                self.enqueue(
                    "M20",
                    CommandFlags {
                        channel,
                        completion: Some(CompletionAction::ListSd { channel }),
                        ..Default::default()
                    },
                );
            }
            "*clearkick" | "*kick" => {
                if self.status.print.run {
                    return Err(gridlink_core::JobError::JobInProgress.into());
                }
                if cmd == "*clearkick" {
                    self.bed_clear()?;
                }
                self.kick((!rest.is_empty()).then_some(rest))?;
            }
            "*runbox" => {
                let mut parts = rest.splitn(2, '@').map(str::trim);
                let name = parts.next().unwrap_or("");
                let feed = match parts.next() {
                    Some(f) => lenient_f64(f).ok_or_else(|| bad_argument(cmd, "bad feed rate"))?,
                    None => 3000.0,
                };
                let path = self.job_path(cmd, name)?;
                self.runbox(&path, feed)?;
            }
            "*update" => self.update_firmware((!rest.is_empty()).then_some(rest))?,
            "*upload" => {
                return Err(bad_argument(
                    cmd,
                    "uploads are accepted on the network control port only",
                ))
            }
            "*delete" => self.delete_files(rest)?,
            "*clear" => {
                self.bed_clear()?;
                self.evtlog_to("bed marked clear", channel);
            }
            "*monitor" => {
                let on = on_off(cmd, first)?;
                if let Some(id) = channel {
                    let was = self.hub.interest(id).is_some_and(|i| i.monitoring);
                    if was != on {
                        self.hub.set_monitoring(id, on);
                        let msg = if on { "monitoring enabled" } else { "monitoring disabled" };
                        self.evtlog_to(msg, channel);
                    }
                }
            }
            "*watch" => {
                let on = on_off(cmd, first)?;
                if let Some(id) = channel {
                    self.hub.set_watch_status(id, on);
                }
            }
            "*status" | "*status+" => {
                if let Some(id) = channel {
                    self.hub.request_status(id);
                }
                self.publish_status(cmd == "*status+", channel);
            }
            "*set-config" => self.set_config(rest)?,
            "*get-config" | "*config" => {
                let json = serde_json::to_string(&json!({ "config": &self.config }))?;
                self.emit(Emission::status(format!("*** {} ***", json)).to(channel));
            }
            "*macro" => {
                let commands = self.config.macro_commands(first).ok_or_else(|| {
                    Error::from(CommandError::UnknownMacro {
                        name: first.to_string(),
                    })
                })?;
                for command in commands {
                    if command.starts_with("*macro") {
                        tracing::warn!("nested macro skipped: {}", command);
                        continue;
                    }
                    if let Err(e) = self.dispatch(&command, channel) {
                        tracing::warn!(line = %command, "{}", e);
                        self.report_error(&e, channel);
                    }
                }
            }
            _ => {
                return Err(CommandError::InvalidDirective {
                    directive: line[1..].to_string(),
                }
                .into())
            }
        }
        Ok(())
    }

    /// Write straight to the device, bypassing the queue.
    fn emergency(&mut self, cmd: &str, channel: Option<ClientId>) {
        if self.transport.is_some() && self.send_raw(cmd) {
            self.evtlog_to(format!("emergency command issued: {}", cmd), channel);
        } else {
            self.evtlog_to(format!("missing port for emergency command: {}", cmd), channel);
        }
    }

    /// Merge URL-encoded JSON overrides into the persisted override file and
    /// switch to the resulting config.
    fn set_config(&mut self, encoded: &str) -> Result<()> {
        const DIRECTIVE: &str = "*set-config";
        let decoded =
            urlencoding::decode(encoded).map_err(|e| bad_argument(DIRECTIVE, e.to_string()))?;
        let overrides: Value =
            serde_json::from_str(&decoded).map_err(|e| bad_argument(DIRECTIVE, e.to_string()))?;
        let config = self
            .config
            .apply_overrides(&overrides)
            .map_err(|e| bad_argument(DIRECTIVE, e.to_string()))?;
        self.apply_config(config);
        Ok(())
    }

    /// Adopt a new config. Connection and mode settings take effect on the
    /// next open.
    pub fn apply_config(&mut self, config: Config) {
        self.max_outstanding = config.max_outstanding();
        self.match_all = config.match_all;
        self.config = config;
        self.status.mark_dirty();
        tracing::info!("configuration updated");
    }
}
