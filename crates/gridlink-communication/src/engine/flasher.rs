//! Firmware update and child process output

use super::job::plain_name;
use super::timers::TimerKind;
use super::{Controller, EngineRequest, ProcessKind};
use gridlink_core::{ConnectionError, Emission, FirmwareError, MachineState, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

/// Newest `.hex` image in `dir`
fn newest_image(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".hex"))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

impl Controller {
    /// Close the device and hand the port to the external flasher.
    pub fn update_firmware(&mut self, image: Option<&str>) -> Result<()> {
        if self.flashing {
            return Err(FirmwareError::FlashInProgress.into());
        }
        let dir = self.config.firmware_dir();
        let image = match image.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => {
                let name = plain_name("*update", name)?;
                let name = if name.ends_with(".hex") {
                    name.to_string()
                } else {
                    format!("{}.hex", name)
                };
                Some(dir.join(name)).filter(|p| p.is_file())
            }
            None => newest_image(&dir),
        }
        .ok_or_else(|| FirmwareError::NoImage {
            dir: dir.display().to_string(),
        })?;
        let port = self.config.port.clone().ok_or(ConnectionError::NoPort)?;

        self.close_transport("firmware update");
        self.flashing = true;
        self.status.state = MachineState::Flashing;
        self.status.mark_dirty();
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.evtlog_error(format!("flashing with {}", name));
        self.requests.push(EngineRequest::Flash {
            program: self.config.flasher.program.clone(),
            args: self.config.flasher.args_for(&port, &image),
        });
        Ok(())
    }

    /// A line of output from a child process
    pub fn on_process_line(&mut self, kind: ProcessKind, line: &str, now: Instant) {
        self.now = now;
        if line.is_empty() {
            return;
        }
        match kind {
            ProcessKind::Flash => self.evtlog(line),
            ProcessKind::Exec { channel } => {
                self.emit(Emission::event(format!("--> {}", line)).to(channel));
            }
        }
    }

    /// A child process exited. `code` is `None` when it could not be
    /// started or was killed.
    pub fn on_process_exit(&mut self, kind: ProcessKind, code: Option<i32>, now: Instant) {
        self.now = now;
        match kind {
            ProcessKind::Flash if code == Some(0) => {
                self.evtlog_error("flash update completed");
                self.timers
                    .arm(TimerKind::FlashExit, now + self.timing.flash_exit);
            }
            ProcessKind::Flash => {
                tracing::error!(code = ?code, "flasher failed");
                self.evtlog_error("flash update failed");
                self.flashing = false;
                self.status.state = MachineState::NoDevice;
                self.status.mark_dirty();
                self.try_open();
            }
            ProcessKind::Exec { channel } => {
                if code != Some(0) {
                    self.evtlog_to(format!("exec exited with {:?}", code), channel);
                }
            }
        }
    }
}
