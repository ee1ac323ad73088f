//! Job control and the job file directory

use super::command::CommandFlags;
use super::{Controller, PauseCompletion};
use crate::protocol::lenient_f64;
use crate::protocol::tokenizer::tokenize_line;
use gridlink_core::{epoch_ms, ClientId, CommandError, Emission, JobError, MachineState, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Extensions listed as runnable files
const LISTED: [&str; 3] = ["gcode", "nc", "hex"];

/// One entry of the job file listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    /// File name with extension
    pub name: String,
    /// Extension
    pub ext: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, ms since the epoch
    pub time: i64,
    /// Record of the last run of this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Value>,
}

/// List runnable files in `dir`, each with its last-run record when one
/// exists. Same-extension files are newest first, extensions ascending.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut records: HashMap<String, Value> = HashMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(dot) = name.rfind('.').filter(|&i| i > 0) else {
            continue;
        };
        let (stem, ext) = (&name[..dot], &name[dot + 1..]);
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        if ext == "print" {
            match fs::read_to_string(entry.path())
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
            {
                Some(record) => {
                    records.insert(stem.to_string(), record);
                }
                None => tracing::debug!("unreadable run record {}", name),
            }
        } else if LISTED.contains(&ext) {
            let time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_millis() as i64);
            entries.push(FileEntry {
                name: name.clone(),
                ext: ext.to_string(),
                size: meta.len(),
                time,
                last: None,
            });
        }
    }

    for entry in &mut entries {
        if let Some(dot) = entry.name.rfind('.') {
            entry.last = records.get(&entry.name[..dot]).cloned();
        }
    }
    entries.sort_by(|a, b| {
        if a.ext == b.ext {
            b.time.cmp(&a.time)
        } else {
            a.ext.cmp(&b.ext)
        }
    });
    Ok(entries)
}

/// XY extent of the moves in a job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Smallest X
    pub min_x: f64,
    /// Smallest Y
    pub min_y: f64,
    /// Largest X
    pub max_x: f64,
    /// Largest Y
    pub max_y: f64,
}

/// Compute the XY bounds of every G0/G1 move, following G90/G91.
pub fn job_bounds(text: &str) -> Option<Bounds> {
    let (mut x, mut y) = (0.0_f64, 0.0_f64);
    let mut absolute = true;
    let mut bounds: Option<Bounds> = None;

    for line in text.lines() {
        let toks = tokenize_line(line);
        match toks.first().map(String::as_str) {
            Some("G0" | "G1") => {
                let (mut dx, mut dy) = if absolute { (x, y) } else { (0.0, 0.0) };
                for tok in &toks[1..] {
                    let mut chars = tok.chars();
                    let axis = chars.next();
                    match (axis, lenient_f64(chars.as_str())) {
                        (Some('X'), Some(v)) => dx = v,
                        (Some('Y'), Some(v)) => dy = v,
                        _ => {}
                    }
                }
                if absolute {
                    x = dx;
                    y = dy;
                } else {
                    x += dx;
                    y += dy;
                }
                let b = bounds.get_or_insert(Bounds {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                });
                b.min_x = b.min_x.min(x);
                b.min_y = b.min_y.min(y);
                b.max_x = b.max_x.max(x);
                b.max_y = b.max_y.max(y);
            }
            Some("G90") => absolute = true,
            Some("G91") => absolute = false,
            _ => {}
        }
    }
    bounds
}

/// Reject names that would escape the file directory
pub(super) fn plain_name<'a>(directive: &str, name: &'a str) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
        return Err(CommandError::BadArgument {
            directive: directive.to_string(),
            reason: format!("invalid file name '{}'", name),
        }
        .into());
    }
    Ok(name)
}

fn with_extension(name: &str, ext: &str) -> String {
    if name.contains(ext) {
        name.to_string()
    } else {
        format!("{}{}", name, ext)
    }
}

impl Controller {
    pub(crate) fn require_ready(&self) -> Result<()> {
        if self.transport.is_some() && self.status.device.ready {
            Ok(())
        } else {
            Err(JobError::DeviceNotReady.into())
        }
    }

    fn require_idle(&self) -> Result<()> {
        if self.status.print.run {
            Err(JobError::JobInProgress.into())
        } else {
            Ok(())
        }
    }

    /// Stream a job file to the device, or spool it to the device's SD card.
    pub fn send_file(&mut self, path: &Path, to_sd: bool) -> Result<()> {
        self.require_ready()?;
        self.require_idle()?;
        if !self.refresh_bed_clear() {
            return Err(JobError::BedNotClear.into());
        }
        let unreadable = |e: std::io::Error| JobError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if fs::metadata(path).map_err(unreadable)?.len() == 0 {
            return Err(JobError::EmptyFile.into());
        }
        let text = fs::read_to_string(path).map_err(unreadable)?;

        let filename = path.display().to_string();
        let outdir = path.with_extension("output");
        let print = &mut self.status.print;
        print.run = true;
        print.abort = false;
        print.pause = false;
        print.pause_reason = None;
        print.cancel = false;
        print.progress = 0.0;
        print.emit = 0.0;
        print.end = 0;
        print.filename = Some(filename.clone());
        print.outdir = Some(outdir.display().to_string());
        print.outseq = 0;
        print.start = epoch_ms();
        self.paused = false;
        self.cancel = false;
        self.status.state = match self.status.device.mode {
            gridlink_core::DeviceMode::Cnc => MachineState::Milling,
            gridlink_core::DeviceMode::Fdm => MachineState::Printing,
        };
        self.status.mark_dirty();
        self.evtlog(format!("job head {}", filename));
        if let Err(e) = prepare_output_dir(&outdir) {
            tracing::warn!("output dir {}: {}", outdir.display(), e);
        }

        if to_sd || self.config.sd_spool {
            self.line_numbers.reset();
            self.sd_send = true;
            self.evtlog(format!("spooling \"{} to SD\"", filename));
            let numbered = CommandFlags {
                checksum: true,
                ..Default::default()
            };
            self.enqueue("M110 N0", CommandFlags::default());
            self.enqueue("M28 print.gco", numbered.clone());
            for line in text.split('\n') {
                self.enqueue(line, numbered.clone());
            }
            self.enqueue("M29", CommandFlags::default());
        } else {
            for line in text.split('\n') {
                self.enqueue(line, CommandFlags::job());
            }
            self.bed_dirty();
        }
        self.drain();
        Ok(())
    }

    /// Close out the running job and write its run record.
    pub(crate) fn finish_job(&mut self) {
        let print = &mut self.status.print;
        print.end = epoch_ms();
        print.run = false;
        print.pause = false;
        print.pause_reason = None;
        let minutes = (print.end - print.start) as f64 / 60000.0;
        let name = print.filename.clone().unwrap_or_default();
        let message = if print.cancel {
            format!("job cancelled {} after {:.2} min", name, minutes)
        } else if print.abort {
            format!("job aborted {} after {:.2} min", name, minutes)
        } else {
            print.progress = 100.0;
            format!("job done {} in {:.2} min", name, minutes)
        };

        if !name.is_empty() {
            let record = Path::new(&name).with_extension("print");
            let written = serde_json::to_string(&*print)
                .map_err(std::io::Error::from)
                .and_then(|json| fs::write(&record, json));
            if let Err(e) = written {
                tracing::warn!("run record {}: {}", record.display(), e);
            }
        }

        let print = &mut self.status.print;
        print.cancel = false;
        print.abort = false;
        self.paused = false;
        self.pause_completion = None;
        if self.transport.is_some() {
            self.status.state = MachineState::Idle;
        }
        self.status.mark_dirty();
        self.evtlog(message);
    }

    /// Pause execution. Commands already in flight complete, then the pause
    /// sequence runs.
    pub fn pause(&mut self, reason: Option<String>) -> Result<()> {
        if self.status.print.pause {
            return Ok(());
        }
        self.require_ready()?;
        match &reason {
            Some(reason) => self.evtlog(format!("execution paused for {}", reason)),
            None => self.evtlog("execution paused"),
        }
        self.status.print.pause = true;
        self.status.print.pause_reason = reason;
        self.status.mark_dirty();

        if self.resending {
            self.deferred_completion = Some(PauseCompletion::RunPauseSequence);
            return Ok(());
        }
        self.paused = true;
        if self.waiting == 0 {
            self.run_pause_completion(PauseCompletion::RunPauseSequence);
        } else {
            self.pause_completion = Some(PauseCompletion::RunPauseSequence);
        }
        Ok(())
    }

    /// Resume a paused queue, running the resume sequence first.
    pub fn resume(&mut self) -> Result<()> {
        if !self.status.print.pause {
            return Ok(());
        }
        self.require_ready()?;
        self.evtlog("execution resumed");
        self.status.print.pause = false;
        self.status.print.pause_reason = None;
        self.status.mark_dirty();
        self.paused = self.resending;
        self.pause_completion = None;
        self.deferred_completion = None;
        for cmd in self.config.resume_sequence() {
            self.enqueue(&cmd, CommandFlags::priority(None));
        }
        self.drain();
        Ok(())
    }

    /// Drop pending job commands and run the abort sequence. The device
    /// stays connected.
    pub fn cancel_job(&mut self) -> Result<()> {
        self.require_ready()?;
        self.evtlog("job cancelled");
        self.status.print.cancel = true;
        self.cancel = true;
        self.queue.clear();
        self.drain();
        self.cancel = false;
        for cmd in self.config.abort_sequence() {
            self.enqueue(&cmd, CommandFlags::priority(None));
        }
        self.drain();
        Ok(())
    }

    /// Emergency stop: reset the firmware, drop everything and reconnect.
    /// The abort sequence runs on the next boot.
    pub fn abort_job(&mut self) -> Result<()> {
        self.require_ready()?;
        self.evtlog_error("job aborted");
        self.send_raw("\nM999");
        self.send_raw("\nM410");
        self.queue.clear();
        self.next_boot = Some(self.config.abort_sequence());
        self.status.print.pause = false;
        self.paused = false;
        self.pause_completion = None;
        self.status.print.abort = true;
        self.close_transport("job aborted");
        self.drain();
        Ok(())
    }

    /// Create the bed clear marker
    pub fn bed_clear(&mut self) -> Result<()> {
        let marker = &self.config.bed_clear_marker;
        if let Some(parent) = marker.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(marker, b"")?;
        self.status.print.clear = true;
        self.status.mark_dirty();
        self.publish_status(false, None);
        Ok(())
    }

    /// Remove the bed clear marker
    pub(crate) fn bed_dirty(&mut self) {
        let marker = &self.config.bed_clear_marker;
        if marker.exists() {
            if let Err(e) = fs::remove_file(marker) {
                tracing::warn!("bed marker {}: {}", marker.display(), e);
            }
        }
        self.status.print.clear = false;
        self.status.mark_dirty();
        self.publish_status(false, None);
        self.evtlog("marking bed dirty");
    }

    /// Re-read the bed clear marker
    pub(crate) fn refresh_bed_clear(&mut self) -> bool {
        let clear = self.config.bed_clear_marker.exists();
        if clear != self.status.print.clear {
            self.status.print.clear = clear;
            self.status.mark_dirty();
        }
        clear
    }

    /// Trace the XY extent of a job file at `feed`, then return to the
    /// current position.
    pub fn runbox(&mut self, path: &Path, feed: f64) -> Result<()> {
        self.require_idle()?;
        let text = fs::read_to_string(path).map_err(|e| JobError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let b = job_bounds(&text).ok_or(JobError::EmptyFile)?;
        let (start_x, start_y) = (self.status.pos.x, self.status.pos.y);
        let moves = [
            format!("G1 X{} Y{} F{}", b.min_x, b.min_y, feed),
            format!("G1 X{} Y{}", b.min_x, b.max_y),
            format!("G1 X{} Y{}", b.max_x, b.max_y),
            format!("G1 X{} Y{}", b.max_x, b.min_y),
            format!("G1 X{} Y{}", b.min_x, b.min_y),
            format!("G1 X{} Y{}", start_x, start_y),
        ];
        for line in moves {
            self.enqueue(&line, CommandFlags::default());
        }
        Ok(())
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.config.file_dir.join(name)
    }

    /// Start the named job, or the newest gcode file when `name` is `None`.
    pub fn kick(&mut self, name: Option<&str>) -> Result<()> {
        self.require_idle()?;
        let file = match name {
            Some(name) => with_extension(plain_name("*kick", name)?, ".gcode"),
            None => list_files(&self.config.file_dir)?
                .into_iter()
                .find(|f| f.ext == "gcode")
                .map(|f| f.name)
                .ok_or(JobError::NoValidFiles)?,
        };
        let path = self.file_path(&file);
        self.send_file(&path, false)
    }

    /// Path of a named job for `*runbox`
    pub(crate) fn job_path(&self, directive: &str, name: &str) -> Result<PathBuf> {
        Ok(self.file_path(&with_extension(plain_name(directive, name)?, ".gcode")))
    }

    /// Remove a job and everything derived from it.
    pub fn delete_files(&mut self, name: &str) -> Result<()> {
        let name = plain_name("*delete", name)?;
        let base = match name.rfind('.') {
            Some(dot) if dot > 0 => &name[..dot],
            _ => name,
        };
        let encoded = urlencoding::encode(&format!("{}.gcode", base)).into_owned();
        let candidates = [
            format!("{}.nc", base),
            format!("{}.hex", base),
            format!("{}.gcode", base),
            format!("{}.print", base),
            encoded,
        ];
        for file in candidates {
            match fs::remove_file(self.file_path(&file)) {
                Ok(()) => tracing::info!("deleted {}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("delete {}: {}", file, e),
            }
        }
        if fs::remove_dir_all(self.file_path(&format!("{}.output", base))).is_err() {
            self.evtlog(format!("no output dir for {}", base));
        }
        self.publish_file_list(None);
        Ok(())
    }

    /// Store a file received from a client.
    pub fn store_upload(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let name = plain_name("*upload", name)?;
        fs::create_dir_all(&self.config.file_dir)?;
        fs::write(self.file_path(name), data)?;
        self.evtlog(format!("upload {} ({} bytes)", name, data.len()));
        self.publish_file_list(None);
        Ok(())
    }

    /// Publish the job file listing
    pub fn publish_file_list(&self, channel: Option<ClientId>) {
        let listing = list_files(&self.config.file_dir)
            .map_err(gridlink_core::Error::from)
            .and_then(|files| serde_json::to_string(&files).map_err(Into::into));
        match listing {
            Ok(json) => self.emit(Emission::list(format!("*** {} ***", json)).to(channel)),
            Err(e) => tracing::warn!("file listing {}: {}", self.config.file_dir.display(), e),
        }
    }
}

fn prepare_output_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    } else {
        fs::create_dir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_job_bounds_absolute_and_relative() {
        let text = "G90\nG0 X10 Y5\nG1 X-2 Y20 E1\nG91\nG1 X3 Y-1\nM105\n";
        let b = job_bounds(text).unwrap();
        assert_eq!(b.min_x, -2.0);
        assert_eq!(b.max_x, 10.0);
        assert_eq!(b.min_y, 5.0);
        assert_eq!(b.max_y, 20.0);
    }

    #[test]
    fn test_job_bounds_without_moves() {
        assert!(job_bounds("M105\n; nothing\n").is_none());
    }

    #[test]
    fn test_list_files_order_and_records() {
        let dir = TempDir::new().unwrap();
        let p = dir.path();
        fs::write(p.join("part.gcode"), "G1 X1\n").unwrap();
        fs::write(p.join("part.print"), r#"{"run":false,"progress":100.0}"#).unwrap();
        fs::write(p.join("mill.nc"), "G0 X1\n").unwrap();
        fs::write(p.join("fw.hex"), ":00000001FF\n").unwrap();
        fs::write(p.join("notes.txt"), "ignored").unwrap();
        fs::write(p.join(".hidden"), "ignored").unwrap();

        let files = list_files(p).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["part.gcode", "fw.hex", "mill.nc"]);
        assert_eq!(files[0].last.as_ref().unwrap()["progress"], 100.0);
        assert!(files[1].last.is_none());
    }

    #[test]
    fn test_plain_name_rejects_paths() {
        assert!(plain_name("*delete", "../etc/passwd").is_err());
        assert!(plain_name("*delete", "").is_err());
        assert_eq!(plain_name("*delete", " part ").unwrap(), "part");
        assert_eq!(with_extension("part", ".gcode"), "part.gcode");
        assert_eq!(with_extension("part.gcode", ".gcode"), "part.gcode");
    }
}
