//! Telemetry parser
//!
//! Pulls structured fields out of the free-form text firmware prints:
//! temperatures, positions, endstops, firmware identity, settings echoes,
//! soft endstops and GRBL status reports. Each recognizer is a substring or
//! prefix match on the raw line and several may apply to the same line.
//!
//! Parsing only writes into [`DeviceStatus`]. Anything that needs the engine
//! to act (pausing a job, asking for settings) comes back as a
//! [`TelemetryAction`].

use super::grbl_status::StatusParser;
use super::lenient_f64;
use gridlink_core::{DeviceMode, DeviceStatus};
use std::collections::HashSet;

/// Follow-up the engine should perform for a parsed line
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryAction {
    /// Pause the running job
    Pause(Option<String>),
    /// Resume a paused job
    Resume,
    /// Cancel the running job
    Cancel,
    /// Firmware settings were lost; dump them again
    RequestSettings,
    /// GRBL banner seen in milling mode
    GrblDetected,
    /// Planner blocks and RX bytes free, from a GRBL report
    Buffers {
        /// Planner blocks available
        planner: u32,
        /// Input buffer bytes available
        rx: u32,
    },
    /// Firmware rejected a command
    UnknownCommand(String),
}

/// Outcome of parsing one non-temperature line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    /// Follow-up actions in the order they were recognized
    pub actions: Vec<TelemetryAction>,
    /// Line was a position report
    pub position_report: bool,
}

/// Parse a temperature report (`T:`, `T0:`, `T1:`, `B:`, possibly doubled as
/// `TT:` / `BB:`). Returns true when the line was one.
///
/// `is_ok` marks a report riding on an acknowledgment (`ok T:...`).
pub fn parse_temperature(line: &str, is_ok: bool, status: &mut DeviceStatus) -> bool {
    let tpos = match (line.find("T:"), line.find("T0:")) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let bpos = line.find("B:");
    let is_report = tpos.is_some_and(|p| p < 6) || bpos.is_some_and(|p| p <= 6);
    if !is_report {
        return false;
    }

    let doubled = line.contains("TT:");
    let mut fixed = line
        .replacen("TT:", "T:", 1)
        .replacen("BB:", "B:", 1)
        .replace("::", ":")
        .replace("//", "/");
    if is_ok {
        fixed = fixed.get(3..).unwrap_or_default().to_string();
    }
    let fixed = collapse_before_slash(&fixed);

    let value = |s: Option<&str>| -> Option<f64> {
        let s = s?;
        let s = if doubled {
            s.get(s.len() / 2..).unwrap_or(s)
        } else {
            s
        };
        lenient_f64(s)
    };

    for tok in fixed.split(' ') {
        let Some((name, reading)) = tok.split_once(':') else {
            continue;
        };
        let mut parts = reading.split('/');
        let (current, target) = (parts.next(), parts.next());
        match name {
            "T" | "T0" | "T1" => {
                let ext = usize::from(name == "T1");
                status.temp.set_extruder(ext, value(current));
                status.target.set_extruder(ext, value(target));
                status.mark_dirty();
            }
            "B" => {
                status.temp.bed = value(current);
                status.target.bed = value(target);
                status.mark_dirty();
            }
            _ => {}
        }
    }
    true
}

fn collapse_before_slash(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '/' {
            while out.ends_with(' ') {
                out.pop();
            }
        }
        out.push(ch);
    }
    out
}

fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == ' ' && out.ends_with(' ') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Parse every non-temperature field the line carries.
pub fn apply(line: &str, status: &mut DeviceStatus, mode: DeviceMode) -> Telemetry {
    let mut out = Telemetry::default();

    if line.starts_with("echo:EEPROM version mismatch") {
        out.actions.push(TelemetryAction::RequestSettings);
    }

    // M114
    if line.starts_with("X:") {
        out.position_report = true;
        let mut seen = HashSet::new();
        for tok in line.split(' ') {
            let parts: Vec<&str> = tok.split(':').collect();
            if parts.len() != 2 {
                break;
            }
            let (key, raw) = (parts[0], parts[1]);
            if !seen.insert(key) {
                continue;
            }
            let Some(value) = lenient_f64(raw) else {
                continue;
            };
            let mut chars = key.chars();
            if let (Some(axis), None) = (chars.next(), chars.next()) {
                if let Some(slot) = status.pos.axis_mut(axis) {
                    *slot = value;
                    status.mark_dirty();
                }
            }
        }
    }

    // M119
    for (marker, is_min) in [("_min:", true), ("_max:", false)] {
        let found = line.find(marker).filter(|&i| i > 0);
        if let (Some(idx), Some(axis)) = (found, line.get(..1)) {
            let axis = axis.to_string();
            let state = line[idx + marker.len()..].trim().to_string();
            let table = if is_min {
                &mut status.estop.min
            } else {
                &mut status.estop.max
            };
            table.insert(axis, state);
            status.mark_dirty();
        }
    }
    if let Some(idx) = line.find("filament: ") {
        status.estop.filament = Some(line[idx + "filament: ".len()..].trim().to_string());
        status.mark_dirty();
        if status.print.run && !status.print.pause {
            out.actions.push(TelemetryAction::Pause(Some(
                "filament runout detected".to_string(),
            )));
        }
    }

    if line.starts_with("echo:Marlin") {
        if let Some(ver) = line.split(' ').nth(1) {
            status.device.firm.ver = ver.to_string();
            status.mark_dirty();
        }
    }
    if line.starts_with("echo: Last Updated") {
        if let (Some(open), Some(close)) = (line.rfind('('), line.rfind(')')) {
            if close > open {
                status.device.firm.auth = line[open + 1..close].to_string();
                status.mark_dirty();
            }
        }
    }

    let line = collapse_spaces(line);

    // M503
    if let Some(idx) = line.find("echo: M") {
        let mut toks = line[idx + "echo: ".len()..].split(' ');
        if let Some(code) = toks.next() {
            let values: Vec<(String, f64)> = toks
                .filter_map(|tok| {
                    let key = tok.get(..1)?;
                    Some((key.to_string(), lenient_f64(tok.get(1..)?)?))
                })
                .collect();
            status.merge_settings(code, values);
        }
    }

    // M115
    if line.starts_with("FIRMWARE_NAME:") {
        if let Some(sci) = line.find("SOURCE_CODE_URL:") {
            status.device.firm.ver = line["FIRMWARE_NAME:".len()..sci].trim().to_string();
            status.mark_dirty();
        }
        if let (Some(mti), Some(eci)) = (line.find("MACHINE_TYPE:"), line.find("EXTRUDER_COUNT:")) {
            if eci > mti {
                status.device.firm.auth = line[mti + "MACHINE_TYPE:".len()..eci].trim().to_string();
                status.mark_dirty();
            }
        }
    }

    // M211
    if line.contains("echo:Soft endstops:") {
        if let (Some(minpos), Some(maxpos)) = (line.find("Min:"), line.find("Max:")) {
            if maxpos > minpos {
                read_bounds(&line[minpos + 4..maxpos], &mut status.device.min);
                read_bounds(&line[maxpos + 4..], &mut status.device.max);
                status.mark_dirty();
            }
        }
    }

    if line.starts_with("Grbl 1.1") && mode == DeviceMode::Cnc {
        status.device.grbl = true;
        status.mark_dirty();
        out.actions.push(TelemetryAction::GrblDetected);
    }

    if StatusParser::is_status_report(&line) {
        let mut report = StatusParser::parse_full(&line);
        if let Some(mpos) = report.mpos {
            status.grbl.pos = mpos;
        }
        if let Some(wco) = report.wco {
            status.grbl.wco = wco;
        }
        if report.state.is_some() {
            status.grbl.state = report.state.clone();
        }
        // WCO is only reported every few status lines; fall back to the last one
        report.mpos = Some(status.grbl.pos);
        report.wco = Some(status.grbl.wco);
        let [x, y, z] = report.work_position().unwrap_or_default();
        status.pos.x = x;
        status.pos.y = y;
        status.pos.z = z;
        status.mark_dirty();
        out.position_report = true;
        if let Some((planner, rx)) = report.buffer {
            out.actions.push(TelemetryAction::Buffers { planner, rx });
        }
    }

    if line.contains("action:paused") {
        out.actions.push(TelemetryAction::Pause(None));
    }
    if line.contains("action:resume") {
        out.actions.push(TelemetryAction::Resume);
    }
    if line.contains("action:cancel") {
        out.actions.push(TelemetryAction::Cancel);
    }
    if line.contains("Unknown command:") {
        out.actions.push(TelemetryAction::UnknownCommand(line.clone()));
    }

    out
}

fn read_bounds(text: &str, into: &mut std::collections::BTreeMap<String, f64>) {
    for tok in text.split_whitespace() {
        let (Some(axis), Some(raw)) = (tok.get(..1), tok.get(1..)) else {
            continue;
        };
        if let Some(v) = lenient_f64(raw) {
            into.insert(axis.to_string(), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> DeviceStatus {
        DeviceStatus::new("bench", "id", DeviceMode::Fdm, "test")
    }

    #[test]
    fn test_ok_temperature_report() {
        let mut s = status();
        assert!(parse_temperature(
            "ok T:210.5 /215.0 B:60.1 /60.0 @:127 B@:0",
            true,
            &mut s
        ));
        assert_eq!(s.temp.ext[0], Some(210.5));
        assert_eq!(s.target.ext[0], Some(215.0));
        assert_eq!(s.temp.bed, Some(60.1));
        assert_eq!(s.target.bed, Some(60.0));
        assert!(s.take_update());
    }

    #[test]
    fn test_second_extruder() {
        let mut s = status();
        assert!(parse_temperature(" T0:200.0 /200.0 T1:180.0 /190.0 B:55.0 /55.0", false, &mut s));
        assert_eq!(s.temp.ext, vec![Some(200.0), Some(180.0)]);
        assert_eq!(s.target.ext[1], Some(190.0));
    }

    #[test]
    fn test_doubled_report_takes_second_half() {
        let mut s = status();
        assert!(parse_temperature(
            "TT::20.020.0 //20.020.0 BB::60.060.0 //60.060.0",
            false,
            &mut s
        ));
        assert_eq!(s.temp.ext[0], Some(20.0));
        assert_eq!(s.target.ext[0], Some(20.0));
        assert_eq!(s.temp.bed, Some(60.0));
    }

    #[test]
    fn test_non_temperature_lines_ignored() {
        let mut s = status();
        assert!(!parse_temperature("echo:Marlin 2.0.9", false, &mut s));
        assert!(!parse_temperature("ok", true, &mut s));
        assert!(!parse_temperature("X:1.00 Y:2.00 Z:3.00 E:0.00 Count X:0 Y:0 Z:0", false, &mut s));
    }

    #[test]
    fn test_position_report_skips_duplicates_and_keeps_stack() {
        let mut s = status();
        s.pos.rel = true;
        s.pos.stack.push(s.pos.save());
        let t = apply("X:10.00 Y:20.00 Z:5.00 E:1.50 Count X:800 Y:1600 Z:2000", &mut s, DeviceMode::Fdm);
        assert!(t.position_report);
        assert_eq!((s.pos.x, s.pos.y, s.pos.z, s.pos.e), (10.0, 20.0, 5.0, 1.5));
        assert!(s.pos.rel);
        assert_eq!(s.pos.stack.len(), 1);

        apply("X:1.00 Y:2.00 Z:3.00 Z:99.00", &mut s, DeviceMode::Fdm);
        assert_eq!(s.pos.z, 3.0);
    }

    #[test]
    fn test_endstops() {
        let mut s = status();
        apply("x_min: open", &mut s, DeviceMode::Fdm);
        apply("z_max: TRIGGERED", &mut s, DeviceMode::Fdm);
        assert_eq!(s.estop.min["x"], "open");
        assert_eq!(s.estop.max["z"], "TRIGGERED");
    }

    #[test]
    fn test_filament_runout_pauses_running_job() {
        let mut s = status();
        let t = apply("filament: TRIGGERED", &mut s, DeviceMode::Fdm);
        assert!(t.actions.is_empty());
        s.print.run = true;
        let t = apply("filament: TRIGGERED", &mut s, DeviceMode::Fdm);
        assert_eq!(
            t.actions,
            vec![TelemetryAction::Pause(Some("filament runout detected".to_string()))]
        );
        assert_eq!(s.estop.filament.as_deref(), Some("TRIGGERED"));
    }

    #[test]
    fn test_firmware_identity() {
        let mut s = status();
        apply("echo:Marlin 2.1.2", &mut s, DeviceMode::Fdm);
        assert_eq!(s.device.firm.ver, "2.1.2");
        apply("echo: Last Updated: 2023-01-01 | Author: (bench, config)", &mut s, DeviceMode::Fdm);
        assert_eq!(s.device.firm.auth, "bench, config");
        apply(
            "FIRMWARE_NAME:Marlin 2.1.2 (Jan 1 2023) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1 UUID:x",
            &mut s,
            DeviceMode::Fdm,
        );
        assert_eq!(s.device.firm.ver, "Marlin 2.1.2 (Jan 1 2023)");
        assert_eq!(s.device.firm.auth, "Ender-3");
    }

    #[test]
    fn test_settings_echo_merges() {
        let mut s = status();
        apply("echo:  M92 X80.00 Y80.00 Z400.00", &mut s, DeviceMode::Fdm);
        apply("echo: M92 E93.00 Zbad", &mut s, DeviceMode::Fdm);
        let m92 = &s.settings["M92"];
        assert_eq!(m92["X"], 80.0);
        assert_eq!(m92["Z"], 400.0);
        assert_eq!(m92["E"], 93.0);
    }

    #[test]
    fn test_soft_endstops() {
        let mut s = status();
        apply(
            "echo:Soft endstops: ON   Min:  X-5.00 Y0.00 Z0.00   Max:  X235.00 Y235.00 Z250.00",
            &mut s,
            DeviceMode::Fdm,
        );
        assert_eq!(s.device.min["X"], -5.0);
        assert_eq!(s.device.max["Y"], 235.0);
        assert_eq!(s.device.max["Z"], 250.0);
    }

    #[test]
    fn test_grbl_banner_only_in_cnc_mode() {
        let mut s = status();
        assert!(apply("Grbl 1.1h ['$' for help]", &mut s, DeviceMode::Fdm).actions.is_empty());
        assert!(!s.device.grbl);
        let t = apply("Grbl 1.1h ['$' for help]", &mut s, DeviceMode::Cnc);
        assert_eq!(t.actions, vec![TelemetryAction::GrblDetected]);
        assert!(s.device.grbl);
    }

    #[test]
    fn test_grbl_report_position_is_mpos_minus_wco() {
        let mut s = status();
        let t = apply("<Idle|MPos:10.000,20.000,5.000|Bf:15,128|WCO:1.000,2.000,3.000>", &mut s, DeviceMode::Cnc);
        assert_eq!((s.pos.x, s.pos.y, s.pos.z), (9.0, 18.0, 2.0));
        assert_eq!(s.grbl.state.as_deref(), Some("Idle"));
        assert_eq!(t.actions, vec![TelemetryAction::Buffers { planner: 15, rx: 128 }]);

        // offset persists across reports that omit it
        apply("<Run|MPos:11.000,20.000,5.000>", &mut s, DeviceMode::Cnc);
        assert_eq!(s.pos.x, 10.0);
    }

    #[test]
    fn test_action_markers_and_eeprom() {
        let mut s = status();
        assert_eq!(apply("//action:paused", &mut s, DeviceMode::Fdm).actions, vec![TelemetryAction::Pause(None)]);
        assert_eq!(apply("//action:resume", &mut s, DeviceMode::Fdm).actions, vec![TelemetryAction::Resume]);
        assert_eq!(apply("//action:cancel", &mut s, DeviceMode::Fdm).actions, vec![TelemetryAction::Cancel]);
        assert_eq!(
            apply("echo:EEPROM version mismatch (EEPROM=? Marlin=V86)", &mut s, DeviceMode::Fdm).actions,
            vec![TelemetryAction::RequestSettings]
        );
    }
}
