use gridlink_communication::{
    frame, CommandFlags, Controller, DeviceIdentity, EngineRequest, MemoryTransport,
    TransportEvent, Timing, WireLog,
};
use gridlink_core::{ClientHub, ClientKind, CommandError, DeviceMode, Error, JobError, MachineState};
use proptest::prelude::*;
use gridlink_settings::Config;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Rig {
    ctl: Controller,
    wire: WireLog,
    hub: Arc<ClientHub>,
    now: Instant,
    generation: u64,
    dir: TempDir,
}

fn quiet_timing() -> Timing {
    Timing {
        idle_poll: Duration::from_secs(3600),
        status_push: Duration::from_secs(3600),
        ..Timing::default()
    }
}

impl Rig {
    fn new(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with_timing(quiet_timing(), tweak)
    }

    fn with_timing(timing: Timing, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.port = Some("/dev/ttyTEST0".to_string());
        config.max_outstanding = Some(3);
        config.file_dir = dir.path().to_path_buf();
        config.bed_clear_marker = dir.path().join("bed.clear");
        config.override_file = dir.path().join("overrides.json");
        config.on.boot = Some(vec![]);
        tweak(&mut config);

        let hub = Arc::new(ClientHub::new());
        let identity = DeviceIdentity {
            name: "bench".to_string(),
            uuid: "0000-test".to_string(),
            version: "0.1.0".to_string(),
        };
        let mut ctl = Controller::with_timing(config, identity, hub.clone(), timing);
        let now = Instant::now();
        ctl.start(now);

        let mut rig = Self {
            ctl,
            wire: WireLog::default(),
            hub,
            now,
            generation: 0,
            dir,
        };
        rig.open();
        rig
    }

    /// Complete the pending open request with a fresh memory transport
    fn open(&mut self) {
        let generation = self
            .ctl
            .take_requests()
            .into_iter()
            .find_map(|r| match r {
                EngineRequest::Open { generation, .. } => Some(generation),
                _ => None,
            })
            .expect("open request");
        let (transport, wire) = MemoryTransport::new("mem");
        self.ctl.on_open(generation, Box::new(transport), self.now);
        self.wire = wire;
        self.generation = generation;
    }

    fn boot(&mut self) {
        self.feed("start");
        self.advance(Duration::from_millis(2100));
        assert_eq!(self.ctl.status().state, MachineState::Idle);
        assert!(self.ctl.status().device.ready);
        self.wire.take();
    }

    fn feed(&mut self, line: &str) {
        let event = TransportEvent::data(self.generation, format!("{}\n", line));
        self.ctl.on_transport_event(event, self.now);
    }

    fn ok(&mut self, count: usize) {
        for _ in 0..count {
            self.feed("ok");
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.ctl.on_timers(self.now);
    }

    fn send(&mut self, line: &str) {
        self.ctl.enqueue(line, CommandFlags::default());
    }

    fn client(&mut self, line: &str) {
        self.ctl.handle_client_line(line, None, self.now);
    }

    fn sent(&self) -> Vec<String> {
        self.wire
            .take()
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect()
    }

    fn job(&self, name: &str, lines: usize) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        let body: Vec<String> = (1..=lines).map(|i| format!("G1 X{}", i)).collect();
        fs::write(&path, body.join("\n")).unwrap();
        path
    }
}

fn received(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(line);
    }
    out
}

#[test]
fn test_acks_release_commands_in_order() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    for i in 1..=5 {
        rig.send(&format!("G1 X{}", i));
    }
    assert_eq!(rig.sent(), vec!["G1 X1", "G1 X2", "G1 X3"]);
    assert_eq!(rig.ctl.waiting(), 3);
    assert_eq!(rig.ctl.pending_len(), 2);

    rig.ok(1);
    assert_eq!(rig.sent(), vec!["G1 X4"]);
    assert_eq!(rig.ctl.in_flight_lines(), vec!["G1 X2", "G1 X3", "G1 X4"]);

    rig.ok(3);
    assert_eq!(rig.sent(), vec!["G1 X5"]);
    assert_eq!(rig.ctl.waiting(), 1);
    assert_eq!(rig.ctl.in_flight_lines(), vec!["G1 X5"]);
}

#[test]
fn test_client_commands_jump_the_queue() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    for i in 1..=5 {
        rig.send(&format!("G1 X{}", i));
    }
    rig.sent();
    rig.client("M105");
    assert_eq!(rig.ctl.pending_lines(), vec!["M105", "G1 X4", "G1 X5"]);
    rig.ok(1);
    assert_eq!(rig.sent(), vec!["M105"]);
}

#[test]
fn test_resend_replays_from_requested_line() {
    let mut rig = Rig::new(|c| {
        c.checksum = true;
        c.max_outstanding = Some(10);
    });
    rig.boot();
    for i in 1..=8 {
        rig.send(&format!("G1 X{}", i));
    }
    let sent = rig.sent();
    assert_eq!(sent.len(), 8);
    assert_eq!(sent[0], frame("G1 X1", 1));

    rig.feed("Resend: 6");
    assert!(rig.ctl.is_resending());
    assert!(rig.ctl.is_paused());
    // stale acknowledgments inside the quiet window are absorbed
    rig.ok(2);
    rig.advance(Duration::from_millis(40));
    assert!(rig.sent().is_empty());
    rig.ok(1);
    rig.advance(Duration::from_millis(40));
    assert!(rig.sent().is_empty());
    rig.advance(Duration::from_millis(20));

    assert_eq!(
        rig.sent(),
        vec![frame("G1 X6", 6), frame("G1 X7", 7), frame("G1 X8", 8)]
    );
    assert!(!rig.ctl.is_resending());
    assert_eq!(rig.ctl.waiting(), 3);
    assert!(rig.ctl.is_paused());

    rig.ok(3);
    assert_eq!(rig.ctl.waiting(), 0);
    assert!(!rig.ctl.is_paused());
}

#[test]
fn test_resend_with_nothing_to_replay() {
    let mut rig = Rig::new(|c| c.checksum = true);
    rig.boot();
    rig.send("G1 X1");
    rig.send("G1 X2");
    rig.feed("Resend: 9");
    assert!(!rig.ctl.is_resending());
    assert_eq!(rig.ctl.waiting(), 0);
    assert!(rig.ctl.in_flight_lines().is_empty());
}

#[test]
fn test_device_ready_announced_once() {
    let mut rig = Rig::new(|_| {});
    let (_id, mut rx) = rig.hub.register(ClientKind::Console);
    rig.feed("start");
    rig.feed("echo:Marlin 2.1.2");
    rig.advance(Duration::from_millis(1500));
    rig.feed("echo: Last Updated: 2023-01-01");
    rig.advance(Duration::from_millis(1100));
    rig.feed("echo:SD card ok");
    for _ in 0..5 {
        rig.advance(Duration::from_secs(1));
    }
    let ready = received(&mut rx)
        .into_iter()
        .filter(|l| l == "*** device ready ***")
        .count();
    assert_eq!(ready, 1);
    assert_eq!(rig.ctl.status().state, MachineState::Idle);
}

#[test]
fn test_silent_device_is_bumped_then_closed() {
    let mut rig = Rig::new(|_| {});
    rig.advance(Duration::from_millis(2100));
    assert!(rig.ctl.status().device.ready);
    rig.advance(Duration::from_secs(1));
    assert_eq!(rig.ctl.status().state, MachineState::Idle);
    assert!(rig.ctl.is_connected());
    rig.advance(Duration::from_secs(1));
    assert!(!rig.ctl.is_connected());
    assert!(rig.wire.is_closed());
    assert_eq!(rig.ctl.status().state, MachineState::NoDevice);
}

#[test]
fn test_job_progress_reaches_completion() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    rig.client("*clear");
    let path = rig.job("part.gcode", 10);
    rig.ctl.send_file(&path, false).unwrap();
    assert_eq!(rig.ctl.status().state, MachineState::Printing);
    assert!(!rig.dir.path().join("bed.clear").exists());
    assert!(rig.dir.path().join("part.output").is_dir());

    let mut last = rig.ctl.status().print.progress;
    for _ in 0..7 {
        rig.ok(1);
        let progress = rig.ctl.status().print.progress;
        assert!(progress >= last, "{} < {}", progress, last);
        last = progress;
    }
    let print = &rig.ctl.status().print;
    assert!(!print.run);
    assert_eq!(print.progress, 100.0);
    assert_eq!(rig.ctl.status().state, MachineState::Idle);

    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(rig.dir.path().join("part.print")).unwrap())
            .unwrap();
    assert_eq!(record["progress"], 100.0);
}

#[test]
fn test_job_preconditions() {
    let mut rig = Rig::new(|_| {});
    let path = rig.job("part.gcode", 4);
    assert!(matches!(
        rig.ctl.send_file(&path, false),
        Err(Error::Job(JobError::DeviceNotReady))
    ));
    rig.boot();
    assert!(matches!(
        rig.ctl.send_file(&path, false),
        Err(Error::Job(JobError::BedNotClear))
    ));
    rig.client("*clear");
    let empty = rig.dir.path().join("empty.gcode");
    fs::write(&empty, "").unwrap();
    assert!(matches!(
        rig.ctl.send_file(&empty, false),
        Err(Error::Job(JobError::EmptyFile))
    ));
    assert!(!rig.ctl.status().print.run);

    rig.ctl.send_file(&path, false).unwrap();
    rig.client("*clear");
    assert!(matches!(
        rig.ctl.send_file(&path, false),
        Err(Error::Job(JobError::JobInProgress))
    ));
}

#[test]
fn test_repeat_block_runs_body_count_plus_one() {
    let mut rig = Rig::new(|c| c.max_outstanding = Some(10));
    rig.boot();
    rig.send("M808 L2");
    rig.send("G1 X1");
    rig.send("G1 X2");
    rig.send("M808");
    assert_eq!(
        rig.sent(),
        vec!["G1 X1", "G1 X2", "G1 X1", "G1 X2", "G1 X1", "G1 X2"]
    );
}

#[test]
fn test_pause_waits_for_in_flight_then_resume_restores_position() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    for i in 1..=5 {
        rig.send(&format!("G1 X{}", i));
    }
    rig.sent();
    rig.ctl.pause(Some("filament".to_string())).unwrap();
    assert!(rig.ctl.is_paused());
    rig.ok(3);
    assert!(rig.sent().is_empty());
    assert_eq!(rig.ctl.status().pos.stack.len(), 1);

    rig.ctl.resume().unwrap();
    assert!(!rig.ctl.is_paused());
    assert_eq!(rig.sent(), vec!["G0 X3 Y0 Z0 F3000", "G1 X4", "G1 X5"]);
    assert!(rig.ctl.status().pos.stack.is_empty());
}

#[test]
fn test_cancel_discards_job_and_queues_abort_sequence() {
    let mut rig = Rig::new(|c| c.on.abort = Some(vec!["M104 S0".to_string()]));
    rig.boot();
    rig.client("*clear");
    let path = rig.job("part.gcode", 10);
    rig.ctl.send_file(&path, false).unwrap();

    rig.client("*cancel");
    let print = &rig.ctl.status().print;
    assert!(!print.run);
    assert!(!print.cancel);
    assert_eq!(rig.ctl.pending_lines(), vec!["M104 S0"]);
    assert!(rig.ctl.is_connected());

    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(rig.dir.path().join("part.print")).unwrap())
            .unwrap();
    assert_eq!(record["cancel"], true);
}

#[test]
fn test_abort_resets_device_and_runs_abort_sequence_on_next_boot() {
    let mut rig = Rig::new(|c| c.on.abort = Some(vec!["M104 S0".to_string()]));
    rig.boot();
    rig.client("*abort");
    let sent = rig.sent();
    assert_eq!(sent, vec!["M999", "M410"]);
    assert!(!rig.ctl.is_connected());
    assert_eq!(rig.ctl.status().state, MachineState::NoDevice);

    let stale = rig.generation;
    rig.advance(Duration::from_secs(2));
    rig.open();
    assert!(rig.generation > stale);

    rig.ctl
        .on_transport_event(TransportEvent::data(stale, "start\n"), rig.now);
    assert_eq!(rig.ctl.status().device.lines, 0);

    rig.feed("start");
    rig.advance(Duration::from_millis(2100));
    assert_eq!(rig.sent(), vec!["M104 S0"]);
}

#[test]
fn test_device_error_with_recovery_closes_port() {
    let mut rig = Rig::new(|c| c.recover_on_error = true);
    rig.boot();
    rig.feed("Error:Printer halted. kill() called!");
    let status = rig.ctl.status();
    assert_eq!(status.error.count, 1);
    assert_eq!(
        status.error.cause.as_deref(),
        Some("Printer halted. kill() called!")
    );
    assert!(!rig.ctl.is_connected());
}

#[test]
fn test_directive_errors_go_to_sender_only() {
    let mut rig = Rig::new(|_| {});
    let (a, mut rx_a) = rig.hub.register(ClientKind::Net);
    let (_b, mut rx_b) = rig.hub.register(ClientKind::Net);
    rig.ctl.handle_client_line("*bogus 1", Some(a), rig.now);
    assert_eq!(
        received(&mut rx_a),
        vec!["*** invalid command \"bogus 1\" ***"]
    );
    assert!(received(&mut rx_b).is_empty());
}

#[test]
fn test_feed_macro_and_emergency_directives() {
    let mut rig = Rig::new(|c| {
        c.max_outstanding = Some(10);
        c.macros
            .insert("home".to_string(), "G28; M114".to_string());
    });
    rig.boot();
    rig.client("*feed 1.5");
    rig.client("*macro home");
    rig.client("!M112");
    assert_eq!(rig.sent(), vec!["M220 S150", "G28", "M114", "M112"]);
    assert_eq!(rig.ctl.status().feed, 1.5);
}

#[test]
fn test_set_config_persists_overrides() {
    let mut rig = Rig::new(|_| {});
    let encoded = urlencoding::encode(r#"{"max_outstanding":5}"#).into_owned();
    rig.client(&format!("*set-config {}", encoded));
    assert_eq!(rig.ctl.max_outstanding(), 5);
    let stored = fs::read_to_string(rig.dir.path().join("overrides.json")).unwrap();
    assert!(stored.contains("max_outstanding"));
}

#[test]
fn test_idle_poll_requests_reports() {
    let timing = Timing {
        status_push: Duration::from_secs(3600),
        ..Timing::default()
    };
    let mut rig = Rig::with_timing(timing, |_| {});
    rig.boot();
    rig.advance(Duration::from_secs(1));
    assert_eq!(rig.sent(), vec!["M105", "M114"]);
}

#[test]
fn test_nested_repeat_blocks_expand_into_parent() {
    let mut rig = Rig::new(|c| c.max_outstanding = Some(10));
    rig.boot();
    for line in ["M808 L1", "G1 X1", "M808 L1", "G1 X2", "M808", "M808"] {
        rig.send(line);
    }
    assert_eq!(
        rig.sent(),
        vec!["G1 X1", "G1 X2", "G1 X2", "G1 X1", "G1 X2", "G1 X2"]
    );
}

#[test]
fn test_repeat_count_is_clamped() {
    let mut rig = Rig::new(|c| c.max_outstanding = Some(10));
    rig.boot();
    let (_id, mut rx) = rig.hub.register(ClientKind::Console);
    rig.send("M808 L1e12");
    rig.send("G1 X1");
    rig.send("M808");
    assert_eq!(rig.sent().len() + rig.ctl.pending_len(), 1001);
    assert!(received(&mut rx).iter().any(|l| l.contains("clamped")));
}

#[test]
fn test_low_planner_holds_drain_until_retry() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    for i in 1..=5 {
        rig.send(&format!("G1 X{}", i));
    }
    assert_eq!(rig.sent(), vec!["G1 X1", "G1 X2", "G1 X3"]);
    rig.feed("ok P15 B127");
    assert_eq!(rig.sent(), vec!["G1 X4"]);

    rig.feed("ok P2 B127");
    assert!(rig.sent().is_empty());
    rig.advance(Duration::from_millis(50));
    assert!(rig.sent().is_empty());
    rig.advance(Duration::from_millis(60));
    assert_eq!(rig.sent(), vec!["G1 X5"]);
}

#[test]
fn test_low_buffer_retry_restarts_on_fresh_telemetry() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    for i in 1..=5 {
        rig.send(&format!("G1 X{}", i));
    }
    rig.sent();
    rig.feed("ok P15 B127");
    assert_eq!(rig.sent(), vec!["G1 X4"]);

    rig.feed("ok P15 B8");
    rig.advance(Duration::from_millis(300));
    assert!(rig.sent().is_empty());
    // still low: the 500ms wait starts over
    rig.feed("ok P15 B8");
    rig.advance(Duration::from_millis(250));
    assert!(rig.sent().is_empty());
    rig.advance(Duration::from_millis(260));
    assert_eq!(rig.sent(), vec!["G1 X5"]);
}

#[test]
fn test_fragile_device_error_exits() {
    let mut rig = Rig::new(|c| c.fragile = true);
    rig.boot();
    rig.ctl.take_requests();
    rig.feed("Error:Thermal Runaway, system stopped!");
    assert!(!rig.ctl.is_connected());
    assert_eq!(rig.ctl.status().error.count, 1);
    assert!(rig.ctl.take_requests().contains(&EngineRequest::Exit(-1)));
}

#[test]
fn test_extrude_off_strips_e_words() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    rig.send("G1 X1 E2.5");
    rig.client("*extrude off");
    rig.send("G1 X2 E1.5 F1200");
    assert_eq!(rig.sent(), vec!["G1 X1 E2.5", "G1 X2 F1200"]);
    let pos = &rig.ctl.status().pos;
    assert_eq!(pos.e, 2.5);
    assert_eq!(pos.x, 2.0);
    assert_eq!(pos.f, Some(1200.0));
}

#[test]
fn test_relative_moves_accumulate() {
    let mut rig = Rig::new(|c| c.max_outstanding = Some(10));
    rig.boot();
    rig.send("G91");
    rig.send("G1 X5 Y1");
    rig.send("G1 X5 Y1");
    assert!(rig.ctl.status().pos.rel);
    rig.send("G90");
    rig.send("G1 Z3");
    let pos = &rig.ctl.status().pos;
    assert!(!pos.rel);
    assert_eq!((pos.x, pos.y, pos.z), (10.0, 2.0, 3.0));
}

#[test]
fn test_stop_codes_pause_the_queue() {
    for stop in ["M0", "M1", "M2000"] {
        let mut rig = Rig::new(|_| {});
        rig.boot();
        rig.send("G1 X1");
        rig.send(&format!("{} change", stop));
        rig.send("G1 X2");
        assert_eq!(rig.sent(), vec!["G1 X1"], "{}", stop);
        assert!(rig.ctl.is_paused());
        assert_eq!(rig.ctl.status().print.pause_reason.as_deref(), Some("change"));
        assert_eq!(rig.ctl.pending_lines(), vec!["G1 X2"]);
    }
}

#[test]
fn test_grbl_error_consumes_in_flight_command() {
    let mut rig = Rig::new(|c| c.mode = DeviceMode::Cnc);
    rig.boot();
    rig.feed("Grbl 1.1h ['$' for help]");
    assert!(rig.ctl.status().device.grbl);
    rig.send("G1 X1");
    rig.send("G1 X2");
    rig.sent();

    rig.feed("error:20");
    assert_eq!(rig.ctl.in_flight_lines(), vec!["G1 X2"]);
    assert_eq!(rig.ctl.waiting(), 1);
    assert_eq!(rig.ctl.status().error.count, 1);
    assert!(rig.ctl.is_connected());
}

#[test]
fn test_ack_with_nothing_in_flight_is_ignored() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    rig.ok(2);
    assert_eq!(rig.ctl.waiting(), 0);
    rig.send("G1 X1");
    assert_eq!(rig.sent(), vec!["G1 X1"]);
    assert_eq!(rig.ctl.waiting(), 1);
    rig.ok(1);
    assert_eq!(rig.ctl.waiting(), 0);
    assert!(rig.ctl.in_flight_lines().is_empty());
}

#[test]
fn test_firmware_image_must_stay_in_directory() {
    let mut rig = Rig::new(|_| {});
    rig.boot();
    assert!(matches!(
        rig.ctl.update_firmware(Some("../../outside")),
        Err(Error::Command(CommandError::BadArgument { .. }))
    ));
    assert!(rig.ctl.is_connected());
    assert_ne!(rig.ctl.status().state, MachineState::Flashing);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_in_flight_never_exceeds_ceiling(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
        let mut rig = Rig::new(|_| {});
        rig.boot();
        let mut queued = 0;
        for enqueue in ops {
            if enqueue {
                queued += 1;
                rig.send(&format!("G1 X{}", queued));
            } else {
                rig.feed("ok");
            }
            prop_assert!(rig.ctl.waiting() <= 3);
            prop_assert_eq!(rig.ctl.in_flight_lines().len(), rig.ctl.waiting());
        }
        let expected: Vec<String> = (1..=queued - rig.ctl.pending_len())
            .map(|i| format!("G1 X{}", i))
            .collect();
        prop_assert_eq!(rig.sent(), expected);
    }
}
