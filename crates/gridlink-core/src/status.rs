//! Device status model
//!
//! A single record describing the attached device, the command pipeline and
//! the running job. The controller owns it exclusively; clients only ever see
//! serialized snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch, used for every status timestamp.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Authoritative controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// No transport open
    #[default]
    #[serde(rename = "no controller")]
    NoDevice,
    /// Transport open, waiting for the device to settle
    #[serde(rename = "connecting")]
    Connecting,
    /// Ready for commands
    #[serde(rename = "idle")]
    Idle,
    /// Streaming an additive job
    #[serde(rename = "printing")]
    Printing,
    /// Streaming a subtractive job
    #[serde(rename = "milling")]
    Milling,
    /// External flasher owns the port
    #[serde(rename = "flashing")]
    Flashing,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no controller"),
            Self::Connecting => write!(f, "connecting"),
            Self::Idle => write!(f, "idle"),
            Self::Printing => write!(f, "printing"),
            Self::Milling => write!(f, "milling"),
            Self::Flashing => write!(f, "flashing"),
        }
    }
}

/// Machine family the controller is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Additive manufacturing (3D printer)
    #[default]
    Fdm,
    /// Subtractive manufacturing (mill / router)
    Cnc,
}

impl DeviceMode {
    /// Parse `fdm` / `cnc`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fdm" => Some(Self::Fdm),
            "cnc" => Some(Self::Cnc),
            _ => None,
        }
    }

    /// Default ceiling for unacknowledged commands in this mode
    pub fn default_max_outstanding(self) -> usize {
        match self {
            Self::Fdm => 8,
            Self::Cnc => 3,
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fdm => write!(f, "fdm"),
            Self::Cnc => write!(f, "cnc"),
        }
    }
}

/// Connected client counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCounts {
    /// Raw TCP control-port clients
    pub net: usize,
    /// 1 when stdin is an active command source
    pub stdin: usize,
}

/// Command pipeline counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Unacknowledged commands in flight
    pub waiting: usize,
    /// Pending commands not yet transmitted
    pub queue: usize,
    /// High-water mark of the pending list for the current run
    pub max: usize,
    /// Lines collected against the in-flight command
    pub collect: Option<Vec<String>>,
}

/// Runtime feature flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeFlags {
    /// Verbose wire tracing
    pub debug: bool,
    /// Extrusion enabled
    pub extrude: bool,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            debug: false,
            extrude: true,
        }
    }
}

/// Firmware identity strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Version (or firmware name)
    pub ver: String,
    /// Author / machine type / build stamp
    pub auth: String,
}

impl Default for FirmwareInfo {
    fn default() -> Self {
        Self {
            ver: "?".to_string(),
            auth: "?".to_string(),
        }
    }
}

/// Identity and connection timestamps of the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Host IPv4 addresses
    pub addr: Vec<String>,
    /// Control port
    pub port: u16,
    /// Display name
    pub name: String,
    /// Persistent controller id
    pub uuid: String,
    /// fdm or cnc
    pub mode: DeviceMode,
    /// GRBL protocol detected / forced
    pub grbl: bool,
    /// Controller software version
    pub version: String,
    /// Firmware identity
    pub firm: FirmwareInfo,
    /// Soft endstop minimum per axis
    pub min: BTreeMap<String, f64>,
    /// Soft endstop maximum per axis
    pub max: BTreeMap<String, f64>,
    /// Connected and booted
    pub ready: bool,
    /// Time of last device reset
    pub boot: i64,
    /// Time the transport opened
    pub connect: i64,
    /// Time the transport last closed
    pub close: i64,
    /// Time of the last line from the device
    pub line: i64,
    /// Lines received on this connection
    pub lines: u64,
    /// Last line number assigned by the checksum framer
    pub lineno: u64,
}

impl DeviceInfo {
    fn new(name: String, uuid: String, mode: DeviceMode, version: String) -> Self {
        let axes = |v: f64| {
            ["X", "Y", "Z"]
                .iter()
                .map(|a| (a.to_string(), v))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            addr: Vec::new(),
            port: 0,
            name,
            uuid,
            mode,
            grbl: false,
            version,
            firm: FirmwareInfo::default(),
            min: axes(0.0),
            max: axes(300.0),
            ready: false,
            boot: 0,
            connect: 0,
            close: 0,
            line: 0,
            lines: 0,
            lineno: 0,
        }
    }
}

/// Last device-reported error
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Time of the last error
    pub time: i64,
    /// Error text after the marker
    pub cause: Option<String>,
    /// Errors seen since start
    pub count: u64,
}

/// Job bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintStatus {
    /// Job running
    pub run: bool,
    /// Job paused
    pub pause: bool,
    /// Reason given for the pause
    pub pause_reason: Option<String>,
    /// Job was aborted
    pub abort: bool,
    /// Job was cancelled
    pub cancel: bool,
    /// Bed marked clear
    pub clear: bool,
    /// Job file
    pub filename: Option<String>,
    /// Output directory for job artifacts
    pub outdir: Option<String>,
    /// Output artifact sequence
    pub outseq: u32,
    /// 0-100 progress
    pub progress: f64,
    /// Time the job file started (before the body)
    pub prep: i64,
    /// Time the job started
    pub start: i64,
    /// Time of the last line handed to the device
    pub mark: i64,
    /// Time the job finished
    pub end: i64,
    /// Filament extruded in this job (mm)
    pub emit: f64,
}

/// Temperatures for the bed and each extruder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Temperatures {
    /// Heated bed
    pub bed: Option<f64>,
    /// Extruders by index
    pub ext: Vec<Option<f64>>,
}

impl Default for Temperatures {
    fn default() -> Self {
        Self {
            bed: None,
            ext: vec![None],
        }
    }
}

impl Temperatures {
    /// Set one extruder, growing the list as needed
    pub fn set_extruder(&mut self, index: usize, value: Option<f64>) {
        if self.ext.len() <= index {
            self.ext.resize(index + 1, None);
        }
        self.ext[index] = value;
    }
}

/// A saved position on the push/pop stack
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavedPosition {
    /// X
    pub x: f64,
    /// Y
    pub y: f64,
    /// Z
    pub z: f64,
    /// Feed rate, if one was known
    pub f: Option<f64>,
}

/// Commanded tool position
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionState {
    /// X
    pub x: f64,
    /// Y
    pub y: f64,
    /// Z
    pub z: f64,
    /// Extruder
    pub e: f64,
    /// Last commanded feed rate
    pub f: Option<f64>,
    /// Relative moves (G91)
    pub rel: bool,
    /// Saved positions
    pub stack: Vec<SavedPosition>,
}

impl PositionState {
    /// Current XYZ and feed as a stack entry
    pub fn save(&self) -> SavedPosition {
        SavedPosition {
            x: self.x,
            y: self.y,
            z: self.z,
            f: self.f,
        }
    }

    /// Mutable slot for an axis letter
    pub fn axis_mut(&mut self, axis: char) -> Option<&mut f64> {
        match axis.to_ascii_uppercase() {
            'X' => Some(&mut self.x),
            'Y' => Some(&mut self.y),
            'Z' => Some(&mut self.z),
            'E' => Some(&mut self.e),
            _ => None,
        }
    }
}

/// Raw GRBL report fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrblReport {
    /// Machine state word (Idle, Run, Hold...)
    pub state: Option<String>,
    /// Work coordinate offset
    pub wco: [f64; 3],
    /// Machine position
    pub pos: [f64; 3],
}

/// Endstop trigger text
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endstops {
    /// Minimum endstops by axis
    pub min: BTreeMap<String, String>,
    /// Maximum endstops by axis
    pub max: BTreeMap<String, String>,
    /// Filament sensor text
    pub filament: Option<String>,
}

/// Full device status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Snapshot time
    pub now: i64,
    /// Current phase
    pub state: MachineState,
    /// Client counts
    pub clients: ClientCounts,
    /// Pipeline counters
    pub buffer: BufferStatus,
    /// Runtime flags
    pub flags: RuntimeFlags,
    /// Device identity
    pub device: DeviceInfo,
    /// Last error
    pub error: ErrorInfo,
    /// Job state
    pub print: PrintStatus,
    /// Target temperatures
    pub target: Temperatures,
    /// Measured temperatures
    pub temp: Temperatures,
    /// Position model
    pub pos: PositionState,
    /// GRBL raw report
    pub grbl: GrblReport,
    /// Feed scale factor
    pub feed: f64,
    /// Endstops
    pub estop: Endstops,
    /// Settings echoed by the firmware, by command code
    pub settings: BTreeMap<String, BTreeMap<String, f64>>,
    /// Dirty flag for the status push
    #[serde(skip)]
    pub update: bool,
}

impl DeviceStatus {
    /// Create a fresh status record
    pub fn new(
        name: impl Into<String>,
        uuid: impl Into<String>,
        mode: DeviceMode,
        version: impl Into<String>,
    ) -> Self {
        Self {
            now: 0,
            state: MachineState::NoDevice,
            clients: ClientCounts::default(),
            buffer: BufferStatus::default(),
            flags: RuntimeFlags::default(),
            device: DeviceInfo::new(name.into(), uuid.into(), mode, version.into()),
            error: ErrorInfo::default(),
            print: PrintStatus::default(),
            target: Temperatures::default(),
            temp: Temperatures::default(),
            pos: PositionState::default(),
            grbl: GrblReport::default(),
            feed: 1.0,
            estop: Endstops::default(),
            settings: BTreeMap::new(),
            update: false,
        }
    }

    /// Mark the record as changed
    pub fn mark_dirty(&mut self) {
        self.update = true;
    }

    /// Return and clear the dirty flag
    pub fn take_update(&mut self) -> bool {
        std::mem::take(&mut self.update)
    }

    /// Merge settings for one command code. Existing keys are overwritten,
    /// other keys are kept.
    pub fn merge_settings<I>(&mut self, code: &str, values: I)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let entry = self.settings.entry(code.to_string()).or_default();
        entry.extend(values);
        self.update = true;
    }

    /// Serialize a snapshot, stamping `now`
    pub fn snapshot_json(&mut self, pretty: bool) -> crate::Result<String> {
        self.now = epoch_ms();
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }
}
