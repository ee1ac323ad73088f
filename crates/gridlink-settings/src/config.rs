//! Controller configuration
//!
//! Configuration is read from a TOML file, then a JSON override file (written
//! by the `*set-config` client directive) is merged over it key by key.
//! Command-line flags are applied last by the binary.
//!
//! Command sequences that run on boot, abort, error, pause and resume default
//! per machine mode when they are not configured.

use crate::error::{ConfigError, ConfigResult};
use gridlink_core::DeviceMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const BOOT_FDM: &[&str] = &["M29", "M110 N0", "M115", "M211", "M119", "M114"];
const BOOT_CNC: &[&str] = &["G21", "G90", "G92 X0 Y0 Z0"];
const ABORT_FDM: &[&str] = &[
    "G21",
    "G90",
    "G92 X0 Y0 Z0 E0",
    "M104 S0 T0",
    "M140 S0 T0",
    "M107",
    "G91",
    "G0 Z10 X0 Y0",
    "G28 X0 Y0",
    "G90",
    "M84",
];
const ABORT_CNC: &[&str] = &["G21", "G90", "G92 X0 Y0 Z0", "M84"];

fn owned(cmds: &[&str]) -> Vec<String> {
    cmds.iter().map(|c| c.to_string()).collect()
}

/// Built-in macros, name to `;`-separated commands
pub fn default_macros() -> BTreeMap<String, String> {
    [
        ("eeprom save", "M500"),
        ("eeprom load", "M501; M503"),
        ("endstop update", "M119"),
        ("axes position", "M114"),
        ("nozzle pid", "M303 S220 C8 U1 E0"),
        ("bed probe", "G29 P1; G29 T"),
        ("ctrl restart", "*exit"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Command sequences for controller events. `None` means the mode default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSequences {
    /// Run once per connection after quiescence
    pub boot: Option<Vec<String>>,
    /// Queued on cancel, and used as the next boot sequence after abort
    pub abort: Option<Vec<String>>,
    /// Next boot sequence after a device error when recovery is enabled
    pub error: Option<Vec<String>>,
    /// Run when the pipeline drains after a pause
    pub pause: Option<Vec<String>>,
    /// Priority-queued on resume
    pub resume: Option<Vec<String>>,
}

/// External firmware flasher invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherSettings {
    /// Program to spawn
    pub program: String,
    /// Arguments; `{port}` and `{image}` are substituted
    pub args: Vec<String>,
}

impl Default for FlasherSettings {
    fn default() -> Self {
        Self {
            program: "avrdude".to_string(),
            args: owned(&[
                "-patmega2560",
                "-cwiring",
                "-P{port}",
                "-b115200",
                "-D",
                "-Uflash:w:{image}:i",
            ]),
        }
    }
}

impl FlasherSettings {
    /// Argument list with placeholders filled in
    pub fn args_for(&self, port: &str, image: &Path) -> Vec<String> {
        let image = image.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{port}", port).replace("{image}", &image))
            .collect()
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device path, or `host:port` for a networked device
    pub port: Option<String>,
    /// Serial baud rate
    pub baud: u32,
    /// Machine family
    pub mode: DeviceMode,
    /// Force GRBL protocol handling
    pub grbl: bool,
    /// Unacknowledged command ceiling; mode default when unset
    pub max_outstanding: Option<usize>,
    /// Checksum every transmitted command
    pub checksum: bool,
    /// Close the transport and run the error sequence on device errors
    pub recover_on_error: bool,
    /// Exit the process on device errors
    pub fragile: bool,
    /// Expect an acknowledgment for every transmitted line
    pub match_all: bool,
    /// Verbose wire echo to clients
    pub debug: bool,
    /// Echo job lines to clients
    pub verbose: bool,
    /// Extrusion enabled
    pub extrude: bool,
    /// Spool jobs to device storage instead of streaming
    pub sd_spool: bool,
    /// Display name; host name when unset
    pub name: Option<String>,
    /// Job file directory
    pub file_dir: PathBuf,
    /// Firmware image directory; `file_dir` when unset
    pub firmware_dir: Option<PathBuf>,
    /// Control port for raw TCP clients
    pub listen: Option<u16>,
    /// Accept commands on stdin
    pub stdin: bool,
    /// Marker file present while the bed is clear
    pub bed_clear_marker: PathBuf,
    /// File holding the persistent controller id
    pub uuid_file: PathBuf,
    /// JSON override file written by `*set-config`
    pub override_file: PathBuf,
    /// Firmware flasher
    pub flasher: FlasherSettings,
    /// Event command sequences
    pub on: EventSequences,
    /// Named macros
    pub macros: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baud: 250_000,
            mode: DeviceMode::Fdm,
            grbl: false,
            max_outstanding: None,
            checksum: false,
            recover_on_error: false,
            fragile: false,
            match_all: false,
            debug: false,
            verbose: false,
            extrude: true,
            sd_spool: false,
            name: None,
            file_dir: PathBuf::from("tmp"),
            firmware_dir: None,
            listen: None,
            stdin: false,
            bed_clear_marker: PathBuf::from("etc/bedclear"),
            uuid_file: PathBuf::from("etc/uuid"),
            override_file: PathBuf::from("etc/gridlink.json"),
            flasher: FlasherSettings::default(),
            on: EventSequences::default(),
            macros: default_macros(),
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform config location, e.g. `~/.config/gridlink/gridlink.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gridlink").join("gridlink.toml"))
    }

    /// Load config from a TOML or JSON file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("none").to_string(),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the base file (if any), then merge the override file named by
    /// the result (if it exists).
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        let override_file = base.override_file.clone();
        if override_file.exists() {
            let content = std::fs::read_to_string(&override_file)?;
            let overrides: Value = serde_json::from_str(&content)?;
            tracing::debug!("applying config overrides from {}", override_file.display());
            return base.merged(&overrides);
        }
        Ok(base)
    }

    /// Save config to a TOML or JSON file
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        self.validate()?;
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            Some("json") => serde_json::to_string_pretty(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("none").to_string(),
                ))
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.baud == 0 {
            return Err(ConfigError::invalid("baud", "must be > 0"));
        }
        if self.max_outstanding == Some(0) {
            return Err(ConfigError::invalid("max_outstanding", "must be > 0"));
        }
        if self.flasher.program.trim().is_empty() {
            return Err(ConfigError::invalid("flasher.program", "must not be empty"));
        }
        Ok(())
    }

    /// Return a copy with the top-level keys of `overrides` replacing ours.
    pub fn merged(&self, overrides: &Value) -> ConfigResult<Self> {
        let Value::Object(over) = overrides else {
            return Err(ConfigError::invalid("overrides", "expected a JSON object"));
        };
        let mut base = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in over {
            base.insert(key.clone(), value.clone());
        }
        let config: Self = serde_json::from_value(Value::Object(base))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge new keys into the persisted override file and return the
    /// resulting config. Existing override keys not named are kept.
    pub fn apply_overrides(&self, overrides: &Value) -> ConfigResult<Self> {
        let Value::Object(new_keys) = overrides else {
            return Err(ConfigError::invalid("overrides", "expected a JSON object"));
        };
        let mut stored = if self.override_file.exists() {
            match serde_json::from_str(&std::fs::read_to_string(&self.override_file)?)? {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        } else {
            Map::new()
        };
        for (key, value) in new_keys {
            stored.insert(key.clone(), value.clone());
        }
        let stored = Value::Object(stored);
        let config = self.merged(&stored)?;
        if let Some(parent) = self
            .override_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.override_file, serde_json::to_string_pretty(&stored)?)?;
        Ok(config)
    }

    /// Effective unacknowledged command ceiling
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
            .unwrap_or_else(|| self.mode.default_max_outstanding())
    }

    /// Effective firmware directory
    pub fn firmware_dir(&self) -> PathBuf {
        self.firmware_dir
            .clone()
            .unwrap_or_else(|| self.file_dir.clone())
    }

    /// Boot sequence for the configured mode
    pub fn boot_sequence(&self) -> Vec<String> {
        self.on.boot.clone().unwrap_or_else(|| match self.mode {
            DeviceMode::Fdm => owned(BOOT_FDM),
            DeviceMode::Cnc => owned(BOOT_CNC),
        })
    }

    /// Abort sequence for the configured mode
    pub fn abort_sequence(&self) -> Vec<String> {
        self.on.abort.clone().unwrap_or_else(|| match self.mode {
            DeviceMode::Fdm => owned(ABORT_FDM),
            DeviceMode::Cnc => owned(ABORT_CNC),
        })
    }

    /// Error recovery sequence; the abort sequence when unset
    pub fn error_sequence(&self) -> Vec<String> {
        self.on.error.clone().unwrap_or_else(|| self.abort_sequence())
    }

    /// Pause sequence
    pub fn pause_sequence(&self) -> Vec<String> {
        self.on
            .pause
            .clone()
            .unwrap_or_else(|| vec!["*pos-push".to_string()])
    }

    /// Resume sequence
    pub fn resume_sequence(&self) -> Vec<String> {
        self.on
            .resume
            .clone()
            .unwrap_or_else(|| vec!["*pos-pop".to_string()])
    }

    /// Commands of a named macro
    pub fn macro_commands(&self, name: &str) -> Option<Vec<String>> {
        self.macros.get(name).map(|body| {
            body.split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
    }
}
