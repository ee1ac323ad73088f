//! gridlink settings crate
//!
//! Handles controller configuration: TOML loading, the JSON override file
//! written by clients, and per-mode command sequence defaults.

pub mod config;
pub mod error;

pub use config::{default_macros, Config, EventSequences, FlasherSettings};
pub use error::{ConfigError, ConfigResult};
