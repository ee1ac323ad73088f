//! # gridlink
//!
//! Headless controller for Marlin and GRBL style firmware. It owns a serial
//! or TCP connection to one device, streams G-code jobs with flow control and
//! checksum resend recovery, and fans status out to local and network
//! clients.
//!
//! ## Architecture
//!
//! gridlink is organized as a workspace with multiple crates:
//!
//! 1. **gridlink-core** - Device status model, error taxonomy, client hub
//! 2. **gridlink-communication** - Transports, wire protocol, controller engine
//! 3. **gridlink-settings** - Configuration files and overrides
//! 4. **gridlink** - Main binary: event loop and client front ends

pub mod clients;
pub mod runtime;

pub use gridlink_communication::{Controller, DeviceIdentity, EngineRequest};
pub use gridlink_core::{ClientHub, DeviceStatus, Error, Result};
pub use gridlink_settings::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Sets up structured logging with:
/// - RUST_LOG environment variable support, `info` by default
/// - `-v` raising the level to debug and `-vv` to trace
/// - Log output on stderr so stdout stays free for the console client
pub fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_line_number(verbosity > 0);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
