//! # gridlink core
//!
//! Shared types for the gridlink controller: the device status model, the
//! error taxonomy and the client fan-out hub.

pub mod error;
pub mod hub;
pub mod status;

pub use error::{CommandError, ConnectionError, Error, FirmwareError, JobError, Result};

pub use hub::{ClientHub, ClientId, ClientInterest, ClientKind, EmitFlags, Emission};

pub use status::{
    epoch_ms, BufferStatus, DeviceInfo, DeviceMode, DeviceStatus, MachineState, PositionState,
    PrintStatus, SavedPosition,
};
