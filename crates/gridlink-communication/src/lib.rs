//! # gridlink communication
//!
//! Transports to the attached device, wire protocol parsing and the
//! controller engine that drives the command/acknowledgment pipeline.

pub mod communication;
pub mod engine;
pub mod protocol;

pub use communication::{
    line_buffer::LineBuffer,
    memory::{MemoryTransport, WireLog},
    open_transport,
    serial::{list_ports, SerialPortInfo},
    PortSpec, Transport, TransportEvent, TransportEventKind,
};

pub use engine::{
    list_files, replay_set, CommandFlags, CommandRecord, CompletionAction, Controller,
    DeviceIdentity, EngineRequest, FileEntry, ProcessKind, TimerKind, Timing,
};

pub use protocol::{
    checksum::{frame, xor_checksum, LineNumbers},
    grbl_status::{GrblStatus, StatusParser},
    tokenizer::tokenize_line,
};
