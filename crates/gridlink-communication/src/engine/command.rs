//! Outbound command records

use gridlink_core::ClientId;

/// Work to perform when a command is acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionAction {
    /// `M117 Start` reached the device: the job body begins
    JobBodyStart,
    /// `M20` finished: publish the collected SD listing
    ListSd {
        /// Client that asked for the listing
        channel: Option<ClientId>,
    },
}

/// Per-command metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Jump ahead of non-priority pending commands
    pub priority: bool,
    /// Frame with line number and checksum
    pub checksum: bool,
    /// Job content
    pub print: bool,
    /// Internal housekeeping, not echoed
    pub system: bool,
    /// May run while the queue is paused
    pub onpause: bool,
    /// Client the command came from
    pub channel: Option<ClientId>,
    /// Line number assigned at transmission
    pub lineno: Option<u64>,
    /// Action to run on acknowledgment
    pub completion: Option<CompletionAction>,
}

impl CommandFlags {
    /// Priority command on behalf of a client
    pub fn priority(channel: Option<ClientId>) -> Self {
        Self {
            priority: true,
            channel,
            ..Default::default()
        }
    }

    /// Job content line
    pub fn job() -> Self {
        Self {
            print: true,
            checksum: true,
            ..Default::default()
        }
    }

    /// Housekeeping command
    pub fn system() -> Self {
        Self {
            system: true,
            ..Default::default()
        }
    }
}

/// A queued, in-flight or replayable command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Command text without framing
    pub line: String,
    /// Metadata
    pub flags: CommandFlags,
}

impl CommandRecord {
    /// Create a record
    pub fn new(line: impl Into<String>, flags: CommandFlags) -> Self {
        Self {
            line: line.into(),
            flags,
        }
    }
}
