//! Emission and client interest types.

use uuid::Uuid;

/// Handle for a registered client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client({})", &self.0.to_string()[..8])
    }
}

/// Where a client is connected from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Local stdin / stdout console
    Console,
    /// Raw TCP control port
    Net,
}

/// Per-client delivery preferences
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInterest {
    /// Console clients never receive unaddressed file listings
    pub console: bool,
    /// Receive all plain output (events, command echo)
    pub monitoring: bool,
    /// One-shot: deliver the next status snapshot
    pub request_status: bool,
    /// One-shot: deliver the next file listing
    pub request_list: bool,
    /// Deliver every pushed status snapshot
    pub watch_status: bool,
}

/// Classification of an emission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitFlags {
    /// Delivered to everyone
    pub error: bool,
    /// Status snapshot
    pub status: bool,
    /// File listing
    pub list: bool,
}

/// One line of output for clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Text without trailing newline
    pub line: String,
    /// Classification
    pub flags: EmitFlags,
    /// Originating client, if the output is a reply
    pub channel: Option<ClientId>,
}

impl Emission {
    /// Plain output line
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            flags: EmitFlags::default(),
            channel: None,
        }
    }

    /// User-facing event line, framed as `*** msg ***`
    pub fn event(msg: impl AsRef<str>) -> Self {
        Self::plain(format!("*** {} ***", msg.as_ref()))
    }

    /// Status snapshot
    pub fn status(json: impl Into<String>) -> Self {
        Self {
            flags: EmitFlags {
                status: true,
                ..Default::default()
            },
            ..Self::plain(json)
        }
    }

    /// File listing
    pub fn list(json: impl Into<String>) -> Self {
        Self {
            flags: EmitFlags {
                list: true,
                ..Default::default()
            },
            ..Self::plain(json)
        }
    }

    /// Error line, delivered to every client
    pub fn error(line: impl Into<String>) -> Self {
        Self {
            flags: EmitFlags {
                error: true,
                ..Default::default()
            },
            ..Self::plain(line)
        }
    }

    /// Address to a single client
    pub fn to(mut self, channel: Option<ClientId>) -> Self {
        self.channel = channel;
        self
    }

    /// Whether a client with the given interest receives this emission.
    pub fn wanted_by(&self, id: ClientId, interest: &ClientInterest) -> bool {
        self.flags.error
            || self.channel == Some(id)
            || self.wants_status(interest)
            || self.wants_list(interest)
            || (interest.monitoring && !self.flags.status && !self.flags.list)
    }

    pub(crate) fn wants_status(&self, interest: &ClientInterest) -> bool {
        self.flags.status && (interest.request_status || interest.watch_status)
    }

    pub(crate) fn wants_list(&self, interest: &ClientInterest) -> bool {
        self.flags.list
            && (interest.request_list || (self.channel.is_none() && !interest.console))
    }
}
