//! Client hub implementation.
//!
//! Holds the registered clients and their outbound channels and applies the
//! delivery rule for each published [`Emission`].

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::events::{ClientId, ClientInterest, ClientKind, Emission};

/// Receiving half handed to a client's writer task
pub type ClientReceiver = mpsc::UnboundedReceiver<String>;

struct ClientEntry {
    kind: ClientKind,
    interest: ClientInterest,
    sender: mpsc::UnboundedSender<String>,
}

/// Registry of connected clients
pub struct ClientHub {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
}

impl ClientHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a client. Console clients start with `console` and
    /// `monitoring` set.
    pub fn register(&self, kind: ClientKind) -> (ClientId, ClientReceiver) {
        let id = ClientId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let console = kind == ClientKind::Console;
        let interest = ClientInterest {
            console,
            monitoring: console,
            ..Default::default()
        };
        self.clients.write().insert(
            id,
            ClientEntry {
                kind,
                interest,
                sender,
            },
        );
        tracing::debug!("{} registered ({:?})", id, kind);
        (id, receiver)
    }

    /// Remove a client. Returns true if it was registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id).is_some();
        if removed {
            tracing::debug!("{} removed", id);
        }
        removed
    }

    /// Number of registered clients of a kind
    pub fn count(&self, kind: ClientKind) -> usize {
        self.clients
            .read()
            .values()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// Total registered clients
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// True when no clients are registered
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Current interest flags of a client
    pub fn interest(&self, id: ClientId) -> Option<ClientInterest> {
        self.clients.read().get(&id).map(|c| c.interest.clone())
    }

    /// Modify a client's interest flags
    pub fn update_interest<F>(&self, id: ClientId, f: F) -> bool
    where
        F: FnOnce(&mut ClientInterest),
    {
        match self.clients.write().get_mut(&id) {
            Some(entry) => {
                f(&mut entry.interest);
                true
            }
            None => false,
        }
    }

    /// Toggle monitoring mode
    pub fn set_monitoring(&self, id: ClientId, on: bool) -> bool {
        self.update_interest(id, |i| i.monitoring = on)
    }

    /// Toggle persistent status delivery
    pub fn set_watch_status(&self, id: ClientId, on: bool) -> bool {
        self.update_interest(id, |i| i.watch_status = on)
    }

    /// Ask for the next status snapshot
    pub fn request_status(&self, id: ClientId) -> bool {
        self.update_interest(id, |i| i.request_status = true)
    }

    /// Ask for the next file listing
    pub fn request_list(&self, id: ClientId) -> bool {
        self.update_interest(id, |i| i.request_list = true)
    }

    /// Send a line to exactly one client, bypassing the delivery rule
    pub fn send_to(&self, id: ClientId, line: impl Into<String>) -> bool {
        match self.clients.read().get(&id) {
            Some(entry) => entry.sender.send(line.into()).is_ok(),
            None => false,
        }
    }

    /// Deliver an emission to every interested client.
    ///
    /// One-shot status and list requests are cleared on the clients that
    /// received them. Clients whose receiver is gone are dropped. Returns the
    /// number of clients the line was delivered to.
    pub fn publish(&self, emission: Emission) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let mut clients = self.clients.write();
            for (id, entry) in clients.iter_mut() {
                if !emission.wanted_by(*id, &entry.interest) {
                    continue;
                }
                if emission.wants_status(&entry.interest) {
                    entry.interest.request_status = false;
                }
                if emission.wants_list(&entry.interest) {
                    entry.interest.request_list = false;
                }
                if entry.sender.send(emission.line.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
            for id in &dead {
                clients.remove(id);
            }
        }
        for id in dead {
            tracing::debug!("{} dropped (receiver closed)", id);
        }
        delivered
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHub")
            .field("clients", &self.len())
            .finish()
    }
}
