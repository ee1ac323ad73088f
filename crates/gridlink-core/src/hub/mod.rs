//! # Client Hub Module
//!
//! Fan-out of controller output to connected clients.
//!
//! ## Overview
//!
//! Every line the controller produces for clients (event lines, command echo,
//! status snapshots, file listings, replies) is published once as an
//! [`Emission`]. The hub decides per client whether to deliver it, based on
//! the client's [`ClientInterest`] and the emission's [`EmitFlags`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gridlink_core::hub::{ClientHub, ClientKind, Emission};
//!
//! let hub = ClientHub::new();
//! let (id, mut rx) = hub.register(ClientKind::Net);
//! hub.set_monitoring(id, true);
//! hub.publish(Emission::event("device ready"));
//! assert_eq!(rx.try_recv().unwrap(), "*** device ready ***");
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
