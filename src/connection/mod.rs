//! Push connection to the server.
//!
//! A single duplex connection per session delivers change notifications.
//! [`ConnectionManager`] registers the signed-in user on every open, decodes
//! inbound frames into [`SyncEvent`](crate::events::SyncEvent)s and
//! reconnects with a bounded, linearly growing delay.

mod manager;
mod protocol;
mod transport;

pub use manager::{ConnectionManager, ConnectionState, ConnectionStats, ReconnectPolicy};
pub use protocol::{parse_message, register_message, RegisterMessage};
pub use transport::{Channel, Connector, WsConnector};
