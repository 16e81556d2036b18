//! Multi-peer presence and task sync.
//!
//! Peers share one storage origin and, when available, a named broadcast
//! channel. There is no server and no cross-peer ordering: the last
//! observed write for a task wins.
//!
//! - [`protocol`]: message envelope and typed built-in events
//! - [`transport`]: channel and storage transports behind one trait
//! - [`presence`]: roster, heartbeats and dispatch to the host

pub mod presence;
pub mod protocol;
pub mod transport;

pub use presence::{generate_peer_id, MessageHandler, PresenceSync, SyncHandler};
pub use protocol::{SyncEvent, SyncMessage};
pub use transport::{open_transport, BroadcastHub, ChannelTransport, StorageTransport, Transport, TransportKind};
