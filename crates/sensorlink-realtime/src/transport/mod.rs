//! WebSocket transport: framing, heartbeat, and reconnect with backoff.
//!
//! The transport knows nothing about channels. It delivers decoded
//! [`Envelope`]s for every topic except `phoenix` and reports state changes.

mod backoff;
mod connection;
mod envelope;
mod socket;
mod types;

pub use backoff::Backoff;
pub use envelope::{Envelope, Serializer};
pub use socket::{Socket, Transport};
pub use types::{ConnectionState, SocketConfig, TransportEvent};
