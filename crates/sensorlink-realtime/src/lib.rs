//! Phoenix Channels client for sensor telemetry.
//!
//! One multiplexed WebSocket carries every topic. The [`Socket`] owns the
//! connection, heartbeat, and reconnect backoff; a [`Channel`] per topic
//! owns join/leave and reply correlation; [`Presence`] converges membership
//! from `presence_state`/`presence_diff`; the [`BackpressureController`]
//! batches outbound measurements according to server-declared attention.
//! [`Client`] ties them together behind one connect/join/send/event API.

pub mod backpressure;
pub mod channel;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod transport;

pub use backpressure::{BackpressureConfig, BackpressureController, MeasurementSink};
pub use channel::{
    Channel, ChannelSignal, ChannelState, JoinedReply, PendingReply, Reply, Subscription,
};
pub use client::{Client, ClientConfig, ClientEvent};
pub use presence::{Presence, PresenceChange, PresenceChangeKind, PresenceState};
pub use protocol::{AttentionLevel, Measurement};
pub use transport::{
    Backoff, ConnectionState, Envelope, Serializer, Socket, SocketConfig, Transport,
    TransportEvent,
};

pub use sensorlink_common::RealtimeError;
