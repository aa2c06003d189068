//! Phoenix channels multiplexed over one [`Socket`](crate::Socket).
//!
//! Each channel tracks its join generation (`join_ref`) and a map of
//! in-flight requests keyed by `ref`. A reply resolves a request only when
//! both its ref and its join generation match.

mod handle;
mod types;

pub use self::handle::{Channel, PendingReply};
pub use self::types::{ChannelSignal, ChannelState, JoinedReply, Reply, Subscription};
