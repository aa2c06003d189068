pub mod errors;
pub mod id;

pub use errors::{ConfigError, RealtimeError, SensorLinkError};
pub use id::{new_id, ClientId, RefCounter};

pub type Result<T> = std::result::Result<T, SensorLinkError>;
