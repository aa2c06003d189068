use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Monotonically increasing source of Phoenix `ref` values.
///
/// One counter per connection; clones share the same sequence. Refs are
/// never reused, including across reconnects.
#[derive(Debug, Clone)]
pub struct RefCounter(Arc<AtomicU64>);

impl RefCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next(&self) -> String {
        self.0.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// The value the next call to [`RefCounter::next`] will hand out.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one client instance in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(new_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
