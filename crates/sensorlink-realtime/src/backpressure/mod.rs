//! Adaptive batching of outbound measurements.
//!
//! The server tells us how closely a stream is being watched through
//! `backpressure_config`. High attention sends every sample as it comes;
//! lower levels trade latency for fewer, larger `measurement_batch` pushes.

mod controller;
mod sink;
mod types;

pub use controller::{BackpressureController, DEFAULT_MAX_BUFFERED};
pub use sink::MeasurementSink;
pub use types::BackpressureConfig;

#[cfg(test)]
mod tests;
