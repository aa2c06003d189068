use async_trait::async_trait;

use sensorlink_common::RealtimeError;

use crate::channel::Channel;
use crate::protocol::{events, Measurement, MeasurementBatch};

/// Where a stream's measurements go when flushed.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn send_measurement(&self, measurement: Measurement) -> Result<(), RealtimeError>;

    async fn send_batch(&self, measurements: Vec<Measurement>) -> Result<(), RealtimeError>;
}

/// Measurements are fire-and-forget pushes: the write must succeed, the
/// server's reply is not awaited.
#[async_trait]
impl MeasurementSink for Channel {
    async fn send_measurement(&self, measurement: Measurement) -> Result<(), RealtimeError> {
        let payload = serde_json::to_value(&measurement)
            .map_err(|e| RealtimeError::Decode(e.to_string()))?;
        self.push(events::MEASUREMENT, payload).await.map(drop)
    }

    async fn send_batch(&self, measurements: Vec<Measurement>) -> Result<(), RealtimeError> {
        let payload = serde_json::to_value(MeasurementBatch { measurements })
            .map_err(|e| RealtimeError::Decode(e.to_string()))?;
        self.push(events::MEASUREMENT_BATCH, payload).await.map(drop)
    }
}
