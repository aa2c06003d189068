use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use sensorlink_common::RealtimeError;

use super::*;
use crate::protocol::{AttentionLevel, Measurement};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct RecordingSink {
    batches: mpsc::UnboundedSender<(Instant, Vec<Measurement>)>,
    singles: mpsc::UnboundedSender<Measurement>,
    failing: AtomicBool,
}

#[async_trait]
impl MeasurementSink for RecordingSink {
    async fn send_measurement(&self, measurement: Measurement) -> Result<(), RealtimeError> {
        let _ = self.singles.send(measurement);
        Ok(())
    }

    async fn send_batch(&self, measurements: Vec<Measurement>) -> Result<(), RealtimeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RealtimeError::NotConnected);
        }
        let _ = self.batches.send((Instant::now(), measurements));
        Ok(())
    }
}

struct Harness {
    controller: BackpressureController,
    sink: Arc<RecordingSink>,
    batches: mpsc::UnboundedReceiver<(Instant, Vec<Measurement>)>,
    singles: mpsc::UnboundedReceiver<Measurement>,
}

fn harness(max_buffered: usize) -> Harness {
    let (batch_tx, batches) = mpsc::unbounded_channel();
    let (single_tx, singles) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        batches: batch_tx,
        singles: single_tx,
        failing: AtomicBool::new(false),
    });
    let controller = BackpressureController::new(BackpressureConfig::default(), max_buffered);
    controller.register("s1", sink.clone());
    Harness {
        controller,
        sink,
        batches,
        singles,
    }
}

fn config(level: AttentionLevel, window_ms: u64, size: usize) -> BackpressureConfig {
    BackpressureConfig {
        attention_level: level,
        batch_window: Duration::from_millis(window_ms),
        batch_size: size,
    }
}

fn attrs(batch: &[Measurement]) -> Vec<&str> {
    batch.iter().map(|m| m.attribute_id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Flush triggers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_size_one_flushes_every_entry() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    for attr in ["a", "b", "c"] {
        h.controller.buffer("s1", attr, json!(1)).await.unwrap();
        let (_, batch) = h.batches.try_recv().expect("flushed before buffer returned");
        assert_eq!(attrs(&batch), vec![attr]);
    }
    assert_eq!(h.controller.buffered_len("s1"), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_window_flushes_synchronously() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Low, 0, 10))
        .unwrap();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();
    let (_, batch) = h.batches.try_recv().expect("flushed before buffer returned");
    assert_eq!(attrs(&batch), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn window_flushes_in_insertion_order() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Medium, 500, 5))
        .unwrap();

    let start = Instant::now();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.controller.buffer("s1", "b", json!(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.controller.buffer("s1", "c", json!(3)).await.unwrap();
    assert!(h.batches.try_recv().is_err());

    let (at, batch) = h.batches.recv().await.unwrap();
    let elapsed = at - start;
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(510), "{elapsed:?}");
    assert_eq!(attrs(&batch), vec!["a", "b", "c"]);
    assert_eq!(h.controller.buffered_len("s1"), 0);
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_before_window() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Low, 2_000, 3))
        .unwrap();
    for attr in ["a", "b", "c", "d"] {
        h.controller.buffer("s1", attr, json!(0)).await.unwrap();
    }
    let (_, batch) = h.batches.try_recv().unwrap();
    assert_eq!(attrs(&batch), vec!["a", "b", "c"]);
    assert_eq!(h.controller.buffered_len("s1"), 1);
}

// ---------------------------------------------------------------------------
// Config changes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn attention_high_none_high_flushes_promptly() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    let start = Instant::now();
    h.controller
        .set_config("s1", BackpressureConfig::for_level(AttentionLevel::None))
        .unwrap();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(h.batches.try_recv().is_err());

    h.controller
        .set_config("s1", BackpressureConfig::for_level(AttentionLevel::High))
        .unwrap();
    let (at, batch) = h.batches.recv().await.unwrap();
    assert!(at - start <= Duration::from_millis(5_000));
    assert!(at - start >= Duration::from_millis(1_000));
    assert_eq!(attrs(&batch), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn new_window_counts_from_oldest_entry() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Medium, 500, 5))
        .unwrap();
    let start = Instant::now();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.controller
        .set_config("s1", config(AttentionLevel::Low, 2_000, 10))
        .unwrap();

    let (at, _) = h.batches.recv().await.unwrap();
    let elapsed = at - start;
    assert!(elapsed >= Duration::from_millis(2_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_300), "{elapsed:?}");
}

#[test]
fn config_for_unknown_stream_is_rejected() {
    let controller = BackpressureController::default();
    let err = controller
        .set_config("ghost", BackpressureConfig::default())
        .unwrap_err();
    assert!(matches!(err, RealtimeError::UnknownStream(s) if s == "ghost"));
    assert!(controller.config("ghost").is_none());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_flush_keeps_entries_in_order() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Medium, 1_000, 2))
        .unwrap();
    h.sink.failing.store(true, Ordering::SeqCst);

    h.controller.buffer("s1", "a", json!(1)).await.unwrap();
    let err = h.controller.buffer("s1", "b", json!(2)).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotConnected));
    assert_eq!(h.controller.buffered_len("s1"), 2);

    h.sink.failing.store(false, Ordering::SeqCst);
    h.controller.buffer("s1", "c", json!(3)).await.unwrap();
    let (_, batch) = h.batches.try_recv().unwrap();
    assert_eq!(attrs(&batch), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_retries_after_window() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Medium, 500, 1))
        .unwrap();
    h.sink.failing.store(true, Ordering::SeqCst);
    assert!(h.controller.buffer("s1", "a", json!(1)).await.is_err());

    h.sink.failing.store(false, Ordering::SeqCst);
    let (_, batch) = h.batches.recv().await.unwrap();
    assert_eq!(attrs(&batch), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn overflow_drops_oldest() {
    let h = harness(3);
    h.controller
        .set_config("s1", config(AttentionLevel::None, 10_000, 100))
        .unwrap();
    for attr in ["a", "b", "c"] {
        h.controller.buffer("s1", attr, json!(0)).await.unwrap();
    }
    let err = h.controller.buffer("s1", "d", json!(0)).await.unwrap_err();
    assert!(matches!(err, RealtimeError::BufferOverflow { dropped: 1, .. }));

    let left = h.controller.unregister("s1");
    assert_eq!(attrs(&left), vec!["b", "c", "d"]);
}

#[tokio::test]
async fn unknown_stream_is_rejected() {
    let controller = BackpressureController::default();
    let err = controller.buffer("ghost", "a", json!(1)).await.unwrap_err();
    assert!(matches!(err, RealtimeError::UnknownStream(_)));
    assert!(matches!(
        controller.flush("ghost").await,
        Err(RealtimeError::UnknownStream(_))
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_stops_timers_but_keeps_buffers() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Medium, 500, 5))
        .unwrap();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();
    h.controller.shutdown();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.batches.try_recv().is_err());
    assert_eq!(h.controller.buffered_len("s1"), 1);

    h.controller.rearm_all();
    let (_, batch) = h.batches.recv().await.unwrap();
    assert_eq!(attrs(&batch), vec!["a"]);
}

#[tokio::test]
async fn send_bypasses_buffer() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Low, 2_000, 10))
        .unwrap();
    h.controller.send("s1", "speed", json!(42)).await.unwrap();
    let m = h.singles.try_recv().unwrap();
    assert_eq!(m.attribute_id, "speed");
    assert_eq!(m.payload, json!(42));
    assert_eq!(h.controller.buffered_len("s1"), 0);
}

#[tokio::test]
async fn flush_of_empty_buffer_sends_nothing() {
    let mut h = harness(DEFAULT_MAX_BUFFERED);
    assert_eq!(h.controller.flush("s1").await.unwrap(), 0);
    assert!(h.batches.try_recv().is_err());
}

#[tokio::test]
async fn reregister_keeps_buffer() {
    let h = harness(DEFAULT_MAX_BUFFERED);
    h.controller
        .set_config("s1", config(AttentionLevel::Low, 2_000, 10))
        .unwrap();
    h.controller.buffer("s1", "a", json!(1)).await.unwrap();
    h.controller.register("s1", h.sink.clone());
    assert_eq!(h.controller.buffered_len("s1"), 1);
    assert_eq!(
        h.controller.config("s1").unwrap().attention_level,
        AttentionLevel::Low
    );
}
