//! Per-stream measurement buffering driven by server attention levels.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sensorlink_common::RealtimeError;

use super::sink::MeasurementSink;
use super::types::BackpressureConfig;
use crate::protocol::Measurement;

/// Default retention bound per stream.
pub const DEFAULT_MAX_BUFFERED: usize = 1_000;

struct StreamState {
    config: BackpressureConfig,
    sink: Arc<dyn MeasurementSink>,
    buffer: VecDeque<Measurement>,
    /// When the oldest unflushed entry was enqueued.
    oldest_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl StreamState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

struct Shared {
    streams: Mutex<HashMap<String, StreamState>>,
    default_config: BackpressureConfig,
    max_buffered: usize,
}

/// Buffers outbound measurements per stream and flushes them as batches.
///
/// Safe to call from any task; clones share the same buffers.
#[derive(Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressureConfig::default(), DEFAULT_MAX_BUFFERED)
    }
}

impl BackpressureController {
    pub fn new(default_config: BackpressureConfig, max_buffered: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                default_config,
                max_buffered: max_buffered.max(1),
            }),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.shared.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a stream to its sink. Re-registering swaps the sink and keeps
    /// whatever is buffered.
    pub fn register(&self, stream: &str, sink: Arc<dyn MeasurementSink>) {
        let mut streams = self.streams();
        match streams.get_mut(stream) {
            Some(state) => state.sink = sink,
            None => {
                streams.insert(
                    stream.to_string(),
                    StreamState {
                        config: self.shared.default_config,
                        sink,
                        buffer: VecDeque::new(),
                        oldest_at: None,
                        timer: None,
                        flush_lock: Arc::new(tokio::sync::Mutex::new(())),
                    },
                );
                debug!(stream, "Registered measurement stream");
            }
        }
    }

    /// Detach a stream, returning anything still buffered.
    pub fn unregister(&self, stream: &str) -> Vec<Measurement> {
        match self.streams().remove(stream) {
            Some(mut state) => {
                state.cancel_timer();
                state.buffer.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn config(&self, stream: &str) -> Option<BackpressureConfig> {
        self.streams().get(stream).map(|s| s.config)
    }

    pub fn buffered_len(&self, stream: &str) -> usize {
        self.streams().get(stream).map_or(0, |s| s.buffer.len())
    }

    /// Replace the stream's config. A pending flush is rescheduled against
    /// the new window, measured from the oldest entry's enqueue time.
    pub fn set_config(&self, stream: &str, config: BackpressureConfig) -> Result<(), RealtimeError> {
        let mut streams = self.streams();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| RealtimeError::UnknownStream(stream.to_string()))?;
        info!(
            stream,
            attention = %config.attention_level,
            window_ms = config.batch_window.as_millis() as u64,
            batch_size = config.batch_size,
            "Backpressure config updated"
        );
        state.config = config;
        self.reschedule(stream, state);
        Ok(())
    }

    /// Queue one measurement. Flushes before returning when the batch is
    /// full or the window is zero.
    pub async fn buffer(&self, stream: &str, attribute_id: &str, payload: Value) -> Result<(), RealtimeError> {
        let measurement = Measurement::now(attribute_id, payload);
        let (flush_now, dropped) = {
            let mut streams = self.streams();
            let state = streams
                .get_mut(stream)
                .ok_or_else(|| RealtimeError::UnknownStream(stream.to_string()))?;

            if state.buffer.is_empty() {
                state.oldest_at = Some(Instant::now());
            }
            state.buffer.push_back(measurement);
            let dropped = trim_oldest(&mut state.buffer, self.shared.max_buffered);

            let flush_now = state.buffer.len() >= state.config.batch_size
                || state.config.batch_window.is_zero();
            if !flush_now && !state.timer_armed() {
                self.reschedule(stream, state);
            }
            (flush_now, dropped)
        };

        if flush_now {
            self.flush(stream).await?;
        }
        if dropped > 0 {
            warn!(stream, dropped, "Measurement buffer full, dropped oldest entries");
            return Err(RealtimeError::BufferOverflow {
                stream: stream.to_string(),
                dropped,
            });
        }
        Ok(())
    }

    /// Send everything buffered for `stream` as one batch.
    ///
    /// On failure the entries go back in front of anything buffered since,
    /// and a retry is scheduled one window out. Returns the number sent.
    pub async fn flush(&self, stream: &str) -> Result<usize, RealtimeError> {
        let (flush_lock, sink) = {
            let streams = self.streams();
            let state = streams
                .get(stream)
                .ok_or_else(|| RealtimeError::UnknownStream(stream.to_string()))?;
            (state.flush_lock.clone(), state.sink.clone())
        };
        let _serialized = flush_lock.lock().await;

        let batch: Vec<Measurement> = {
            let mut streams = self.streams();
            let Some(state) = streams.get_mut(stream) else {
                return Ok(0);
            };
            state.cancel_timer();
            state.oldest_at = None;
            state.buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        match sink.send_batch(batch.clone()).await {
            Ok(()) => {
                debug!(stream, count, "Flushed measurements");
                let mut streams = self.streams();
                if let Some(state) = streams.get_mut(stream) {
                    if !state.buffer.is_empty() {
                        self.reschedule(stream, state);
                    }
                }
                Ok(count)
            }
            Err(e) => {
                warn!(stream, count, error = %e, "Flush failed, keeping measurements");
                let mut streams = self.streams();
                if let Some(state) = streams.get_mut(stream) {
                    for m in batch.into_iter().rev() {
                        state.buffer.push_front(m);
                    }
                    let dropped = trim_oldest(&mut state.buffer, self.shared.max_buffered);
                    if dropped > 0 {
                        warn!(stream, dropped, "Measurement buffer full, dropped oldest entries");
                    }
                    let now = Instant::now();
                    let window = state.config.batch_window;
                    state.oldest_at = Some(now);
                    if !window.is_zero() {
                        self.arm(stream, state, now + window);
                    }
                }
                Err(e)
            }
        }
    }

    /// Send one measurement now, bypassing the buffer.
    pub async fn send(&self, stream: &str, attribute_id: &str, payload: Value) -> Result<(), RealtimeError> {
        let sink = self
            .streams()
            .get(stream)
            .map(|s| s.sink.clone())
            .ok_or_else(|| RealtimeError::UnknownStream(stream.to_string()))?;
        sink.send_measurement(Measurement::now(attribute_id, payload)).await
    }

    /// Re-arm timers for every stream holding entries, e.g. after a reconnect.
    pub fn rearm_all(&self) {
        let mut streams = self.streams();
        for (stream, state) in streams.iter_mut() {
            if !state.buffer.is_empty() {
                self.reschedule(stream, state);
            }
        }
    }

    /// Stop every flush timer. Buffers are kept.
    pub fn shutdown(&self) {
        let mut streams = self.streams();
        for state in streams.values_mut() {
            state.cancel_timer();
        }
        debug!(streams = streams.len(), "Backpressure timers stopped");
    }

    /// Arm the flush timer for the current buffer and config.
    fn reschedule(&self, stream: &str, state: &mut StreamState) {
        if state.buffer.is_empty() {
            state.cancel_timer();
            return;
        }
        let now = Instant::now();
        let deadline = if state.buffer.len() >= state.config.batch_size {
            now
        } else {
            state.oldest_at.unwrap_or(now) + state.config.batch_window
        };
        self.arm(stream, state, deadline);
    }

    fn arm(&self, stream: &str, state: &mut StreamState, deadline: Instant) {
        state.cancel_timer();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(stream, "No runtime, flush timer not armed");
            return;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let stream = stream.to_string();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let controller = BackpressureController { shared };
            // Detached so that cancelling the timer never interrupts a send.
            tokio::spawn(async move {
                if let Err(e) = controller.flush(&stream).await {
                    debug!(stream = %stream, error = %e, "Timed flush failed");
                }
            });
        }));
    }
}

fn trim_oldest(buffer: &mut VecDeque<Measurement>, max: usize) -> usize {
    let excess = buffer.len().saturating_sub(max);
    buffer.drain(..excess);
    excess
}
