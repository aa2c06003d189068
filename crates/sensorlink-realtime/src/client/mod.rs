//! The client façade: one socket, a registry of channels, presence per
//! topic, and measurement batching, behind a single connect/join/send API.

mod dispatch;
mod types;

pub use types::{ClientConfig, ClientEvent};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sensorlink_common::{ClientId, RealtimeError};

use crate::backpressure::{BackpressureConfig, BackpressureController, MeasurementSink};
use crate::channel::{Channel, ChannelState};
use crate::presence::{Presence, PresenceState};
use crate::protocol::{sensor_topic, Measurement};
use crate::transport::{ConnectionState, Socket, Transport, TransportEvent};

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct ClientShared {
    id: ClientId,
    config: ClientConfig,
    socket: Socket,
    channels: RwLock<HashMap<String, Channel>>,
    presences: StdMutex<HashMap<String, Presence>>,
    /// Topics to (re)join after every connect, in join order.
    desired: Mutex<Vec<(String, Value)>>,
    /// Sensor topic -> measurement stream id.
    sensors: StdMutex<HashMap<String, String>>,
    backpressure: BackpressureController,
    events: broadcast::Sender<ClientEvent>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    rejoin_tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
        if let Ok(mut tasks) = self.rejoin_tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
        self.backpressure.shutdown();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a Phoenix client. Cheap to clone; clones share one connection.
///
/// Several clients may coexist, each with its own socket.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (socket, inbound) = Socket::new(config.socket.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let backpressure =
            BackpressureController::new(config.default_backpressure, config.max_buffered);
        Self {
            shared: Arc::new(ClientShared {
                id: ClientId::new(),
                config,
                socket,
                channels: RwLock::new(HashMap::new()),
                presences: StdMutex::new(HashMap::new()),
                desired: Mutex::new(Vec::new()),
                sensors: StdMutex::new(HashMap::new()),
                backpressure,
                events,
                inbound: StdMutex::new(Some(inbound)),
                dispatcher: StdMutex::new(None),
                rejoin_tasks: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.shared.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Receive client events. Slow receivers lag rather than block the client.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.socket.state()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.shared.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    /// Open the socket. Resolves once connected, or with the error that
    /// stopped the connection for good. Desired topics are rejoined after
    /// this and every later reconnect.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.start_dispatcher();
        info!(client = %self.shared.id, "Connecting client");
        self.shared
            .socket
            .connect(&self.shared.config.url, self.shared.config.auth_token.as_deref())
            .await
    }

    /// Close the socket. Pending joins and pushes fail with `Cancelled`,
    /// flush timers stop, and buffered measurements are kept.
    pub async fn disconnect(&self) {
        info!(client = %self.shared.id, "Disconnecting client");
        self.abort_rejoins();
        self.shared.backpressure.shutdown();
        let channels: Vec<Channel> = self.shared.channels.read().await.values().cloned().collect();
        for channel in &channels {
            channel.cancel_pending(RealtimeError::Cancelled);
            channel.reset_on_disconnect();
        }
        self.shared.socket.disconnect().await;
    }

    fn start_dispatcher(&self) {
        let Some(inbound) = lock(&self.shared.inbound).take() else {
            return;
        };
        let handle = tokio::spawn(dispatch::run(Arc::downgrade(&self.shared), inbound));
        *lock(&self.shared.dispatcher) = Some(handle);
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    async fn channel_for(&self, topic: &str) -> Channel {
        let mut channels = self.shared.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                let transport: Arc<dyn Transport> = Arc::new(self.shared.socket.clone());
                Channel::new(topic, transport, self.shared.config.push_timeout)
            })
            .clone()
    }

    pub async fn channel(&self, topic: &str) -> Option<Channel> {
        self.shared.channels.read().await.get(topic).cloned()
    }

    /// Join `topic` and remember it for rejoin after reconnects.
    pub async fn join(&self, topic: &str, params: Value) -> Result<Channel, RealtimeError> {
        let channel = self.channel_for(topic).await;
        {
            let mut desired = self.shared.desired.lock().await;
            match desired.iter_mut().find(|(t, _)| t == topic) {
                Some(entry) => entry.1 = params.clone(),
                None => desired.push((topic.to_string(), params.clone())),
            }
        }

        match self.join_channel(&channel, params).await {
            Ok(()) => Ok(channel),
            Err(e @ RealtimeError::JoinRejected { .. }) => {
                self.shared.desired.lock().await.retain(|(t, _)| t != topic);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn join_channel(&self, channel: &Channel, params: Value) -> Result<(), RealtimeError> {
        lock(&self.shared.presences)
            .entry(channel.topic().to_string())
            .or_default()
            .reset();
        channel
            .join(params, self.shared.config.join_timeout)
            .await
            .map(drop)
    }

    /// Join `sensor:{id}` and route its measurements, presence, and
    /// backpressure config.
    pub async fn join_sensor(&self, sensor_id: &str, params: Value) -> Result<Channel, RealtimeError> {
        let topic = sensor_topic(sensor_id);
        let channel = self.channel_for(&topic).await;
        lock(&self.shared.sensors).insert(topic.clone(), sensor_id.to_string());
        self.shared
            .backpressure
            .register(sensor_id, Arc::new(channel.clone()));
        self.join(&topic, params).await
    }

    /// Leave `topic` and stop rejoining it. Anything still buffered for a
    /// sensor topic is discarded.
    pub async fn leave(&self, topic: &str) -> Result<(), RealtimeError> {
        self.shared.desired.lock().await.retain(|(t, _)| t != topic);
        if let Some(handle) = lock(&self.shared.rejoin_tasks).remove(topic) {
            handle.abort();
        }
        let channel = self
            .channel(topic)
            .await
            .ok_or_else(|| RealtimeError::UnknownTopic(topic.to_string()))?;

        // Stays registered until the phx_leave reply has been routed to it.
        channel.leave(self.shared.config.join_timeout).await;
        self.shared.channels.write().await.remove(topic);

        lock(&self.shared.presences).remove(topic);
        let stream = lock(&self.shared.sensors).remove(topic);
        if let Some(stream) = stream {
            let dropped = self.shared.backpressure.unregister(&stream);
            if !dropped.is_empty() {
                warn!(topic, dropped = dropped.len(), "Discarding buffered measurements on leave");
            }
        }
        self.emit(ClientEvent::ChannelClosed {
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Join every desired topic not already joined or joining, in order.
    /// Runs automatically after every successful connect.
    pub async fn rejoin_all(&self) -> Vec<(String, Result<(), RealtimeError>)> {
        let desired = self.shared.desired.lock().await.clone();
        let mut results = Vec::with_capacity(desired.len());
        for (topic, params) in desired {
            let channel = self.channel_for(&topic).await;
            if matches!(channel.state(), ChannelState::Joined | ChannelState::Joining) {
                results.push((topic, Ok(())));
                continue;
            }
            let result = self.join_channel(&channel, params).await;
            if let Err(e) = &result {
                warn!(topic = %topic, error = %e, "Rejoin failed");
                self.emit(ClientEvent::Error {
                    topic: Some(topic.clone()),
                    error: e.clone(),
                });
            }
            results.push((topic, result));
        }
        results
    }

    pub(crate) async fn desired_params(&self, topic: &str) -> Option<Value> {
        self.shared
            .desired
            .lock()
            .await
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
    }

    fn abort_rejoins(&self) {
        for (_, handle) in lock(&self.shared.rejoin_tasks).drain() {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Measurements
    // -----------------------------------------------------------------------

    async fn sensor_channel(&self, sensor_id: &str) -> Result<Channel, RealtimeError> {
        let topic = sensor_topic(sensor_id);
        self.channel(&topic)
            .await
            .ok_or(RealtimeError::UnknownTopic(topic))
    }

    /// Push one measurement now on `sensor:{id}`.
    pub async fn send_measurement(
        &self,
        sensor_id: &str,
        attribute_id: &str,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        let channel = self.sensor_channel(sensor_id).await?;
        channel
            .send_measurement(Measurement::now(attribute_id, payload))
            .await
    }

    /// Push several measurements as one `measurement_batch`.
    pub async fn send_measurement_batch(
        &self,
        sensor_id: &str,
        measurements: Vec<Measurement>,
    ) -> Result<(), RealtimeError> {
        if measurements.is_empty() {
            return Ok(());
        }
        let channel = self.sensor_channel(sensor_id).await?;
        channel.send_batch(measurements).await
    }

    /// Queue a measurement under the sensor's current backpressure policy.
    pub async fn buffer_measurement(
        &self,
        sensor_id: &str,
        attribute_id: &str,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        self.shared
            .backpressure
            .buffer(sensor_id, attribute_id, payload)
            .await
    }

    /// Flush the sensor's buffer now. Returns how many were sent.
    pub async fn flush_buffered_measurements(&self, sensor_id: &str) -> Result<usize, RealtimeError> {
        self.shared.backpressure.flush(sensor_id).await
    }

    /// Override the sensor's batching policy locally.
    pub fn set_backpressure(&self, sensor_id: &str, config: BackpressureConfig) -> Result<(), RealtimeError> {
        self.shared.backpressure.set_config(sensor_id, config)
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.shared.backpressure
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    pub fn is_online(&self, topic: &str, key: &str) -> bool {
        lock(&self.shared.presences)
            .get(topic)
            .is_some_and(|p| p.is_online(key))
    }

    pub fn online_keys(&self, topic: &str) -> BTreeSet<String> {
        lock(&self.shared.presences)
            .get(topic)
            .map(Presence::online_keys)
            .unwrap_or_default()
    }

    /// Snapshot of the topic's presence map.
    pub fn presence(&self, topic: &str) -> Option<PresenceState> {
        lock(&self.shared.presences)
            .get(topic)
            .map(|p| p.state().clone())
    }
}
