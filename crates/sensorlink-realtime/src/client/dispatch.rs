//! The client's single inbound dispatch task and its rejoin timers.
//!
//! Every transport event passes through [`run`] in arrival order, so
//! per-topic delivery to channels, presence, and the event surface is
//! strictly ordered.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sensorlink_common::RealtimeError;

use super::{lock, Client, ClientEvent, ClientShared};
use crate::backpressure::BackpressureConfig;
use crate::channel::{ChannelSignal, ChannelState};
use crate::presence::{parse_diff, parse_state, PresenceChange, PresenceChangeKind};
use crate::protocol::{events, BackpressureConfigPayload, Measurement, MeasurementBatch};
use crate::transport::{ConnectionState, Envelope, TransportEvent};

pub(super) async fn run(weak: Weak<ClientShared>, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        let client = Client { shared };
        client.handle_transport_event(event).await;
    }
    debug!("Client dispatcher stopped");
}

impl Client {
    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                self.emit(ClientEvent::ConnectionState(state));
                match state {
                    ConnectionState::Connected => {
                        // Joins wait on replies routed by this task, so they run elsewhere.
                        let client = self.clone();
                        tokio::spawn(async move {
                            let results = client.rejoin_all().await;
                            debug!(topics = results.len(), "Rejoin after connect finished");
                            client.shared.backpressure.rearm_all();
                        });
                    }
                    ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                        self.abort_rejoins();
                        for channel in self.shared.channels.read().await.values() {
                            channel.reset_on_disconnect();
                        }
                    }
                    ConnectionState::Connecting => {}
                }
            }
            TransportEvent::Failed { error, terminal } => {
                if terminal {
                    warn!(error = %error, "Connection stopped");
                }
                self.emit(ClientEvent::Error { topic: None, error });
            }
            TransportEvent::Message(envelope) => self.route(envelope).await,
        }
    }

    async fn route(&self, envelope: Envelope) {
        let Some(channel) = self.channel(&envelope.topic).await else {
            debug!(topic = %envelope.topic, event = %envelope.event, "Message for unknown topic");
            return;
        };
        let topic = envelope.topic.clone();

        match channel.handle_message(&envelope) {
            ChannelSignal::Joined(_) => {
                lock(&self.shared.rejoin_tasks).remove(&topic);
                self.emit(ClientEvent::ChannelJoined { topic });
            }
            ChannelSignal::Errored { reason } => {
                self.emit(ClientEvent::ChannelError {
                    topic: topic.clone(),
                    reason,
                });
                self.schedule_rejoin(&topic);
            }
            ChannelSignal::Closed => {
                self.shared.desired.lock().await.retain(|(t, _)| *t != topic);
                self.emit(ClientEvent::ChannelClosed { topic });
            }
            ChannelSignal::Event(envelope) => self.route_event(envelope),
            ChannelSignal::Replied | ChannelSignal::Ignored => {}
        }
    }

    fn route_event(&self, envelope: Envelope) {
        let Envelope {
            topic,
            event,
            payload,
            ..
        } = envelope;

        match event.as_str() {
            events::PRESENCE_STATE => {
                let changes = lock(&self.shared.presences)
                    .entry(topic.clone())
                    .or_default()
                    .apply_state(parse_state(&payload));
                self.emit_presence(&topic, changes);
            }
            events::PRESENCE_DIFF => {
                let (joins, leaves) = parse_diff(&payload);
                let changes = lock(&self.shared.presences)
                    .entry(topic.clone())
                    .or_default()
                    .apply_diff(joins, leaves);
                self.emit_presence(&topic, changes);
            }
            events::BACKPRESSURE_CONFIG => self.apply_backpressure(topic, payload),
            events::MEASUREMENT => match serde_json::from_value::<Measurement>(payload.clone()) {
                Ok(measurement) => self.emit(ClientEvent::Measurement { topic, measurement }),
                Err(_) => self.emit(ClientEvent::Event {
                    topic,
                    event,
                    payload,
                }),
            },
            events::MEASUREMENT_BATCH => {
                match serde_json::from_value::<MeasurementBatch>(payload.clone()) {
                    Ok(batch) => {
                        for measurement in batch.measurements {
                            self.emit(ClientEvent::Measurement {
                                topic: topic.clone(),
                                measurement,
                            });
                        }
                    }
                    Err(_) => self.emit(ClientEvent::Event {
                        topic,
                        event,
                        payload,
                    }),
                }
            }
            events::MOVEMENT => self.emit(ClientEvent::Movement { topic, payload }),
            _ => self.emit(ClientEvent::Event {
                topic,
                event,
                payload,
            }),
        }
    }

    fn emit_presence(&self, topic: &str, changes: Vec<PresenceChange>) {
        for change in changes {
            let event = match change.kind {
                PresenceChangeKind::Join => ClientEvent::PresenceJoin {
                    topic: topic.to_string(),
                    key: change.key,
                    metas: change.changed,
                },
                PresenceChangeKind::Leave => ClientEvent::PresenceLeave {
                    topic: topic.to_string(),
                    key: change.key,
                    metas: change.changed,
                },
            };
            self.emit(event);
        }
    }

    fn apply_backpressure(&self, topic: String, payload: Value) {
        let parsed: BackpressureConfigPayload = match serde_json::from_value(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Malformed backpressure_config");
                self.emit(ClientEvent::Error {
                    topic: Some(topic),
                    error: RealtimeError::Decode(e.to_string()),
                });
                return;
            }
        };

        let stream = lock(&self.shared.sensors).get(&topic).cloned();
        let Some(stream) = stream else {
            self.emit(ClientEvent::Error {
                topic: Some(topic.clone()),
                error: RealtimeError::UnknownTopic(topic),
            });
            return;
        };

        let config = BackpressureConfig::from_payload(&parsed);
        match self.shared.backpressure.set_config(&stream, config) {
            Ok(()) => self.emit(ClientEvent::Backpressure {
                topic,
                stream,
                config,
            }),
            Err(error) => self.emit(ClientEvent::Error {
                topic: Some(topic),
                error,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Rejoin of errored channels
    // -----------------------------------------------------------------------

    /// Retry joining an errored, still-desired topic while connected.
    /// Reconnects are covered by `rejoin_all` instead.
    fn schedule_rejoin(&self, topic: &str) {
        if self.connection_state() != ConnectionState::Connected {
            return;
        }
        let mut tasks = lock(&self.shared.rejoin_tasks);
        if tasks.get(topic).is_some_and(|t| !t.is_finished()) {
            return;
        }
        let handle = tokio::spawn(rejoin_loop(Arc::downgrade(&self.shared), topic.to_string()));
        tasks.insert(topic.to_string(), handle);
    }
}

async fn rejoin_loop(weak: Weak<ClientShared>, topic: String) {
    for attempt in 0usize.. {
        let delay = match weak.upgrade() {
            Some(shared) => shared.config.rejoin_delay(attempt),
            None => return,
        };
        tokio::time::sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let client = Client { shared };
        if client.connection_state() != ConnectionState::Connected {
            return;
        }
        let Some(params) = client.desired_params(&topic).await else {
            return;
        };
        let Some(channel) = client.channel(&topic).await else {
            return;
        };
        if channel.state() == ChannelState::Joined {
            return;
        }

        info!(topic = %topic, attempt = attempt + 1, "Rejoining errored channel");
        match client.join_channel(&channel, params).await {
            Ok(()) => return,
            Err(e) => warn!(topic = %topic, error = %e, "Rejoin attempt failed"),
        }
    }
}
