//! One-line rendering of client events for the terminal.

use sensorlink_realtime::ClientEvent;

pub fn format_event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::ConnectionState(state) => format!("[connection] {state}"),
        ClientEvent::ChannelJoined { topic } => format!("[{topic}] joined"),
        ClientEvent::ChannelError { topic, reason } => format!("[{topic}] error: {reason}"),
        ClientEvent::ChannelClosed { topic } => format!("[{topic}] closed"),
        ClientEvent::Measurement { topic, measurement } => format!(
            "[{topic}] measurement {}={} @{}",
            measurement.attribute_id, measurement.payload, measurement.timestamp
        ),
        ClientEvent::Movement { topic, payload } => format!("[{topic}] movement {payload}"),
        ClientEvent::Event {
            topic,
            event,
            payload,
        } => format!("[{topic}] {event} {payload}"),
        ClientEvent::PresenceJoin { topic, key, metas } => {
            format!("[{topic}] presence join {key} ({} metas)", metas.len())
        }
        ClientEvent::PresenceLeave { topic, key, metas } => {
            format!("[{topic}] presence leave {key} ({} metas)", metas.len())
        }
        ClientEvent::Backpressure {
            topic,
            stream,
            config,
        } => format!(
            "[{topic}] backpressure {stream}: {} window={}ms size={}",
            config.attention_level,
            config.batch_window.as_millis(),
            config.batch_size
        ),
        ClientEvent::Error { topic, error } => match topic {
            Some(topic) => format!("[{topic}] error: {error}"),
            None => format!("[connection] error: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlink_realtime::{
        AttentionLevel, BackpressureConfig, ConnectionState, Measurement, RealtimeError,
    };
    use serde_json::json;

    #[test]
    fn connection_events() {
        assert_eq!(
            format_event(&ClientEvent::ConnectionState(ConnectionState::Reconnecting)),
            "[connection] reconnecting"
        );
        assert_eq!(
            format_event(&ClientEvent::Error {
                topic: None,
                error: RealtimeError::NotConnected
            }),
            "[connection] error: not connected"
        );
    }

    #[test]
    fn measurement_line() {
        let event = ClientEvent::Measurement {
            topic: "sensor:1".into(),
            measurement: Measurement {
                payload: json!(3.5),
                timestamp: 99,
                attribute_id: "speed".into(),
            },
        };
        assert_eq!(format_event(&event), "[sensor:1] measurement speed=3.5 @99");
    }

    #[test]
    fn backpressure_line() {
        let event = ClientEvent::Backpressure {
            topic: "sensor:1".into(),
            stream: "1".into(),
            config: BackpressureConfig::for_level(AttentionLevel::Low),
        };
        assert_eq!(
            format_event(&event),
            "[sensor:1] backpressure 1: low window=2000ms size=10"
        );
    }
}
