//! Phoenix message envelope and its two JSON serializers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sensorlink_common::RealtimeError;

use crate::protocol::{events, PHOENIX_TOPIC};

/// A Phoenix protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_refs(mut self, join_ref: Option<String>, msg_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self.msg_ref = msg_ref;
        self
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, Value::Object(Default::default()))
            .with_refs(None, Some(msg_ref))
    }

    pub fn is_reply(&self) -> bool {
        self.event == events::PHX_REPLY
    }

    /// `payload.status` of a `phx_reply`.
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// `payload.response` of a `phx_reply`, `null` when absent.
    pub fn reply_response(&self) -> Value {
        self.payload.get("response").cloned().unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Serializers
// ---------------------------------------------------------------------------

/// Wire format negotiated through the `vsn` query parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Serializer {
    /// `vsn=1.0.0`: `{"join_ref", "ref", "topic", "event", "payload"}`.
    V1,
    /// `vsn=2.0.0`: `[join_ref, ref, topic, event, payload]`.
    #[default]
    V2,
}

#[derive(Serialize, Deserialize)]
struct MapFrame {
    #[serde(default)]
    join_ref: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Value,
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

type ArrayFrame = (Value, Value, String, String, Value);

impl Serializer {
    pub fn from_vsn(vsn: &str) -> Option<Self> {
        match vsn {
            "1.0.0" => Some(Serializer::V1),
            "2.0.0" => Some(Serializer::V2),
            _ => None,
        }
    }

    pub fn vsn(self) -> &'static str {
        match self {
            Serializer::V1 => "1.0.0",
            Serializer::V2 => "2.0.0",
        }
    }

    pub fn encode(self, envelope: &Envelope) -> Result<String, RealtimeError> {
        let join_ref = ref_to_value(&envelope.join_ref);
        let msg_ref = ref_to_value(&envelope.msg_ref);
        let encoded = match self {
            Serializer::V1 => serde_json::to_string(&MapFrame {
                join_ref,
                msg_ref,
                topic: envelope.topic.clone(),
                event: envelope.event.clone(),
                payload: envelope.payload.clone(),
            }),
            Serializer::V2 => serde_json::to_string(&(
                join_ref,
                msg_ref,
                &envelope.topic,
                &envelope.event,
                &envelope.payload,
            )),
        };
        encoded.map_err(|e| RealtimeError::Decode(format!("failed to encode envelope: {e}")))
    }

    pub fn decode(self, text: &str) -> Result<Envelope, RealtimeError> {
        let (join_ref, msg_ref, topic, event, payload) = match self {
            Serializer::V1 => {
                let frame: MapFrame = serde_json::from_str(text)
                    .map_err(|e| RealtimeError::Decode(format!("bad map frame: {e}")))?;
                (frame.join_ref, frame.msg_ref, frame.topic, frame.event, frame.payload)
            }
            Serializer::V2 => serde_json::from_str::<ArrayFrame>(text)
                .map_err(|e| RealtimeError::Decode(format!("bad array frame: {e}")))?,
        };
        Ok(Envelope {
            join_ref: ref_from_value(join_ref)?,
            msg_ref: ref_from_value(msg_ref)?,
            topic,
            event,
            payload,
        })
    }
}

fn ref_to_value(r: &Option<String>) -> Value {
    r.as_ref().map_or(Value::Null, |s| Value::String(s.clone()))
}

/// Refs are strings on the wire, but some servers send bare integers.
fn ref_from_value(value: Value) -> Result<Option<String>, RealtimeError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(RealtimeError::Decode(format!("ref must be a string, got {other}"))),
    }
}
