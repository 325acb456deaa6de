//! Outbound bus messages

use serde::{Deserialize, Serialize};

/// Delivery guarantee requested from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    /// Fire-and-forget (QoS 0)
    AtMostOnce,
    /// Acknowledged and retried (QoS 1)
    AtLeastOnce,
}

/// Presence value carried on the status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Level/state update for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelPayload {
    /// 1 when active, 0 when inactive
    pub state: u8,
    pub level: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: Presence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Level(LevelPayload),
    Status(StatusPayload),
    Ping,
}

/// An immutable message ready for the publisher
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,
    pub retain: bool,
}

impl OutboundEvent {
    /// Best-effort level update (QoS 0, not retained)
    pub fn level(topic: impl Into<String>, state: u8, level: f64, timestamp: i64) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Level(LevelPayload {
                state,
                level,
                timestamp,
            }),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    /// Durable presence update (QoS 1, retained)
    pub fn status(topic: impl Into<String>, status: Presence) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Status(StatusPayload { status }),
            qos: Qos::AtLeastOnce,
            retain: true,
        }
    }

    /// Connectivity probe (QoS 0, not retained)
    pub fn ping(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Ping,
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    /// Whether the event must survive a disconnected period
    pub fn is_durable(&self) -> bool {
        self.qos == Qos::AtLeastOnce
    }

    /// Encode the payload as it goes on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.payload {
            Payload::Level(level) => serde_json::to_vec(level),
            Payload::Status(status) => serde_json::to_vec(status),
            Payload::Ping => Ok(b"ping".to_vec()),
        }
    }
}
