//! Event types — wire messages exchanged with the collection endpoint and
//! tracked events produced by the facade for the HTTP batch path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire message kind, tagged as `type` on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Event,
    Heartbeat,
    Ack,
    Error,
    Command,
}

/// Delivery priority. Order matters: later variants outrank earlier ones
/// when the queue is flushed after a reconnect.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A single message on the live channel, JSON-encoded per the client
/// contract (camelCase keys).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub session_id: String,
    pub visitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
}

/// Heartbeat request payload; the response must echo the same `ping_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPing {
    pub ping_id: String,
    pub timestamp: i64,
}

/// Acknowledgement payload; removes the matching queued message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckData {
    pub message_id: String,
}

impl WireMessage {
    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// Whether this message may be queued and re-sent on failure.
    pub fn retryable(&self) -> bool {
        self.retry.unwrap_or(true)
    }

    /// The acknowledged message id, when this is an `ack`.
    pub fn ack_message_id(&self) -> Option<String> {
        if self.message_type != MessageType::Ack {
            return None;
        }
        let data = self.data.clone()?;
        serde_json::from_value::<AckData>(data).ok().map(|a| a.message_id)
    }

    /// The echoed ping id, when this is a heartbeat response.
    pub fn heartbeat_ping_id(&self) -> Option<String> {
        if self.message_type != MessageType::Heartbeat {
            return None;
        }
        let data = self.data.clone()?;
        serde_json::from_value::<HeartbeatPing>(data).ok().map(|p| p.ping_id)
    }
}

/// Tracked event kind produced by the facade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackedEventType {
    Pageview,
    Custom,
    Technology,
    Performance,
}

/// Page context supplied by the embedding host on each page view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub referrer: Option<String>,
}

/// Navigation timing captured by the performance module.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageTiming {
    pub load_time_ms: u64,
    pub dom_ready_ms: u64,
    pub first_byte_ms: u64,
}

/// A single event bound for the HTTP batch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: Uuid,
    pub event_type: TrackedEventType,
    /// Event name for custom events, element/selector otherwise.
    pub element: Option<String>,
    pub value: Option<serde_json::Value>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub visitor_id: String,
    pub metadata: Option<serde_json::Value>,
}

impl TrackedEvent {
    /// A `custom` event as produced by `track(name, data)`.
    pub fn custom(
        name: impl Into<String>,
        data: Option<serde_json::Value>,
        session_id: impl Into<String>,
        visitor_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: TrackedEventType::Custom,
            element: Some(name.into()),
            value: data.clone(),
            url: None,
            title: None,
            referrer: None,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            visitor_id: visitor_id.into(),
            metadata: data,
        }
    }
}

/// Batch envelope for the HTTP flush path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub project_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub events: Vec<TrackedEvent>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(message_type: MessageType, data: Option<serde_json::Value>) -> WireMessage {
        WireMessage {
            id: "m-1".into(),
            message_type,
            data,
            timestamp: 1_700_000_000_000,
            session_id: "s-1".into(),
            visitor_id: "v-1".into(),
            priority: None,
            retry: None,
        }
    }

    #[test]
    fn test_wire_message_uses_camel_case_keys() {
        let msg = sample_message(MessageType::Event, Some(serde_json::json!({"k": 1})));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["visitorId"], "v-1");
        // Unset optionals are omitted entirely.
        assert!(json.get("priority").is_none());
        assert!(json.get("retry").is_none());
    }

    #[test]
    fn test_wire_message_round_trip() {
        let mut msg = sample_message(MessageType::Event, None);
        msg.priority = Some(Priority::High);
        msg.retry = Some(false);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, decoded);
        assert!(!decoded.retryable());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_ack_message_id_extraction() {
        let msg = sample_message(
            MessageType::Ack,
            Some(serde_json::json!({"messageId": "m-42"})),
        );
        assert_eq!(msg.ack_message_id(), Some("m-42".into()));
    }

    #[test]
    fn test_ack_extraction_ignores_other_types() {
        let msg = sample_message(
            MessageType::Event,
            Some(serde_json::json!({"messageId": "m-42"})),
        );
        assert_eq!(msg.ack_message_id(), None);
    }

    #[test]
    fn test_heartbeat_ping_id_extraction() {
        let msg = sample_message(
            MessageType::Heartbeat,
            Some(serde_json::json!({"pingId": "p-7", "timestamp": 123})),
        );
        assert_eq!(msg.heartbeat_ping_id(), Some("p-7".into()));
    }

    #[test]
    fn test_heartbeat_extraction_rejects_malformed_data() {
        let msg = sample_message(MessageType::Heartbeat, Some(serde_json::json!({"nope": 1})));
        assert_eq!(msg.heartbeat_ping_id(), None);
    }

    #[test]
    fn test_custom_event_carries_data_as_value_and_metadata() {
        let data = serde_json::json!({"plan": "pro"});
        let event = TrackedEvent::custom("signup_click", Some(data.clone()), "s-1", "v-1");
        assert_eq!(event.event_type, TrackedEventType::Custom);
        assert_eq!(event.element.as_deref(), Some("signup_click"));
        assert_eq!(event.value, Some(data.clone()));
        assert_eq!(event.metadata, Some(data));
    }
}
