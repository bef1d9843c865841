//! Wire protocol frames for the progress channel.

use serde::{Deserialize, Serialize};

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionStarted {
        prompt_id: String,
        total_steps: u32,
    },
    ProgressUpdate {
        prompt_id: String,
        current_step: u32,
        total_steps: u32,
        percentage: f64,
        current_node: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_image: Option<String>,
    },
    ResourceUpdate {
        prompt_id: String,
        cpu_percent: f64,
        memory_percent: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpu_percent: Option<f64>,
    },
    ExecutionComplete {
        prompt_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        total_time: Option<f64>,
    },
    QueueUpdate {
        prompt_id: String,
        queue_position: i64,
    },
    Pong,
    Heartbeat,
    Subscribed {
        prompt_id: String,
    },
    Unsubscribed,
    JoinedRoom {
        room: String,
    },
    Error {
        message: String,
    },
}

/// Client → server frames. Unknown fields are ignored; unknown types fail
/// to parse and are dropped by the transport with a debug log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Ping,
    Subscribe { prompt_id: Option<String> },
    Unsubscribe,
    JoinRoom { room: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_tag_with_type() {
        let event = ProgressEvent::ExecutionStarted {
            prompt_id: "p1".into(),
            total_steps: 20,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "execution_started");
        assert_eq!(value["total_steps"], 20);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let event = ProgressEvent::ProgressUpdate {
            prompt_id: "p1".into(),
            current_step: 5,
            total_steps: 20,
            percentage: 25.0,
            current_node: None,
            eta_seconds: None,
            preview_image: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("eta_seconds").is_none());
        assert!(value.get("preview_image").is_none());
        // current_node is part of the stable shape even when null.
        assert!(value["current_node"].is_null());
    }

    #[test]
    fn test_inbound_parsing() {
        let ping: InboundMessage = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(ping, InboundMessage::Ping);

        let sub: InboundMessage =
            serde_json::from_value(json!({"type": "subscribe", "prompt_id": "p9"})).unwrap();
        assert_eq!(
            sub,
            InboundMessage::Subscribe {
                prompt_id: Some("p9".into())
            }
        );

        let join: InboundMessage =
            serde_json::from_value(json!({"type": "join_room", "room": "lobby"})).unwrap();
        assert_eq!(
            join,
            InboundMessage::JoinRoom {
                room: Some("lobby".into())
            }
        );

        assert!(serde_json::from_value::<InboundMessage>(json!({"type": "nope"})).is_err());
    }
}
