//! Relay wire protocol: frames between the relay and its clients, and the
//! line envelope spoken on the agent channel.
//!
//! The agent channel carries newline-delimited JSON. Every line is an object
//! with a mandatory `type` string; the relay treats everything else as
//! opaque, except a `command` field used to correlate RPC responses back to
//! the client that issued the command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control frames the relay sends to a client WebSocket.
///
/// Agent events are not part of this enum; they are forwarded verbatim with
/// a `seq` attached (see [`event_frame`]), so their shape stays opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// First frame on every connection: the session and its journal position.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { session_id: String, last_seq: i64 },

    /// Historical events follow, in ascending seq order.
    #[serde(rename = "replay_start")]
    ReplayStart,

    /// Replay finished; subsequent events are live.
    #[serde(rename = "replay_end")]
    ReplayEnd,

    /// Hub or sandbox failure.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("control frames serialize")
    }
}

/// The `type` tag of an agent or client message, if present.
pub fn message_type(msg: &Value) -> Option<&str> {
    msg.get("type").and_then(Value::as_str)
}

/// The `command` correlation tag of a message, if present.
pub fn command_tag(msg: &Value) -> Option<&str> {
    msg.get("command").and_then(Value::as_str)
}

/// Attach a journal sequence number to an agent event before fan-out.
pub fn event_frame(payload: &Value, seq: i64) -> Value {
    let mut frame = payload.clone();
    if let Value::Object(map) = &mut frame {
        map.insert("seq".into(), Value::from(seq));
    }
    frame
}

/// Rewrite a correlated agent reply into a client `response` frame,
/// preserving every field except the `type` tag.
pub fn response_frame(reply: &Value) -> Value {
    let mut frame = reply.clone();
    if let Value::Object(map) = &mut frame {
        map.insert("type".into(), Value::from("response"));
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connected_frame_shape() {
        let frame = ServerFrame::Connected {
            session_id: "s1".into(),
            last_seq: 42,
        }
        .to_value();
        assert_eq!(
            frame,
            json!({"type": "connected", "sessionId": "s1", "lastSeq": 42})
        );
    }

    #[test]
    fn event_frame_attaches_seq() {
        let payload = json!({"type": "agent_message", "text": "hi"});
        let framed = event_frame(&payload, 7);
        assert_eq!(framed["seq"], 7);
        assert_eq!(framed["type"], "agent_message");
        // The original payload is untouched.
        assert!(payload.get("seq").is_none());
    }

    #[test]
    fn response_frame_rewrites_type_only() {
        let reply = json!({"type": "set_model_result", "command": "c-1", "ok": true});
        let framed = response_frame(&reply);
        assert_eq!(framed["type"], "response");
        assert_eq!(framed["command"], "c-1");
        assert_eq!(framed["ok"], true);
    }

    #[test]
    fn tag_extraction() {
        let msg = json!({"type": "prompt", "command": "c-9"});
        assert_eq!(message_type(&msg), Some("prompt"));
        assert_eq!(command_tag(&msg), Some("c-9"));
        assert_eq!(command_tag(&json!({"type": "prompt"})), None);
        assert_eq!(message_type(&json!([1, 2])), None);
    }
}
