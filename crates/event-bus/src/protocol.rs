use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// What a client asks the server to do with a [`ClientFrame`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start receiving the named event.
    Subscribe,
    /// Stop receiving the named event.
    Unsubscribe,
    /// Invoke the server-side handlers registered for the named event.
    Emit,
    /// Ask for a transport-level pong.
    Ping,
    /// Anything else. Readers ignore these frames.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Frame sent from a browser (or [`crate::ClientMultiplexer`]) to the server.
///
/// Wire shape: `{"action": "...", "event": "...", "payload": [...]}`. Both
/// `event` and `payload` are optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(
        default,
        deserialize_with = "nullable_payload",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub payload: Vec<Value>,
}

impl ClientFrame {
    pub fn subscribe(event: impl Into<String>) -> Self {
        Self {
            action: Action::Subscribe,
            event: event.into(),
            payload: Vec::new(),
        }
    }

    pub fn unsubscribe(event: impl Into<String>) -> Self {
        Self {
            action: Action::Unsubscribe,
            event: event.into(),
            payload: Vec::new(),
        }
    }

    pub fn emit(event: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            action: Action::Emit,
            event: event.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self {
            action: Action::Ping,
            event: String::new(),
            payload: Vec::new(),
        }
    }
}

/// Frame sent from the server to every connection subscribed to `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, deserialize_with = "nullable_payload")]
    pub payload: Vec<Value>,
}

/// Browsers send `"payload": null` for emits without arguments.
fn nullable_payload<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_full_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"emit","event":"cancel-1","payload":[1,"a"]}"#)
                .unwrap();
        assert_eq!(frame, ClientFrame::emit("cancel-1", vec![json!(1), json!("a")]));
    }

    #[test]
    fn missing_and_null_fields_default() {
        let frame: ClientFrame = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::ping());

        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"emit","event":"x","payload":null}"#).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"teleport","event":"x"}"#).unwrap();
        assert_eq!(frame.action, Action::Unknown);

        let frame: ClientFrame = serde_json::from_str(r#"{"event":"x"}"#).unwrap();
        assert_eq!(frame.action, Action::Unknown);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"action":"emit","payload":{}}"#).is_err());
    }

    #[test]
    fn subscribe_frame_omits_empty_payload() {
        let text = serde_json::to_string(&ClientFrame::subscribe("logs")).unwrap();
        assert_eq!(text, r#"{"action":"subscribe","event":"logs"}"#);
    }

    #[test]
    fn event_frame_always_carries_payload() {
        let frame = EventFrame {
            event: "tick".into(),
            payload: Vec::new(),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"event":"tick","payload":[]}"#
        );
    }
}
