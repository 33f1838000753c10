//! Frame envelopes carried over a WebSocket text message

use crate::error::{ProtocolError, ProtocolResult};
use databox_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Event a client sends to attach to a DataBox
pub const CONNECT_EVENT: &str = "databox:connect";

/// Maximum accepted frame size in bytes
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "e")]
    pub event: String,
    #[serde(rename = "d", default)]
    pub data: Value,
    /// Present when the client expects a reply
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let frame: ClientFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        trace!(event = %frame.event, request = ?frame.request_id, "Parsed client frame");
        Ok(frame)
    }
}

/// Error as reported to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            name: e.name().to_string(),
            message: e.to_string(),
            info: e.info(),
        }
    }
}

/// Server to client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Failure {
        r: u64,
        err: ErrorBody,
    },
    Reply {
        r: u64,
        d: Value,
    },
    Event {
        e: String,
        d: Value,
    },
}

impl ServerFrame {
    pub fn reply(request_id: u64, data: Value) -> Self {
        ServerFrame::Reply { r: request_id, d: data }
    }

    pub fn error(request_id: u64, error: &Error) -> Self {
        ServerFrame::Failure {
            r: request_id,
            err: error.into(),
        }
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        ServerFrame::Event {
            e: event.into(),
            d: data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_frame() {
        let frame = ClientFrame::parse(r#"{"e":"databox:connect","d":{"d":"feed"},"r":7}"#).unwrap();
        assert_eq!(frame.event, CONNECT_EVENT);
        assert_eq!(frame.data, json!({ "d": "feed" }));
        assert_eq!(frame.request_id, Some(7));

        let fire_and_forget = ClientFrame::parse(r#"{"e":"x"}"#).unwrap();
        assert_eq!(fire_and_forget.data, Value::Null);
        assert_eq!(fire_and_forget.request_id, None);
    }

    #[test]
    fn test_reject_bad_frames() {
        assert!(matches!(
            ClientFrame::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        let huge = format!(r#"{{"e":"x","d":"{}"}}"#, "a".repeat(MAX_FRAME_SIZE));
        assert!(matches!(
            ClientFrame::parse(&huge),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_server_frame_wire_forms() {
        let reply = ServerFrame::reply(1, json!({ "ut": false }));
        assert_eq!(reply.to_text(), r#"{"r":1,"d":{"ut":false}}"#);

        let failure = ServerFrame::error(2, &Error::IdMissing("chat".into()));
        let wire: Value = serde_json::from_str(&failure.to_text()).unwrap();
        assert_eq!(wire["r"], 2);
        assert_eq!(wire["err"]["name"], "IdMissing");
        assert!(wire["err"].get("info").is_none());

        let event = ServerFrame::event("DB-feed-1.out", json!({ "a": "reload" }));
        assert_eq!(event.to_text(), r#"{"e":"DB-feed-1.out","d":{"a":"reload"}}"#);
    }

    #[test]
    fn test_error_info_is_forwarded() {
        let body = ErrorBody::from(&Error::ApiLevelNotCompatible {
            name: "feed".into(),
            api_level: 1,
        });
        assert_eq!(body.info, Some(json!({ "apiLevel": 1 })));
    }
}
