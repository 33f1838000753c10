//! Connect request and response of the DataBox handshake

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated connect request
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    /// DataBox name
    pub name: String,
    /// Family member id, normalized to a string
    pub member: Option<String>,
    pub api_level: Option<u32>,
    /// Session token from an earlier connection
    pub token: Option<String>,
}

impl ConnectRequest {
    /// Validate the shape of `{ d, i?, al?, t? }`
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let object = value.as_object().ok_or(ProtocolError::InvalidField {
            field: "request",
            reason: "expected an object".into(),
        })?;

        let name = match object.get("d") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(Value::String(_)) => {
                return Err(ProtocolError::InvalidField {
                    field: "d",
                    reason: "empty DataBox name".into(),
                })
            }
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "d",
                    reason: "expected a string".into(),
                })
            }
            None => return Err(ProtocolError::MissingField("d")),
        };

        let member = match object.get("i") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "i",
                    reason: "expected a non-empty string or an integer".into(),
                })
            }
        };

        let api_level = match object.get("al") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(level) if level > 0 && level <= u32::MAX as u64 => Some(level as u32),
                _ => {
                    return Err(ProtocolError::InvalidField {
                        field: "al",
                        reason: "expected a positive integer".into(),
                    })
                }
            },
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "al",
                    reason: "expected a positive integer".into(),
                })
            }
        };

        let token = match object.get("t") {
            None | Some(Value::Null) => None,
            Some(Value::String(token)) => Some(token.clone()),
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "t",
                    reason: "expected a string".into(),
                })
            }
        };

        Ok(Self {
            name,
            member,
            api_level,
            token,
        })
    }
}

/// Answer to a successful connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the supplied session token was accepted
    #[serde(rename = "ut")]
    pub used_token: bool,
    /// Id of the last known cud, empty if none
    #[serde(rename = "ci")]
    pub last_cud_id: String,
    #[serde(rename = "i")]
    pub input_key: String,
    #[serde(rename = "o")]
    pub output_key: String,
}

impl ConnectResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_request() {
        let request = ConnectRequest::from_value(&json!({
            "d": "chat",
            "i": 42,
            "al": 2,
            "t": "abc.def"
        }))
        .unwrap();

        assert_eq!(request.name, "chat");
        assert_eq!(request.member.as_deref(), Some("42"));
        assert_eq!(request.api_level, Some(2));
        assert_eq!(request.token.as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_minimal_request() {
        let request = ConnectRequest::from_value(&json!({ "d": "feed" })).unwrap();
        assert_eq!(request.member, None);
        assert_eq!(request.api_level, None);
        assert_eq!(request.token, None);
    }

    #[test]
    fn test_shape_errors() {
        let cases = [
            json!("feed"),
            json!({}),
            json!({ "d": "" }),
            json!({ "d": 5 }),
            json!({ "d": "chat", "i": 1.5 }),
            json!({ "d": "chat", "i": { "x": 1 } }),
            json!({ "d": "feed", "al": 0 }),
            json!({ "d": "feed", "al": -3 }),
            json!({ "d": "feed", "al": "2" }),
            json!({ "d": "feed", "t": 7 }),
        ];
        for case in cases {
            let err = ConnectRequest::from_value(&case).unwrap_err();
            let core: databox_core::Error = err.into();
            assert_eq!(core.name(), "InvalidRequest", "case {}", case);
        }
    }

    #[test]
    fn test_response_wire_form() {
        let response = ConnectResponse {
            used_token: false,
            last_cud_id: String::new(),
            input_key: "DB-chat-1-room42.in".into(),
            output_key: "DB-chat-1-room42.out".into(),
        };
        assert_eq!(
            response.to_value(),
            json!({ "ut": false, "ci": "", "i": "DB-chat-1-room42.in", "o": "DB-chat-1-room42.out" })
        );
    }
}
