//! Events pushed to clients on a DataBox output key

use crate::action::Code;
use crate::package::CudPackage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server to client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a", rename_all = "camelCase")]
pub enum ClientEvent {
    Cud {
        #[serde(rename = "d")]
        package: CudPackage,
    },
    Close {
        #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
        code: Option<Code>,
        #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Reload {
        #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
        code: Option<Code>,
        #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    KickOut {
        #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
        code: Option<Code>,
        #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl ClientEvent {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Payload of an inter-worker close instruction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClosePayload {
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Code>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_close_wire_form() {
        let event = ClientEvent::Close {
            code: Some(Code::Number(4001)),
            data: Some(json!("deleted")),
        };
        assert_eq!(event.to_value(), json!({ "a": "close", "c": 4001, "d": "deleted" }));
    }

    #[test]
    fn test_kick_out_without_extras() {
        let event = ClientEvent::KickOut { code: None, data: None };
        assert_eq!(event.to_value(), json!({ "a": "kickOut" }));
        let back: ClientEvent = serde_json::from_value(json!({ "a": "kickOut" })).unwrap();
        assert_eq!(back, event);
    }
}
