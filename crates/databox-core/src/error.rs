//! Error types for the DataBox engine

use thiserror::Error;

/// Engine error types.
///
/// Everything except `Hook`, `Exchange`, `Serialization` and `Definition` is an expected,
/// client-reportable condition and is sent back to the requester verbatim.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown DataBox: {0}")]
    UnknownDataBox(String),

    #[error("No variant of DataBox {name} is compatible with api level {api_level}")]
    ApiLevelNotCompatible { name: String, api_level: u32 },

    #[error("DataBox {0} is a family and requires a member id")]
    IdMissing(String),

    #[error("DataBox {0} is not a family and does not accept a member id")]
    UnknownId(String),

    #[error("Member id is not valid: {id}")]
    IdIsNotValid {
        id: String,
        info: Option<serde_json::Value>,
    },

    #[error("Socket reached the limit of {limit} attached DataBoxes")]
    DataBoxLimitReached { limit: usize },

    #[error("No access with system: {0}")]
    NoAccessWithSystem(String),

    #[error("No access with version {version} on system {system}")]
    NoAccessWithVersion { system: String, version: f64 },

    #[error("Access denied")]
    AccessDenied,

    #[error("Unknown session target: {0}")]
    UnknownSessionTarget(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("No more data available")]
    NoMoreDataAvailable,

    /// The socket went away before it could be registered
    #[error("Socket {0} is disconnected")]
    SocketDisconnected(u64),

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid DataBox definition: {0}")]
    Definition(String),
}

impl Error {
    /// Stable name used when the error is reported to a client.
    pub fn name(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::UnknownDataBox(_) => "UnknownDataBox",
            Error::ApiLevelNotCompatible { .. } => "ApiLevelNotCompatible",
            Error::IdMissing(_) => "IdMissing",
            Error::UnknownId(_) => "UnknownId",
            Error::IdIsNotValid { .. } => "IdIsNotValid",
            Error::DataBoxLimitReached { .. } => "DataBoxLimitReached",
            Error::NoAccessWithSystem(_) => "NoAccessWithSystem",
            Error::NoAccessWithVersion { .. } => "NoAccessWithVersion",
            Error::AccessDenied => "AccessDenied",
            Error::UnknownSessionTarget(_) => "UnknownSessionTarget",
            Error::UnknownAction(_) => "UnknownAction",
            Error::NoMoreDataAvailable => "NoMoreDataAvailable",
            Error::SocketDisconnected(_) => "SocketDisconnected",
            Error::Hook(_) => "HookFailed",
            Error::Exchange(_) => "ExchangeFailed",
            Error::Serialization(_) => "SerializationFailed",
            Error::Definition(_) => "InvalidDefinition",
        }
    }

    /// Extra structured info that accompanies the error on the wire.
    pub fn info(&self) -> Option<serde_json::Value> {
        match self {
            Error::IdIsNotValid { info, .. } => info.clone(),
            Error::ApiLevelNotCompatible { api_level, .. } => {
                Some(serde_json::json!({ "apiLevel": api_level }))
            }
            Error::DataBoxLimitReached { limit } => Some(serde_json::json!({ "limit": limit })),
            _ => None,
        }
    }

    /// The end-of-stream signal raised by fetch hooks.
    pub fn is_no_more_data(&self) -> bool {
        matches!(self, Error::NoMoreDataAvailable)
    }

    /// Whether this is a named, recoverable condition rather than a fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Error::Hook(_) | Error::Exchange(_) | Error::Serialization(_) | Error::Definition(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for DataBox operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable() {
        assert_eq!(Error::AccessDenied.name(), "AccessDenied");
        assert_eq!(Error::IdMissing("chat".into()).name(), "IdMissing");
        assert_eq!(Error::NoMoreDataAvailable.name(), "NoMoreDataAvailable");
    }

    #[test]
    fn test_no_more_data_is_distinguishable() {
        assert!(Error::NoMoreDataAvailable.is_no_more_data());
        assert!(!Error::Hook("boom".into()).is_no_more_data());
        assert!(Error::NoMoreDataAvailable.is_client_error());
        assert!(!Error::Hook("boom".into()).is_client_error());
    }

    #[test]
    fn test_rejection_info_travels_with_error() {
        let err = Error::IdIsNotValid {
            id: "7".into(),
            info: Some(serde_json::json!({ "reason": "archived" })),
        };
        assert_eq!(err.info().unwrap()["reason"], "archived");
    }
}
