//! Per-client resumable fetch sessions

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which of the two sessions an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionTarget {
    #[default]
    Main,
    Restore,
}

impl SessionTarget {
    /// Parse an optional wire value; absent means `Main`
    pub fn parse(target: Option<&str>) -> Result<Self> {
        match target {
            None | Some("main") | Some("m") => Ok(SessionTarget::Main),
            Some("restore") | Some("r") => Ok(SessionTarget::Restore),
            Some(other) => Err(Error::UnknownSessionTarget(other.to_string())),
        }
    }

    pub fn other(self) -> Self {
        match self {
            SessionTarget::Main => SessionTarget::Restore,
            SessionTarget::Restore => SessionTarget::Main,
        }
    }
}

/// Fetch cursor state for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbSession {
    #[serde(rename = "c")]
    pub counter: u64,
    #[serde(rename = "d")]
    pub data: Map<String, Value>,
}

/// Both sessions of a client attached to a DataBox
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbSessionData {
    #[serde(rename = "m")]
    pub main: DbSession,
    #[serde(rename = "r")]
    pub restore: DbSession,
}

impl DbSessionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: SessionTarget) -> &DbSession {
        match target {
            SessionTarget::Main => &self.main,
            SessionTarget::Restore => &self.restore,
        }
    }

    pub fn get_mut(&mut self, target: SessionTarget) -> &mut DbSession {
        match target {
            SessionTarget::Main => &mut self.main,
            SessionTarget::Restore => &mut self.restore,
        }
    }

    pub fn reset(&mut self, target: SessionTarget) {
        *self.get_mut(target) = DbSession::default();
    }

    /// Copy `target` into the other slot. Both are independent afterwards.
    pub fn copy(&mut self, target: SessionTarget) {
        let source = self.get(target).clone();
        *self.get_mut(target.other()) = source;
    }
}
