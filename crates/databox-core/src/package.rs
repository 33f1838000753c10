//! CUD packages - batches of actions emitted as one unit

use crate::action::CudAction;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Generate a fresh cud id
pub fn new_cud_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A batch of actions that has not yet been stamped
#[derive(Debug, Clone, PartialEq)]
pub struct PreCudPackage {
    pub cud_id: String,
    pub timestamp: Option<i64>,
    pub actions: Vec<CudAction>,
}

impl PreCudPackage {
    pub fn new(actions: Vec<CudAction>, timestamp: Option<i64>) -> Self {
        Self {
            cud_id: new_cud_id(),
            timestamp,
            actions,
        }
    }

    /// Stamp with the caller's timestamp, or the current time
    pub fn finalize(self) -> CudPackage {
        CudPackage {
            cud_id: self.cud_id,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            actions: self.actions,
        }
    }
}

/// An immutable, timestamped batch of actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CudPackage {
    #[serde(rename = "ci")]
    cud_id: String,
    #[serde(rename = "t")]
    timestamp: i64,
    #[serde(rename = "a")]
    actions: Vec<CudAction>,
}

impl CudPackage {
    pub fn cud_id(&self) -> &str {
        &self.cud_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn actions(&self) -> &[CudAction] {
        &self.actions
    }
}

/// Marker of the most recent change seen for a DataBox or family member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastCud {
    /// `None` until the first package is observed
    timestamp: Option<i64>,
    id: String,
}

impl LastCud {
    /// Record a package if it is not older than the current marker.
    /// Returns whether the marker moved.
    pub fn observe(&mut self, package: &CudPackage) -> bool {
        if self.timestamp.map_or(true, |current| package.timestamp >= current) {
            self.timestamp = Some(package.timestamp);
            self.id = package.cud_id.clone();
            true
        } else {
            false
        }
    }

    /// Id of the last change, empty if none was seen
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
}
