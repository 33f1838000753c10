//! Daemon configuration file
//!
//! ```toml
//! secret = "change-me"
//! worker_id = "worker-1"
//! default_api_level = 1
//! max_data_boxes_per_socket = 30
//!
//! [[databox]]
//! name = "feed"
//! api_levels = [1, 3]
//!
//! [[databox]]
//! name = "chat"
//! family = true
//! access = "authenticated"
//! systems = ["web", "ios"]
//! min_versions = { web = 1.0, ios = 2.5 }
//! ```

use anyhow::{Context, Result};
use databox_core::{AccessConfig, AccessRule, DataBoxConfig, DataBoxDefinition, SystemRule, VersionRule};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Secret session tokens are signed with; shared by all workers
    pub secret: Option<String>,
    pub worker_id: Option<String>,
    pub default_api_level: Option<u32>,
    pub max_data_boxes_per_socket: Option<usize>,
    #[serde(rename = "databox")]
    pub databoxes: Vec<DataBoxEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessEntry {
    #[default]
    All,
    None,
    Authenticated,
    NotAuthenticated,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataBoxEntry {
    pub name: String,
    #[serde(default)]
    pub family: bool,
    /// One variant per level; empty declares a single default variant
    #[serde(default)]
    pub api_levels: Vec<u32>,
    #[serde(default)]
    pub access: AccessEntry,
    /// Restrict access to authenticated users of these groups
    #[serde(default)]
    pub groups: Vec<String>,
    pub systems: Option<Vec<String>>,
    pub min_versions: Option<HashMap<String, f64>>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn definitions(&self) -> Vec<DataBoxDefinition> {
        self.databoxes.iter().map(DataBoxEntry::to_definition).collect()
    }
}

impl DataBoxEntry {
    fn access_config(&self) -> AccessConfig {
        let access = if !self.groups.is_empty() {
            AccessRule::Groups(self.groups.clone())
        } else {
            match self.access {
                AccessEntry::All => AccessRule::All,
                AccessEntry::None => AccessRule::None,
                AccessEntry::Authenticated => AccessRule::Authenticated,
                AccessEntry::NotAuthenticated => AccessRule::NotAuthenticated,
            }
        };

        AccessConfig {
            system: self
                .systems
                .clone()
                .map_or(SystemRule::All, SystemRule::Only),
            version: self
                .min_versions
                .clone()
                .map_or(VersionRule::All, VersionRule::Minimum),
            access,
        }
    }

    pub fn to_definition(&self) -> DataBoxDefinition {
        let definition = if self.family {
            DataBoxDefinition::family(&self.name)
        } else {
            DataBoxDefinition::single(&self.name)
        };
        let config = DataBoxConfig::new().with_access(self.access_config());

        if self.api_levels.is_empty() {
            definition.default_variant(config)
        } else {
            self.api_levels
                .iter()
                .fold(definition, |definition, level| definition.variant(*level, config.clone()))
        }
    }
}
