//! Startup registry of declared DataBoxes and their api level variants

use crate::access::ConnectionContext;
use crate::core::{DataBoxConfig, DataBoxCore, DataBoxEnv};
use crate::databox::DataBox;
use crate::error::{Error, Result};
use crate::family::DataBoxFamily;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBoxKind {
    /// One data set for everyone
    Single,
    /// One data set per member id
    Family,
}

/// Declaration of a DataBox and its api level variants
#[derive(Debug, Clone)]
pub struct DataBoxDefinition {
    name: String,
    kind: DataBoxKind,
    variants: Vec<(Option<u32>, DataBoxConfig)>,
}

impl DataBoxDefinition {
    pub fn single(name: impl Into<String>) -> Self {
        Self::new(name, DataBoxKind::Single)
    }

    pub fn family(name: impl Into<String>) -> Self {
        Self::new(name, DataBoxKind::Family)
    }

    fn new(name: impl Into<String>, kind: DataBoxKind) -> Self {
        Self {
            name: name.into(),
            kind,
            variants: Vec::new(),
        }
    }

    /// Variant served to clients with an api level >= `api_level`
    pub fn variant(mut self, api_level: u32, config: DataBoxConfig) -> Self {
        self.variants.push((Some(api_level), config));
        self
    }

    /// Variant served to any api level no leveled variant covers
    pub fn default_variant(mut self, config: DataBoxConfig) -> Self {
        self.variants.push((None, config));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DataBoxKind {
        self.kind
    }
}

/// A resolved DataBox instance of either kind
#[derive(Debug, Clone)]
pub enum AnyDataBox {
    Single(Arc<DataBox>),
    Family(Arc<DataBoxFamily>),
}

impl AnyDataBox {
    pub fn core(&self) -> &Arc<DataBoxCore> {
        match self {
            AnyDataBox::Single(b) => b.core(),
            AnyDataBox::Family(f) => f.core(),
        }
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn api_level(&self) -> Option<u32> {
        self.core().api_level()
    }

    pub fn kind(&self) -> DataBoxKind {
        match self {
            AnyDataBox::Single(_) => DataBoxKind::Single,
            AnyDataBox::Family(_) => DataBoxKind::Family,
        }
    }

    pub fn is_family(&self) -> bool {
        matches!(self, AnyDataBox::Family(_))
    }

    pub async fn check_access(&self, ctx: &ConnectionContext) -> Result<()> {
        self.core().check_access(ctx).await
    }

    pub fn as_single(&self) -> Option<&Arc<DataBox>> {
        match self {
            AnyDataBox::Single(b) => Some(b),
            AnyDataBox::Family(_) => None,
        }
    }

    pub fn as_family(&self) -> Option<&Arc<DataBoxFamily>> {
        match self {
            AnyDataBox::Family(f) => Some(f),
            AnyDataBox::Single(_) => None,
        }
    }
}

#[derive(Default)]
struct Variants {
    leveled: BTreeMap<u32, AnyDataBox>,
    default: Option<AnyDataBox>,
}

impl Variants {
    fn resolve(&self, api_level: u32) -> Option<&AnyDataBox> {
        self.leveled
            .range(..=api_level)
            .next_back()
            .map(|(_, b)| b)
            .or(self.default.as_ref())
    }

    fn iter(&self) -> impl Iterator<Item = &AnyDataBox> {
        self.leveled.values().chain(self.default.iter())
    }
}

/// All DataBoxes of a worker, built once at startup
pub struct DataBoxRegistry {
    boxes: HashMap<String, Variants>,
}

impl DataBoxRegistry {
    /// Instantiate every variant and run its initialize hook
    pub async fn prepare(definitions: Vec<DataBoxDefinition>, env: &DataBoxEnv) -> Result<Self> {
        let mut boxes: HashMap<String, Variants> = HashMap::new();

        for mut definition in definitions {
            validate_name(&definition.name)?;
            if boxes.contains_key(&definition.name) {
                return Err(Error::Definition(format!(
                    "DataBox {} is declared twice",
                    definition.name
                )));
            }
            if definition.variants.is_empty() {
                definition.variants.push((None, DataBoxConfig::default()));
            }

            let mut variants = Variants::default();
            for (api_level, config) in &definition.variants {
                let core = DataBoxCore::new(definition.name.clone(), *api_level, config, env);
                let instance = match definition.kind {
                    DataBoxKind::Single => AnyDataBox::Single(DataBox::new(core)),
                    DataBoxKind::Family => AnyDataBox::Family(DataBoxFamily::new(core)),
                };

                let slot = match api_level {
                    Some(level) => variants.leveled.insert(*level, instance.clone()),
                    None => variants.default.replace(instance.clone()),
                };
                if slot.is_some() {
                    return Err(Error::Definition(format!(
                        "DataBox {} declares api level {:?} twice",
                        definition.name, api_level
                    )));
                }

                if let Some(initialize) = &config.hooks.initialize {
                    initialize(instance).await?;
                    debug!(databox = %definition.name, api_level = ?api_level, "DataBox initialized");
                }
            }

            info!(
                databox = %definition.name,
                kind = ?definition.kind,
                variants = definition.variants.len(),
                "DataBox prepared"
            );
            boxes.insert(definition.name, variants);
        }

        Ok(Self { boxes })
    }

    pub fn check_exist(&self, name: &str) -> Result<()> {
        if self.boxes.contains_key(name) {
            Ok(())
        } else {
            Err(Error::UnknownDataBox(name.to_string()))
        }
    }

    /// Highest variant whose level is not above `api_level`, else the
    /// default variant
    pub fn get_data_box(&self, name: &str, api_level: u32) -> Result<AnyDataBox> {
        let variants = self
            .boxes
            .get(name)
            .ok_or_else(|| Error::UnknownDataBox(name.to_string()))?;
        variants
            .resolve(api_level)
            .cloned()
            .ok_or_else(|| Error::ApiLevelNotCompatible {
                name: name.to_string(),
                api_level,
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.boxes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every instantiated variant
    pub fn instances(&self) -> impl Iterator<Item = &AnyDataBox> {
        self.boxes.values().flat_map(|v| v.iter())
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Names are the first segment of `DB-<name>-<level>[-<member>]`, so they
/// may not contain the separators used by topics and event keys.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Definition("DataBox name is empty".into()));
    }
    if name.contains(['-', '.']) {
        return Err(Error::Definition(format!(
            "DataBox name {} may not contain '-' or '.'",
            name
        )));
    }
    Ok(())
}

impl std::fmt::Debug for DataBoxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBoxRegistry")
            .field("boxes", &self.names())
            .finish()
    }
}
