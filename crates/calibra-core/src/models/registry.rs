//! Registry of compiled-in model adapters.
//!
//! The table is built once by [`AdapterRegistry::builtin`] and never changes
//! afterwards. Lookups are exact: identifiers (`Mllama`) through
//! [`AdapterRegistry::resolve`], declared `model_type` strings (`mllama`)
//! through [`AdapterRegistry::resolve_model_type`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{ModelAdapter, RegisteredAdapter};
use crate::models::architectures;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Vision,
    VisionLanguage,
}

impl Modality {
    pub fn is_multimodal(&self) -> bool {
        matches!(self, Self::VisionLanguage)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::VisionLanguage => "vision-language",
        };
        f.write_str(label)
    }
}

pub type AdapterConstructor = fn(&AdapterConfig) -> Result<Box<dyn ModelAdapter>>;

#[derive(Clone, Copy)]
pub struct AdapterEntry {
    pub name: &'static str,
    pub model_types: &'static [&'static str],
    pub modality: Modality,
    construct: AdapterConstructor,
}

impl AdapterEntry {
    pub fn of<A: RegisteredAdapter>() -> Self {
        Self {
            name: A::NAME,
            model_types: A::MODEL_TYPES,
            modality: A::MODALITY,
            construct: construct::<A>,
        }
    }

    pub fn build(&self, config: &AdapterConfig) -> Result<Box<dyn ModelAdapter>> {
        (self.construct)(config)
    }
}

fn construct<A: RegisteredAdapter>(config: &AdapterConfig) -> Result<Box<dyn ModelAdapter>> {
    Ok(Box::new(A::build_model(config)?))
}

impl PartialEq for AdapterEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.model_types == other.model_types
            && self.modality == other.modality
    }
}

impl fmt::Debug for AdapterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterEntry")
            .field("name", &self.name)
            .field("model_types", &self.model_types)
            .field("modality", &self.modality)
            .finish()
    }
}

#[derive(Debug)]
pub struct AdapterRegistry {
    entries: HashMap<&'static str, AdapterEntry>,
    model_types: HashMap<&'static str, &'static str>,
}

static GLOBAL: OnceLock<AdapterRegistry> = OnceLock::new();

impl AdapterRegistry {
    /// Registry of every adapter compiled into the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_entries(architectures::builtin_entries())
    }

    /// Process-wide builtin registry, built on first use.
    pub fn global() -> Result<&'static Self> {
        if let Some(registry) = GLOBAL.get() {
            return Ok(registry);
        }
        let registry = Self::builtin()?;
        Ok(GLOBAL.get_or_init(|| registry))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AdapterEntry>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut model_types = HashMap::new();
        for entry in entries {
            if by_name.insert(entry.name, entry).is_some() {
                return Err(Error::ConfigError(format!(
                    "Adapter '{}' registered twice",
                    entry.name
                )));
            }
            for model_type in entry.model_types {
                if let Some(previous) = model_types.insert(*model_type, entry.name) {
                    return Err(Error::ConfigError(format!(
                        "model_type '{model_type}' claimed by both '{previous}' and '{}'",
                        entry.name
                    )));
                }
            }
            debug!("Registered adapter {} ({})", entry.name, entry.modality);
        }
        Ok(Self {
            entries: by_name,
            model_types,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<&AdapterEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))
    }

    pub fn resolve_model_type(&self, model_type: &str) -> Result<&AdapterEntry> {
        self.model_types
            .get(model_type)
            .and_then(|name| self.entries.get(name))
            .ok_or_else(|| Error::UnknownArchitecture(model_type.to_string()))
    }

    /// Construct the adapter `config` names, or the one matching the
    /// checkpoint's declared `model_type` when no name is given.
    pub fn build(&self, config: &AdapterConfig) -> Result<Box<dyn ModelAdapter>> {
        let entry = match config.model_type.as_deref() {
            Some(name) => self.resolve(name)?,
            None => {
                let model_type = read_model_type(config)?;
                self.resolve_model_type(&model_type)?
            }
        };
        entry.build(config)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn entries(&self) -> Vec<&AdapterEntry> {
        let mut entries: Vec<&AdapterEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.name);
        entries
    }
}

fn read_model_type(config: &AdapterConfig) -> Result<String> {
    let path = config.model_path.join("config.json");
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::model_load(&config.model_path, format!("config.json: {e}")))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| Error::model_load(&config.model_path, format!("config.json: {e}")))?;
    value
        .get("model_type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::model_load(&config.model_path, "config.json does not declare a model_type")
        })
}
