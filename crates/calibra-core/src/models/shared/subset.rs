//! Subset and normalization-set descriptions handed to calibration passes.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::shared::graph::{Block, ModuleRef};

/// Keyword names the calibration harness uses when replaying a forward call.
pub mod kwargs {
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const PAST_KEY_VALUE: &str = "past_key_value";
    pub const CACHE_POSITION: &str = "cache_position";
    pub const OUTPUT_ATTENTIONS: &str = "output_attentions";
    pub const CROSS_ATTENTION_STATES: &str = "cross_attention_states";
}

/// Normalization modules of one block, keyed by role.
pub type NormSet = BTreeMap<String, ModuleRef>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetLayer {
    pub name: String,
    pub module: ModuleRef,
}

/// Linear projections calibrated together, with their data-flow context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub layers: Vec<SubsetLayer>,
    pub prev_op: Vec<ModuleRef>,
    pub input: Vec<String>,
    pub inspect: ModuleRef,
    pub has_kwargs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_keys: Option<BTreeMap<String, String>>,
    pub is_mlp: bool,
}

impl Subset {
    pub fn layer(&self, name: &str) -> Option<&ModuleRef> {
        self.layers
            .iter()
            .find(|layer| layer.name == name)
            .map(|layer| &layer.module)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|layer| layer.name.as_str())
    }
}

/// Builds a [`Subset`] against the block it describes.
///
/// Names are block-relative module paths. `build` checks that every layer is
/// a linear projection of the block, that `input` names are layers, and that
/// `prev_op` and `inspect` targets resolve in the same block.
pub struct SubsetBuilder<'a> {
    block: &'a Block,
    layers: Vec<String>,
    prev_op: Vec<String>,
    input: Vec<String>,
    inspect: Option<String>,
    has_kwargs: bool,
    sub_keys: Option<BTreeMap<String, String>>,
    is_mlp: bool,
}

impl<'a> SubsetBuilder<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self {
            block,
            layers: Vec::new(),
            prev_op: Vec::new(),
            input: Vec::new(),
            inspect: None,
            has_kwargs: false,
            sub_keys: None,
            is_mlp: false,
        }
    }

    pub fn layers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn prev_op<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prev_op.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.input.push(name.into());
        self
    }

    pub fn inspect(mut self, name: impl Into<String>) -> Self {
        self.inspect = Some(name.into());
        self
    }

    pub fn with_kwargs(mut self) -> Self {
        self.has_kwargs = true;
        self
    }

    pub fn sub_keys(mut self, sub_keys: BTreeMap<String, String>) -> Self {
        self.sub_keys = Some(sub_keys);
        self
    }

    pub fn mlp(mut self) -> Self {
        self.is_mlp = true;
        self
    }

    pub fn build(self) -> Result<Subset> {
        let index = self.block.index();
        if self.layers.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Subset in block {index} has no layers"
            )));
        }

        let mut seen = HashSet::new();
        let mut layers = Vec::with_capacity(self.layers.len());
        for name in self.layers {
            if !seen.insert(name.clone()) {
                return Err(Error::InvalidInput(format!(
                    "Layer {name} listed twice in a subset of block {index}"
                )));
            }
            self.block.linear(&name)?;
            let module = ModuleRef::block(index, name.as_str());
            layers.push(SubsetLayer { name, module });
        }

        if self.input.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Subset in block {index} declares no input layer"
            )));
        }
        if let Some(name) = self.input.iter().find(|name| !seen.contains(*name)) {
            return Err(Error::InvalidInput(format!(
                "Input {name} is not a layer of its subset in block {index}"
            )));
        }

        let prev_op = self
            .prev_op
            .iter()
            .map(|name| self.block.reference(name))
            .collect::<Result<Vec<_>>>()?;

        let inspect = match self.inspect {
            Some(name) => self.block.reference(&name)?,
            None => {
                return Err(Error::InvalidInput(format!(
                    "Subset in block {index} has no inspect target"
                )))
            }
        };

        if self.sub_keys.is_some() && !self.has_kwargs {
            return Err(Error::InvalidInput(format!(
                "Subset in block {index} renames keywords but takes none"
            )));
        }

        Ok(Subset {
            layers,
            prev_op,
            input: self.input,
            inspect,
            has_kwargs: self.has_kwargs,
            sub_keys: self.sub_keys,
            is_mlp: self.is_mlp,
        })
    }
}

/// Fails when a projection appears in more than one subset.
pub fn ensure_disjoint(subsets: &[Subset]) -> Result<()> {
    let mut seen = HashSet::new();
    for layer in subsets.iter().flat_map(|subset| subset.layers.iter()) {
        if !seen.insert(&layer.module) {
            return Err(Error::InvalidInput(format!(
                "{} belongs to more than one subset",
                layer.module
            )));
        }
    }
    Ok(())
}

/// Norm set for `roles`, each a normalization module of `block`.
pub fn norm_set(block: &Block, roles: &[&str]) -> Result<NormSet> {
    roles
        .iter()
        .map(|role| {
            let module = block.module(role)?;
            if !module.is_norm() {
                return Err(Error::InvalidInput(format!(
                    "blocks.{}.{role} is not a normalization layer",
                    block.index()
                )));
            }
            Ok((role.to_string(), ModuleRef::block(block.index(), *role)))
        })
        .collect()
}
