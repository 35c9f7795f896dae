//! Module graph of a loaded checkpoint.
//!
//! Each architecture describes its checkpoint as a [`GraphLayout`]: the root
//! modules (embeddings, final norm, head, projectors) and, per block, the
//! weight-bearing modules keyed by a logical name relative to the block. The
//! layout is pure data; [`GraphLayout::load`] materialises it into a
//! [`ModelGraph`] through a `VarBuilder`.
//!
//! Consumers never hold borrows into the graph. They hold [`ModuleRef`]s
//! (block index + logical path) and resolve them against the owning adapter.

use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::shared::weights::Checkpoint;

/// Attention shape of a block, fixed from the model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Self-attention followed by the feed-forward branch.
    Standard,
    /// Attention over another modality's hidden states replaces self-attention.
    CrossAttention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    Rms,
    Layer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleSpec {
    Linear {
        in_dim: usize,
        out_dim: usize,
        bias: bool,
    },
    Norm {
        dim: usize,
        eps: f64,
        kind: NormKind,
    },
    Embedding {
        vocab_size: usize,
        dim: usize,
    },
    PatchEmbedding {
        channels: usize,
        dim: usize,
        patch_size: usize,
        bias: bool,
    },
}

impl ModuleSpec {
    /// Tensors this module reads, relative to its prefix.
    pub fn tensor_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        match *self {
            Self::Linear {
                in_dim,
                out_dim,
                bias,
            } => {
                let mut shapes = vec![("weight", vec![out_dim, in_dim])];
                if bias {
                    shapes.push(("bias", vec![out_dim]));
                }
                shapes
            }
            Self::Norm { dim, kind, .. } => match kind {
                NormKind::Rms => vec![("weight", vec![dim])],
                NormKind::Layer => vec![("weight", vec![dim]), ("bias", vec![dim])],
            },
            Self::Embedding { vocab_size, dim } => vec![("weight", vec![vocab_size, dim])],
            Self::PatchEmbedding {
                channels,
                dim,
                patch_size,
                bias,
            } => {
                let mut shapes = vec![("weight", vec![dim, channels, patch_size, patch_size])];
                if bias {
                    shapes.push(("bias", vec![dim]));
                }
                shapes
            }
        }
    }

    fn load(&self, vb: VarBuilder) -> candle_core::Result<Module> {
        let module = match *self {
            Self::Linear {
                in_dim,
                out_dim,
                bias,
            } => Module::Linear(candle_nn::linear_b(in_dim, out_dim, bias, vb)?),
            Self::Norm { dim, eps, kind } => {
                let weight = vb.get(dim, "weight")?;
                let bias = match kind {
                    NormKind::Rms => None,
                    NormKind::Layer => Some(vb.get(dim, "bias")?),
                };
                Module::Norm(Norm {
                    weight,
                    bias,
                    eps,
                    kind,
                })
            }
            Self::Embedding { vocab_size, dim } => {
                Module::Embedding(candle_nn::embedding(vocab_size, dim, vb)?)
            }
            Self::PatchEmbedding {
                channels,
                dim,
                patch_size,
                bias,
            } => {
                let cfg = Conv2dConfig {
                    stride: patch_size,
                    ..Default::default()
                };
                let conv = if bias {
                    candle_nn::conv2d(channels, dim, patch_size, cfg, vb)?
                } else {
                    candle_nn::conv2d_no_bias(channels, dim, patch_size, cfg, vb)?
                };
                Module::Conv2d(conv)
            }
        };
        Ok(module)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleLayout {
    /// Logical name, relative to the block for block modules.
    pub name: String,
    /// Full checkpoint prefix of the module's tensors.
    pub tensor_prefix: String,
    pub spec: ModuleSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockLayout {
    pub index: usize,
    pub kind: BlockKind,
    pub prefix: String,
    pub modules: Vec<ModuleLayout>,
}

impl BlockLayout {
    pub fn new(index: usize, kind: BlockKind, prefix: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            prefix: prefix.into(),
            modules: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, spec: ModuleSpec) -> &mut Self {
        let name = name.into();
        let tensor_prefix = join_prefix(&self.prefix, &name);
        self.modules.push(ModuleLayout {
            name,
            tensor_prefix,
            spec,
        });
        self
    }

    pub fn linear(&mut self, name: &str, in_dim: usize, out_dim: usize, bias: bool) -> &mut Self {
        self.push(
            name,
            ModuleSpec::Linear {
                in_dim,
                out_dim,
                bias,
            },
        )
    }

    pub fn norm(&mut self, name: &str, dim: usize, eps: f64, kind: NormKind) -> &mut Self {
        self.push(name, ModuleSpec::Norm { dim, eps, kind })
    }

    fn load(&self, vb: &VarBuilder) -> Result<Block> {
        let mut modules = BTreeMap::new();
        for layout in &self.modules {
            let module = load_module(layout, vb)?;
            modules.insert(layout.name.clone(), module);
        }
        Ok(Block {
            index: self.index,
            kind: self.kind,
            modules,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphLayout {
    pub root: Vec<ModuleLayout>,
    pub blocks: Vec<BlockLayout>,
}

impl GraphLayout {
    pub fn root_module(
        &mut self,
        name: impl Into<String>,
        tensor_prefix: impl Into<String>,
        spec: ModuleSpec,
    ) -> &mut Self {
        self.root.push(ModuleLayout {
            name: name.into(),
            tensor_prefix: tensor_prefix.into(),
            spec,
        });
        self
    }

    pub fn push_block(&mut self, block: BlockLayout) -> &mut Self {
        self.blocks.push(block);
        self
    }

    /// Every tensor name and shape the layout expects in the checkpoint.
    pub fn tensor_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.root
            .iter()
            .chain(self.blocks.iter().flat_map(|b| b.modules.iter()))
            .flat_map(|layout| {
                layout
                    .spec
                    .tensor_shapes()
                    .into_iter()
                    .map(|(suffix, shape)| (format!("{}.{suffix}", layout.tensor_prefix), shape))
            })
            .collect()
    }

    /// Tensors the layout expects but the checkpoint does not store.
    pub fn missing_tensors(&self, checkpoint: &Checkpoint) -> Vec<String> {
        self.tensor_shapes()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !checkpoint.contains(name))
            .collect()
    }

    pub fn load(&self, vb: &VarBuilder) -> Result<ModelGraph> {
        let mut root = BTreeMap::new();
        for layout in &self.root {
            root.insert(layout.name.clone(), load_module(layout, vb)?);
        }

        let blocks = self
            .blocks
            .iter()
            .map(|block| block.load(vb))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Loaded module graph: {} root modules, {} blocks",
            root.len(),
            blocks.len()
        );

        Ok(ModelGraph {
            root,
            blocks,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    #[cfg(test)]
    pub(crate) fn zero_tensors(&self, dtype: DType) -> HashMap<String, Tensor> {
        self.tensor_shapes()
            .into_iter()
            .map(|(name, shape)| {
                let tensor = Tensor::zeros(shape, dtype, &Device::Cpu).unwrap();
                (name, tensor)
            })
            .collect()
    }
}

fn load_module(layout: &ModuleLayout, vb: &VarBuilder) -> Result<Module> {
    layout
        .spec
        .load(vb.pp(&layout.tensor_prefix))
        .map_err(|e| Error::ModuleNotFound(format!("{} ({e})", layout.tensor_prefix)))
}

pub fn join_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[derive(Debug, Clone)]
pub struct Norm {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub eps: f64,
    pub kind: NormKind,
}

#[derive(Debug, Clone)]
pub enum Module {
    Linear(Linear),
    Norm(Norm),
    Embedding(Embedding),
    Conv2d(Conv2d),
}

impl Module {
    pub fn weight(&self) -> &Tensor {
        match self {
            Self::Linear(linear) => linear.weight(),
            Self::Norm(norm) => &norm.weight,
            Self::Embedding(embedding) => embedding.embeddings(),
            Self::Conv2d(conv) => conv.weight(),
        }
    }

    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            Self::Linear(linear) => linear.bias(),
            Self::Norm(norm) => norm.bias.as_ref(),
            Self::Embedding(_) => None,
            Self::Conv2d(conv) => conv.bias(),
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    pub fn is_norm(&self) -> bool {
        matches!(self, Self::Norm(_))
    }

    pub fn as_linear(&self) -> Option<&Linear> {
        match self {
            Self::Linear(linear) => Some(linear),
            _ => None,
        }
    }

    pub fn as_norm(&self) -> Option<&Norm> {
        match self {
            Self::Norm(norm) => Some(norm),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Norm(norm) => match norm.kind {
                NormKind::Rms => "rms_norm",
                NormKind::Layer => "layer_norm",
            },
            Self::Embedding(_) => "embedding",
            Self::Conv2d(_) => "conv2d",
        }
    }
}

/// Where a [`ModuleRef`] points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Block(usize),
    Model,
}

/// Serializable, borrow-free reference to a module (or a parent of modules).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleRef {
    pub scope: Scope,
    pub path: String,
}

impl ModuleRef {
    pub fn block(index: usize, path: impl Into<String>) -> Self {
        Self {
            scope: Scope::Block(index),
            path: path.into(),
        }
    }

    pub fn model(path: impl Into<String>) -> Self {
        Self {
            scope: Scope::Model,
            path: path.into(),
        }
    }

    pub fn block_index(&self) -> Option<usize> {
        match self.scope {
            Scope::Block(index) => Some(index),
            Scope::Model => None,
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Block(index) => write!(f, "blocks.{index}.{}", self.path),
            Scope::Model => f.write_str(&self.path),
        }
    }
}

/// A resolved reference: one module, or every module below a parent path.
#[derive(Debug, Clone)]
pub enum ModuleView<'a> {
    Module(&'a Module),
    Group(Vec<(&'a str, &'a Module)>),
}

impl<'a> ModuleView<'a> {
    pub fn as_module(&self) -> Option<&'a Module> {
        match self {
            Self::Module(module) => Some(*module),
            Self::Group(_) => None,
        }
    }

    pub fn modules(&self) -> Vec<&'a Module> {
        match self {
            Self::Module(module) => vec![*module],
            Self::Group(children) => children.iter().map(|(_, module)| *module).collect(),
        }
    }
}

fn resolve_in<'a>(modules: &'a BTreeMap<String, Module>, path: &str) -> Option<ModuleView<'a>> {
    if let Some(module) = modules.get(path) {
        return Some(ModuleView::Module(module));
    }
    let prefix = format!("{path}.");
    let children: Vec<(&str, &Module)> = modules
        .range(prefix.clone()..)
        .take_while(|(name, _)| name.starts_with(&prefix))
        .map(|(name, module)| (name.as_str(), module))
        .collect();
    if children.is_empty() {
        None
    } else {
        Some(ModuleView::Group(children))
    }
}

/// One repeating layer of the model, owned by its [`ModelGraph`].
#[derive(Debug, Clone)]
pub struct Block {
    index: usize,
    kind: BlockKind,
    modules: BTreeMap<String, Module>,
}

impl Block {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn module(&self, name: &str) -> Result<&Module> {
        self.modules
            .get(name)
            .ok_or_else(|| Error::ModuleNotFound(format!("blocks.{}.{name}", self.index)))
    }

    pub fn linear(&self, name: &str) -> Result<&Linear> {
        self.module(name)?.as_linear().ok_or_else(|| {
            Error::InvalidInput(format!(
                "blocks.{}.{name} is not a linear projection",
                self.index
            ))
        })
    }

    pub fn resolve(&self, path: &str) -> Result<ModuleView<'_>> {
        resolve_in(&self.modules, path)
            .ok_or_else(|| Error::ModuleNotFound(format!("blocks.{}.{path}", self.index)))
    }

    pub fn contains(&self, path: &str) -> bool {
        resolve_in(&self.modules, path).is_some()
    }

    /// Reference to `path` in this block, checked to resolve.
    pub fn reference(&self, path: &str) -> Result<ModuleRef> {
        self.resolve(path)?;
        Ok(ModuleRef::block(self.index, path))
    }
}

#[derive(Debug, Clone)]
pub struct ModelGraph {
    root: BTreeMap<String, Module>,
    blocks: Vec<Block>,
    device: Device,
    dtype: DType,
}

impl ModelGraph {
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Result<&Block> {
        self.blocks.get(index).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Block index {index} out of range ({} blocks)",
                self.blocks.len()
            ))
        })
    }

    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    pub fn root_module(&self, name: &str) -> Result<&Module> {
        self.root
            .get(name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    pub fn has_root(&self, name: &str) -> bool {
        self.root.contains_key(name)
    }

    pub fn resolve(&self, reference: &ModuleRef) -> Result<ModuleView<'_>> {
        match reference.scope {
            Scope::Block(index) => self.block(index)?.resolve(&reference.path),
            Scope::Model => resolve_in(&self.root, &reference.path)
                .ok_or_else(|| Error::ModuleNotFound(reference.to_string())),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Precision of the loaded parameters, read from the weights themselves.
    pub fn param_dtype(&self) -> DType {
        self.blocks
            .iter()
            .flat_map(|block| block.modules.values())
            .chain(self.root.values())
            .map(|module| module.weight().dtype())
            .next()
            .unwrap_or(self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_layout() -> GraphLayout {
        let mut layout = GraphLayout::default();
        layout.root_module(
            "embed_tokens",
            "model.embed_tokens",
            ModuleSpec::Embedding {
                vocab_size: 10,
                dim: 4,
            },
        );
        let mut block = BlockLayout::new(0, BlockKind::Standard, "model.layers.0");
        block
            .norm("input_layernorm", 4, 1e-6, NormKind::Rms)
            .linear("self_attn.q_proj", 4, 4, false)
            .linear("self_attn.k_proj", 4, 2, true);
        layout.push_block(block);
        layout
    }

    #[test]
    fn tensor_shapes_follow_prefixes() {
        let shapes: BTreeMap<String, Vec<usize>> = tiny_layout().tensor_shapes().into_iter().collect();
        assert_eq!(shapes["model.embed_tokens.weight"], vec![10, 4]);
        assert_eq!(shapes["model.layers.0.self_attn.q_proj.weight"], vec![4, 4]);
        assert_eq!(shapes["model.layers.0.self_attn.k_proj.bias"], vec![2]);
        assert!(!shapes.contains_key("model.layers.0.self_attn.q_proj.bias"));
        assert_eq!(shapes["model.layers.0.input_layernorm.weight"], vec![4]);
    }

    #[test]
    fn resolves_modules_and_groups() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let graph = tiny_layout().load(&vb).unwrap();
        let block = graph.block(0).unwrap();

        assert!(block.module("self_attn.q_proj").unwrap().is_linear());
        assert!(block.module("input_layernorm").unwrap().is_norm());

        match block.resolve("self_attn").unwrap() {
            ModuleView::Group(children) => {
                let names: Vec<&str> = children.iter().map(|(name, _)| *name).collect();
                assert_eq!(names, vec!["self_attn.k_proj", "self_attn.q_proj"]);
            }
            ModuleView::Module(_) => panic!("expected a group"),
        }

        assert!(block.resolve("self_att").is_err());
        assert!(block.linear("input_layernorm").is_err());
        assert!(graph.block(1).is_err());
    }

    #[test]
    fn graph_resolves_root_and_block_refs() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let graph = tiny_layout().load(&vb).unwrap();

        let embed = graph.resolve(&ModuleRef::model("embed_tokens")).unwrap();
        assert_eq!(embed.as_module().unwrap().kind_name(), "embedding");

        let q = ModuleRef::block(0, "self_attn.q_proj");
        assert_eq!(q.to_string(), "blocks.0.self_attn.q_proj");
        assert!(graph.resolve(&q).is_ok());
        assert!(graph.resolve(&ModuleRef::block(3, "self_attn.q_proj")).is_err());
        assert_eq!(graph.param_dtype(), DType::F32);
    }

    #[test]
    fn module_ref_round_trips_through_json() {
        let reference = ModuleRef::block(2, "mlp.up_proj");
        let json = serde_json::to_string(&reference).unwrap();
        let back: ModuleRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
