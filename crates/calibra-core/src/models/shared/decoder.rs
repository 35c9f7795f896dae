//! Llama-style decoder layout shared by the text backbones.
//!
//! Llama, Mistral, Qwen2 and the text halves of Llava and Mllama all store
//! `{prefix}.layers.N.{input_layernorm, self_attn.*, post_attention_layernorm,
//! mlp.*}` and differ only in projection biases and checkpoint prefixes.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::shared::graph::{
    join_prefix, Block, BlockKind, BlockLayout, GraphLayout, ModuleSpec, NormKind,
};
use crate::models::shared::subset::{norm_set, NormSet, Subset, SubsetBuilder};
use crate::models::shared::weights::Checkpoint;

pub const DECODER_NORMS: [&str; 2] = ["input_layernorm", "post_attention_layernorm"];

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub mlp_bias: bool,
}

fn default_hidden_size() -> usize {
    4096
}

fn default_intermediate_size() -> usize {
    11008
}

fn default_num_attention_heads() -> usize {
    32
}

fn default_num_hidden_layers() -> usize {
    32
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_vocab_size() -> usize {
    32000
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads() * self.head_dim()
    }
}

/// Which projections carry a bias vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionBias {
    pub qkv: bool,
    pub o: bool,
    pub mlp: bool,
}

impl ProjectionBias {
    /// Llama convention: `attention_bias` covers all four attention
    /// projections, `mlp_bias` the feed-forward ones.
    pub fn from_config(cfg: &DecoderConfig) -> Self {
        Self {
            qkv: cfg.attention_bias,
            o: cfg.attention_bias,
            mlp: cfg.mlp_bias,
        }
    }
}

/// Where the decoder's tensors live in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderPrefixes {
    /// Prefix of `embed_tokens`, `layers` and `norm`
    pub model: String,
    /// Prefix of the output head, `None` when tied to the embeddings
    pub lm_head: Option<String>,
}

impl DecoderPrefixes {
    pub fn detect(
        checkpoint: &Checkpoint,
        model_candidates: &[&str],
        head_candidates: &[&str],
        tie_word_embeddings: bool,
    ) -> Result<Self> {
        let model = checkpoint
            .detect_prefix(model_candidates, "layers.")
            .ok_or_else(|| {
                Error::model_load(
                    checkpoint.dir(),
                    format!("No decoder layers found under any of {model_candidates:?}"),
                )
            })?;

        let lm_head = head_candidates
            .iter()
            .find(|head| checkpoint.contains(&format!("{head}.weight")))
            .map(|head| head.to_string());
        if lm_head.is_none() && !tie_word_embeddings {
            warn!("No output head found in checkpoint; treating embeddings as tied");
        }

        debug!(
            "Decoder prefix '{}', lm_head {:?}",
            model, lm_head
        );

        Ok(Self {
            model: model.to_string(),
            lm_head: if tie_word_embeddings { None } else { lm_head },
        })
    }

    pub fn layer(&self, index: usize) -> String {
        join_prefix(&self.model, &format!("layers.{index}"))
    }
}

pub fn attention_projections(
    block: &mut BlockLayout,
    cfg: &DecoderConfig,
    path: &str,
    bias: ProjectionBias,
) {
    let hidden = cfg.hidden_size;
    block
        .linear(&format!("{path}.q_proj"), hidden, cfg.q_dim(), bias.qkv)
        .linear(&format!("{path}.k_proj"), hidden, cfg.kv_dim(), bias.qkv)
        .linear(&format!("{path}.v_proj"), hidden, cfg.kv_dim(), bias.qkv)
        .linear(&format!("{path}.o_proj"), cfg.q_dim(), hidden, bias.o);
}

pub fn dense_mlp(block: &mut BlockLayout, cfg: &DecoderConfig, bias: bool) {
    let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
    block
        .linear("mlp.gate_proj", hidden, inter, bias)
        .linear("mlp.up_proj", hidden, inter, bias)
        .linear("mlp.down_proj", inter, hidden, bias);
}

pub fn decoder_norms(block: &mut BlockLayout, cfg: &DecoderConfig) {
    for role in DECODER_NORMS {
        block.norm(role, cfg.hidden_size, cfg.rms_norm_eps, NormKind::Rms);
    }
}

pub fn standard_block(
    index: usize,
    prefixes: &DecoderPrefixes,
    cfg: &DecoderConfig,
    bias: ProjectionBias,
) -> BlockLayout {
    let mut block = BlockLayout::new(index, BlockKind::Standard, prefixes.layer(index));
    decoder_norms(&mut block, cfg);
    attention_projections(&mut block, cfg, "self_attn", bias);
    dense_mlp(&mut block, cfg, bias.mlp);
    block
}

/// Embeddings, final norm and (untied) head of a decoder.
pub fn decoder_root(
    layout: &mut GraphLayout,
    prefixes: &DecoderPrefixes,
    cfg: &DecoderConfig,
    embedding_rows: usize,
) {
    layout
        .root_module(
            "embed_tokens",
            join_prefix(&prefixes.model, "embed_tokens"),
            ModuleSpec::Embedding {
                vocab_size: embedding_rows,
                dim: cfg.hidden_size,
            },
        )
        .root_module(
            "norm",
            join_prefix(&prefixes.model, "norm"),
            ModuleSpec::Norm {
                dim: cfg.hidden_size,
                eps: cfg.rms_norm_eps,
                kind: NormKind::Rms,
            },
        );
    if let Some(head) = &prefixes.lm_head {
        layout.root_module(
            "lm_head",
            head.clone(),
            ModuleSpec::Linear {
                in_dim: cfg.hidden_size,
                out_dim: cfg.vocab_size,
                bias: false,
            },
        );
    }
}

/// Full layout of a decoder whose blocks are all standard.
pub fn decoder_layout(
    cfg: &DecoderConfig,
    prefixes: &DecoderPrefixes,
    bias: ProjectionBias,
) -> GraphLayout {
    let mut layout = GraphLayout::default();
    decoder_root(&mut layout, prefixes, cfg, cfg.vocab_size);
    for index in 0..cfg.num_hidden_layers {
        layout.push_block(standard_block(index, prefixes, cfg, bias));
    }
    layout
}

pub fn decoder_norm_set(block: &Block) -> Result<NormSet> {
    norm_set(block, &DECODER_NORMS)
}

/// QKV and output-projection subsets of self-attention.
pub fn attention_subsets(block: &Block) -> Result<Vec<Subset>> {
    Ok(vec![
        SubsetBuilder::new(block)
            .layers(["self_attn.q_proj", "self_attn.k_proj", "self_attn.v_proj"])
            .prev_op(["input_layernorm"])
            .input("self_attn.q_proj")
            .inspect("self_attn")
            .with_kwargs()
            .build()?,
        SubsetBuilder::new(block)
            .layers(["self_attn.o_proj"])
            .prev_op(["self_attn.v_proj"])
            .input("self_attn.o_proj")
            .inspect("self_attn.o_proj")
            .build()?,
    ])
}

/// Gate/up and down-projection subsets of the feed-forward branch.
pub fn mlp_subsets(block: &Block) -> Result<Vec<Subset>> {
    Ok(vec![
        SubsetBuilder::new(block)
            .layers(["mlp.gate_proj", "mlp.up_proj"])
            .prev_op(["post_attention_layernorm"])
            .input("mlp.gate_proj")
            .inspect("mlp")
            .mlp()
            .build()?,
        SubsetBuilder::new(block)
            .layers(["mlp.down_proj"])
            .prev_op(["mlp.up_proj"])
            .input("mlp.down_proj")
            .inspect("mlp.down_proj")
            .mlp()
            .build()?,
    ])
}

pub fn standard_subsets(block: &Block) -> Result<Vec<Subset>> {
    let mut subsets = attention_subsets(block)?;
    subsets.extend(mlp_subsets(block)?);
    Ok(subsets)
}
