//! InternLM2 decoder with fused query/key/value projection.

use serde::Deserialize;

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{root_refs, LoadedModel, ModelAdapter, ModelSource, RegisteredAdapter};
use crate::models::registry::Modality;
use crate::models::shared::decoder::DecoderConfig;
use crate::models::shared::graph::{
    join_prefix, Block, BlockKind, BlockLayout, GraphLayout, ModuleRef, ModuleSpec, NormKind,
};
use crate::models::shared::subset::{norm_set, NormSet, Subset, SubsetBuilder};

const NORMS: [&str; 2] = ["attention_norm", "ffn_norm"];

#[derive(Debug, Clone, Deserialize)]
pub struct InternLM2Config {
    #[serde(flatten)]
    pub decoder: DecoderConfig,
    /// Bias on the attention projections
    #[serde(default = "default_bias")]
    pub bias: bool,
}

fn default_bias() -> bool {
    true
}

pub struct InternLM2 {
    loaded: LoadedModel,
    text_config: InternLM2Config,
}

impl InternLM2 {
    pub fn text_config(&self) -> &InternLM2Config {
        &self.text_config
    }

    pub fn layout(cfg: &InternLM2Config, prefix: &str, with_output: bool) -> GraphLayout {
        let d = &cfg.decoder;
        let (hidden, inter) = (d.hidden_size, d.intermediate_size);
        let qkv_dim = d.q_dim() + 2 * d.kv_dim();

        let mut layout = GraphLayout::default();
        layout
            .root_module(
                "tok_embeddings",
                join_prefix(prefix, "tok_embeddings"),
                ModuleSpec::Embedding {
                    vocab_size: d.vocab_size,
                    dim: hidden,
                },
            )
            .root_module(
                "norm",
                join_prefix(prefix, "norm"),
                ModuleSpec::Norm {
                    dim: hidden,
                    eps: d.rms_norm_eps,
                    kind: NormKind::Rms,
                },
            );
        if with_output {
            layout.root_module(
                "output",
                "output",
                ModuleSpec::Linear {
                    in_dim: hidden,
                    out_dim: d.vocab_size,
                    bias: false,
                },
            );
        }

        for index in 0..d.num_hidden_layers {
            let mut block = BlockLayout::new(
                index,
                BlockKind::Standard,
                join_prefix(prefix, &format!("layers.{index}")),
            );
            block
                .norm("attention_norm", hidden, d.rms_norm_eps, NormKind::Rms)
                .norm("ffn_norm", hidden, d.rms_norm_eps, NormKind::Rms)
                .linear("attention.wqkv", hidden, qkv_dim, cfg.bias)
                .linear("attention.wo", d.q_dim(), hidden, cfg.bias)
                .linear("feed_forward.w1", hidden, inter, false)
                .linear("feed_forward.w3", hidden, inter, false)
                .linear("feed_forward.w2", inter, hidden, false);
            layout.push_block(block);
        }
        layout
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, Self::MODEL_TYPES)?;
        let text_config: InternLM2Config = source.parse_config()?;
        let prefix = source
            .checkpoint
            .detect_prefix(&["model", ""], "layers.")
            .ok_or_else(|| Error::model_load(&config.model_path, "No InternLM2 layers found"))?;
        let with_output =
            !text_config.decoder.tie_word_embeddings && source.checkpoint.contains("output.weight");

        let layout = Self::layout(&text_config, prefix, with_output);
        let (loaded, _) = source.load(&layout, config.use_cache)?;
        Ok(Self {
            loaded,
            text_config,
        })
    }
}

impl ModelAdapter for InternLM2 {
    fn architecture(&self) -> &'static str {
        Self::NAME
    }

    fn loaded(&self) -> &LoadedModel {
        &self.loaded
    }

    fn layernorms_in_block(&self, block: &Block) -> Result<NormSet> {
        norm_set(block, &NORMS)
    }

    fn subsets_in_block(&self, block: &Block) -> Result<Vec<Subset>> {
        Ok(vec![
            SubsetBuilder::new(block)
                .layers(["attention.wqkv"])
                .prev_op(["attention_norm"])
                .input("attention.wqkv")
                .inspect("attention")
                .with_kwargs()
                .build()?,
            SubsetBuilder::new(block)
                .layers(["attention.wo"])
                .prev_op(["attention.wqkv"])
                .input("attention.wo")
                .inspect("attention.wo")
                .build()?,
            SubsetBuilder::new(block)
                .layers(["feed_forward.w1", "feed_forward.w3"])
                .prev_op(["ffn_norm"])
                .input("feed_forward.w1")
                .inspect("feed_forward")
                .mlp()
                .build()?,
            SubsetBuilder::new(block)
                .layers(["feed_forward.w2"])
                .prev_op(["feed_forward.w3"])
                .input("feed_forward.w2")
                .inspect("feed_forward.w2")
                .mlp()
                .build()?,
        ])
    }

    fn embed_layers(&self) -> Vec<ModuleRef> {
        root_refs(&self.loaded, &["tok_embeddings"])
    }

    fn head_layers(&self) -> Vec<ModuleRef> {
        root_refs(&self.loaded, &["output"])
    }
}

impl RegisteredAdapter for InternLM2 {
    const NAME: &'static str = "InternLM2";
    const MODEL_TYPES: &'static [&'static str] = &["internlm2"];
    const MODALITY: Modality = Modality::Text;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": "internlm2",
        "hidden_size": 8,
        "intermediate_size": 12,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "num_hidden_layers": 2,
        "vocab_size": 16,
        "bias": false
    });
    fixtures::write_config(dir, &config);
    let cfg: InternLM2Config = serde_json::from_value(config).unwrap();
    fixtures::write_weights(dir, &InternLM2::layout(&cfg, "model", true), &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::subset::ensure_disjoint;

    #[test]
    fn fused_qkv_has_combined_width() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter =
            InternLM2::build_model(&AdapterConfig::new("InternLM2", dir.path()).with_device("cpu"))
                .unwrap();
        let block = &adapter.blocks()[0];
        let wqkv = block.module("attention.wqkv").unwrap();
        // 2 query heads + 2 * 1 kv head, head_dim 4
        assert_eq!(wqkv.weight().dims(), &[16, 8]);
        assert!(!adapter.text_config().bias);
    }

    #[test]
    fn subsets_follow_fused_attention_and_mlp() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter =
            InternLM2::build_model(&AdapterConfig::new("InternLM2", dir.path()).with_device("cpu"))
                .unwrap();
        let block = adapter.block(1).unwrap();
        let subsets = adapter.subsets_in_block(block).unwrap();
        assert_eq!(subsets.len(), 4);
        ensure_disjoint(&subsets).unwrap();
        assert_eq!(subsets[1].prev_op, vec![ModuleRef::block(1, "attention.wqkv")]);
        assert_eq!(subsets[3].prev_op, vec![ModuleRef::block(1, "feed_forward.w3")]);
        assert!(subsets[2].is_mlp && subsets[3].is_mlp);

        let norms = adapter.layernorms_in_block(block).unwrap();
        assert!(norms.contains_key("attention_norm") && norms.contains_key("ffn_norm"));
        assert_eq!(adapter.embed_layers(), vec![ModuleRef::model("tok_embeddings")]);
        assert_eq!(adapter.head_layers(), vec![ModuleRef::model("output")]);
    }
}
