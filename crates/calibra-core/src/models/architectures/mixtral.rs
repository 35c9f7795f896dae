//! Mixtral sparse mixture-of-experts decoder.

use serde::Deserialize;

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::models::adapter::{LoadedModel, ModelAdapter, ModelSource, RegisteredAdapter};
use crate::models::registry::Modality;
use crate::models::shared::decoder::{
    attention_projections, attention_subsets, decoder_norm_set, decoder_norms, decoder_root,
    DecoderConfig, DecoderPrefixes, ProjectionBias,
};
use crate::models::shared::graph::{Block, BlockKind, BlockLayout, GraphLayout};
use crate::models::shared::subset::{NormSet, Subset, SubsetBuilder};

#[derive(Debug, Clone, Deserialize)]
pub struct MixtralConfig {
    #[serde(flatten)]
    pub decoder: DecoderConfig,
    #[serde(default = "default_num_local_experts")]
    pub num_local_experts: usize,
    #[serde(default = "default_num_experts_per_tok")]
    pub num_experts_per_tok: usize,
}

fn default_num_local_experts() -> usize {
    8
}

fn default_num_experts_per_tok() -> usize {
    2
}

fn expert(index: usize, name: &str) -> String {
    format!("block_sparse_moe.experts.{index}.{name}")
}

pub struct Mixtral {
    loaded: LoadedModel,
    text_config: MixtralConfig,
}

impl Mixtral {
    pub fn text_config(&self) -> &MixtralConfig {
        &self.text_config
    }

    pub fn layout(cfg: &MixtralConfig, prefixes: &DecoderPrefixes) -> GraphLayout {
        let d = &cfg.decoder;
        let (hidden, inter) = (d.hidden_size, d.intermediate_size);

        let mut layout = GraphLayout::default();
        decoder_root(&mut layout, prefixes, d, d.vocab_size);
        for index in 0..d.num_hidden_layers {
            let mut block = BlockLayout::new(index, BlockKind::Standard, prefixes.layer(index));
            decoder_norms(&mut block, d);
            attention_projections(&mut block, d, "self_attn", ProjectionBias::default());
            block.linear("block_sparse_moe.gate", hidden, cfg.num_local_experts, false);
            for e in 0..cfg.num_local_experts {
                block
                    .linear(&expert(e, "w1"), hidden, inter, false)
                    .linear(&expert(e, "w3"), hidden, inter, false)
                    .linear(&expert(e, "w2"), inter, hidden, false);
            }
            layout.push_block(block);
        }
        layout
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, Self::MODEL_TYPES)?;
        let text_config: MixtralConfig = source.parse_config()?;
        let prefixes = DecoderPrefixes::detect(
            &source.checkpoint,
            &["model", ""],
            &["lm_head"],
            text_config.decoder.tie_word_embeddings,
        )?;
        let layout = Self::layout(&text_config, &prefixes);
        let (loaded, _) = source.load(&layout, config.use_cache)?;
        Ok(Self {
            loaded,
            text_config,
        })
    }
}

impl ModelAdapter for Mixtral {
    fn architecture(&self) -> &'static str {
        Self::NAME
    }

    fn loaded(&self) -> &LoadedModel {
        &self.loaded
    }

    fn layernorms_in_block(&self, block: &Block) -> Result<NormSet> {
        decoder_norm_set(block)
    }

    /// Attention subsets, then the router with every expert's w1/w3 (they
    /// all read the post-attention norm output), then one w2 subset per
    /// expert chained from that expert's w3.
    fn subsets_in_block(&self, block: &Block) -> Result<Vec<Subset>> {
        let experts = self.text_config.num_local_experts;
        let mut subsets = attention_subsets(block)?;

        let mut gate_up = vec!["block_sparse_moe.gate".to_string()];
        for e in 0..experts {
            gate_up.push(expert(e, "w1"));
            gate_up.push(expert(e, "w3"));
        }
        subsets.push(
            SubsetBuilder::new(block)
                .layers(gate_up)
                .prev_op(["post_attention_layernorm"])
                .input("block_sparse_moe.gate")
                .inspect("block_sparse_moe")
                .mlp()
                .build()?,
        );

        for e in 0..experts {
            subsets.push(
                SubsetBuilder::new(block)
                    .layers([expert(e, "w2")])
                    .prev_op([expert(e, "w3")])
                    .input(expert(e, "w2"))
                    .inspect(expert(e, "w2"))
                    .mlp()
                    .build()?,
            );
        }
        Ok(subsets)
    }
}

impl RegisteredAdapter for Mixtral {
    const NAME: &'static str = "Mixtral";
    const MODEL_TYPES: &'static [&'static str] = &["mixtral"];
    const MODALITY: Modality = Modality::Text;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": "mixtral",
        "hidden_size": 8,
        "intermediate_size": 12,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "num_hidden_layers": 1,
        "vocab_size": 16,
        "num_local_experts": 3
    });
    fixtures::write_config(dir, &config);
    let cfg: MixtralConfig = serde_json::from_value(config).unwrap();
    let prefixes = DecoderPrefixes {
        model: "model".to_string(),
        lm_head: Some("lm_head".to_string()),
    };
    fixtures::write_weights(dir, &Mixtral::layout(&cfg, &prefixes), &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::graph::ModuleRef;
    use crate::models::shared::subset::ensure_disjoint;

    #[test]
    fn experts_get_grouped_up_and_separate_down_subsets() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter =
            Mixtral::build_model(&AdapterConfig::new("Mixtral", dir.path()).with_device("cpu"))
                .unwrap();
        assert_eq!(adapter.text_config().num_experts_per_tok, 2);

        let block = &adapter.blocks()[0];
        let subsets = adapter.subsets_in_block(block).unwrap();
        // qkv, o, router + w1/w3, one w2 per expert
        assert_eq!(subsets.len(), 2 + 1 + 3);
        ensure_disjoint(&subsets).unwrap();

        let moe = &subsets[2];
        assert_eq!(moe.layers.len(), 1 + 2 * 3);
        assert_eq!(moe.input, vec!["block_sparse_moe.gate"]);
        assert_eq!(moe.inspect, ModuleRef::block(0, "block_sparse_moe"));

        for (e, subset) in subsets[3..].iter().enumerate() {
            assert!(subset.is_mlp);
            assert_eq!(subset.prev_op, vec![ModuleRef::block(0, expert(e, "w3"))]);
        }
    }
}
