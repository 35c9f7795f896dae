//! ViT image encoder (optionally with a classification head).

use serde::Deserialize;
use serde_json::Value;

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{root_refs, LoadedModel, ModelAdapter, ModelSource, RegisteredAdapter};
use crate::models::registry::Modality;
use crate::models::shared::graph::{
    join_prefix, Block, BlockKind, BlockLayout, GraphLayout, ModuleRef, ModuleSpec, NormKind,
};
use crate::models::shared::subset::{norm_set, NormSet, Subset, SubsetBuilder};

const NORMS: [&str; 2] = ["layernorm_before", "layernorm_after"];

#[derive(Debug, Clone, Deserialize)]
pub struct VitConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    /// Class labels of a classification checkpoint
    #[serde(default)]
    pub id2label: Option<serde_json::Map<String, Value>>,
}

fn default_hidden_size() -> usize {
    768
}

fn default_num_hidden_layers() -> usize {
    12
}

fn default_intermediate_size() -> usize {
    3072
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_qkv_bias() -> bool {
    true
}

impl VitConfig {
    pub fn num_labels(&self) -> Option<usize> {
        self.id2label.as_ref().map(|labels| labels.len())
    }
}

pub struct Vit {
    loaded: LoadedModel,
    vision_config: VitConfig,
}

impl Vit {
    pub fn vision_config(&self) -> &VitConfig {
        &self.vision_config
    }

    pub fn layout(cfg: &VitConfig, prefix: &str, num_labels: Option<usize>) -> GraphLayout {
        let hidden = cfg.hidden_size;
        let layer_norm = |dim| ModuleSpec::Norm {
            dim,
            eps: cfg.layer_norm_eps,
            kind: NormKind::Layer,
        };

        let mut layout = GraphLayout::default();
        layout
            .root_module(
                "patch_embeddings",
                join_prefix(prefix, "embeddings.patch_embeddings.projection"),
                ModuleSpec::PatchEmbedding {
                    channels: cfg.num_channels,
                    dim: hidden,
                    patch_size: cfg.patch_size,
                    bias: true,
                },
            )
            .root_module("layernorm", join_prefix(prefix, "layernorm"), layer_norm(hidden));
        if let Some(labels) = num_labels {
            layout.root_module(
                "classifier",
                "classifier",
                ModuleSpec::Linear {
                    in_dim: hidden,
                    out_dim: labels,
                    bias: true,
                },
            );
        }

        for index in 0..cfg.num_hidden_layers {
            let mut block = BlockLayout::new(
                index,
                BlockKind::Standard,
                join_prefix(prefix, &format!("encoder.layer.{index}")),
            );
            block
                .push("layernorm_before", layer_norm(hidden))
                .push("layernorm_after", layer_norm(hidden))
                .linear("attention.attention.query", hidden, hidden, cfg.qkv_bias)
                .linear("attention.attention.key", hidden, hidden, cfg.qkv_bias)
                .linear("attention.attention.value", hidden, hidden, cfg.qkv_bias)
                .linear("attention.output.dense", hidden, hidden, true)
                .linear("intermediate.dense", hidden, cfg.intermediate_size, true)
                .linear("output.dense", cfg.intermediate_size, hidden, true);
            layout.push_block(block);
        }
        layout
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, Self::MODEL_TYPES)?;
        let vision_config: VitConfig = source.parse_config()?;
        let prefix = source
            .checkpoint
            .detect_prefix(&["vit", ""], "encoder.layer.")
            .ok_or_else(|| Error::model_load(&config.model_path, "No ViT encoder layers found"))?;
        let num_labels = vision_config
            .num_labels()
            .filter(|_| source.checkpoint.contains("classifier.weight"));

        let layout = Self::layout(&vision_config, prefix, num_labels);
        let (loaded, _) = source.load(&layout, config.use_cache)?;
        Ok(Self {
            loaded,
            vision_config,
        })
    }
}

impl ModelAdapter for Vit {
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
                .layers([
                    "attention.attention.query",
                    "attention.attention.key",
                    "attention.attention.value",
                ])
                .prev_op(["layernorm_before"])
                .input("attention.attention.query")
                .inspect("attention")
                .with_kwargs()
                .build()?,
            SubsetBuilder::new(block)
                .layers(["attention.output.dense"])
                .prev_op(["attention.attention.value"])
                .input("attention.output.dense")
                .inspect("attention.output.dense")
                .build()?,
            SubsetBuilder::new(block)
                .layers(["intermediate.dense"])
                .prev_op(["layernorm_after"])
                .input("intermediate.dense")
                .inspect("intermediate.dense")
                .mlp()
                .build()?,
            SubsetBuilder::new(block)
                .layers(["output.dense"])
                .prev_op(["intermediate.dense"])
                .input("output.dense")
                .inspect("output.dense")
                .mlp()
                .build()?,
        ])
    }

    fn embed_layers(&self) -> Vec<ModuleRef> {
        root_refs(&self.loaded, &["patch_embeddings"])
    }

    fn head_layers(&self) -> Vec<ModuleRef> {
        root_refs(&self.loaded, &["classifier"])
    }

    fn pre_head_layernorm_layers(&self) -> Vec<ModuleRef> {
        root_refs(&self.loaded, &["layernorm"])
    }
}

impl RegisteredAdapter for Vit {
    const NAME: &'static str = "Vit";
    const MODEL_TYPES: &'static [&'static str] = &["vit"];
    const MODALITY: Modality = Modality::Vision;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": "vit",
        "hidden_size": 8,
        "num_hidden_layers": 2,
        "intermediate_size": 16,
        "image_size": 8,
        "patch_size": 4,
        "id2label": {"0": "cat", "1": "dog"}
    });
    fixtures::write_config(dir, &config);
    let cfg: VitConfig = serde_json::from_value(config).unwrap();
    fixtures::write_weights(dir, &Vit::layout(&cfg, "vit", Some(2)), &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::subset::ensure_disjoint;

    fn build(dir: &std::path::Path) -> Vit {
        Vit::build_model(&AdapterConfig::new("Vit", dir).with_device("cpu")).unwrap()
    }

    #[test]
    fn encoder_blocks_use_layer_norms_with_bias() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter = build(dir.path());
        assert_eq!(adapter.blocks().len(), 2);

        let block = &adapter.blocks()[0];
        let norms = adapter.layernorms_in_block(block).unwrap();
        for reference in norms.values() {
            let module = adapter.resolve(reference).unwrap().as_module().unwrap();
            assert_eq!(module.kind_name(), "layer_norm");
            assert!(module.bias().is_some());
        }
        assert_eq!(adapter.vision_config().num_labels(), Some(2));
    }

    #[test]
    fn subsets_chain_value_into_attention_output() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter = build(dir.path());
        let block = &adapter.blocks()[1];
        let subsets = adapter.subsets_in_block(block).unwrap();
        assert_eq!(subsets.len(), 4);
        ensure_disjoint(&subsets).unwrap();
        assert_eq!(
            subsets[1].prev_op,
            vec![ModuleRef::block(1, "attention.attention.value")]
        );
        assert!(!subsets[1].is_mlp && subsets[2].is_mlp);
    }

    #[test]
    fn root_modules_cover_patches_norm_and_classifier() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter = build(dir.path());
        assert_eq!(adapter.embed_layers(), vec![ModuleRef::model("patch_embeddings")]);
        assert_eq!(adapter.head_layers(), vec![ModuleRef::model("classifier")]);
        assert_eq!(
            adapter.pre_head_layernorm_layers(),
            vec![ModuleRef::model("layernorm")]
        );
        let patch = adapter
            .resolve(&ModuleRef::model("patch_embeddings"))
            .unwrap();
        assert_eq!(patch.as_module().unwrap().weight().dims(), &[8, 3, 4, 4]);
    }
}
