//! Llama-style text decoders: Llama, Mistral and Qwen2.
//!
//! The three families share one checkpoint layout and one subset sequence;
//! they differ in which projections carry biases.

use std::marker::PhantomData;

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::models::adapter::{LoadedModel, ModelAdapter, ModelSource, RegisteredAdapter};
use crate::models::registry::Modality;
use crate::models::shared::decoder::{
    decoder_layout, decoder_norm_set, standard_subsets, DecoderConfig, DecoderPrefixes,
    ProjectionBias,
};
use crate::models::shared::graph::{Block, GraphLayout};
use crate::models::shared::subset::{NormSet, Subset};

const MODEL_PREFIXES: [&str; 2] = ["model", ""];
const HEAD_PREFIXES: [&str; 1] = ["lm_head"];

pub trait DecoderFlavor: Send + Sync + 'static {
    const NAME: &'static str;
    const MODEL_TYPES: &'static [&'static str];

    fn projection_bias(cfg: &DecoderConfig) -> ProjectionBias {
        ProjectionBias::from_config(cfg)
    }
}

pub struct LlamaFlavor;

impl DecoderFlavor for LlamaFlavor {
    const NAME: &'static str = "Llama";
    const MODEL_TYPES: &'static [&'static str] = &["llama"];
}

pub struct MistralFlavor;

impl DecoderFlavor for MistralFlavor {
    const NAME: &'static str = "Mistral";
    const MODEL_TYPES: &'static [&'static str] = &["mistral"];
}

pub struct Qwen2Flavor;

impl DecoderFlavor for Qwen2Flavor {
    const NAME: &'static str = "Qwen2";
    const MODEL_TYPES: &'static [&'static str] = &["qwen2"];

    /// Qwen2 always biases q/k/v and never o_proj or the MLP.
    fn projection_bias(_cfg: &DecoderConfig) -> ProjectionBias {
        ProjectionBias {
            qkv: true,
            o: false,
            mlp: false,
        }
    }
}

pub type Llama = DecoderModel<LlamaFlavor>;
pub type Mistral = DecoderModel<MistralFlavor>;
pub type Qwen2 = DecoderModel<Qwen2Flavor>;

pub struct DecoderModel<F> {
    loaded: LoadedModel,
    text_config: DecoderConfig,
    _flavor: PhantomData<F>,
}

impl<F: DecoderFlavor> DecoderModel<F> {
    pub fn text_config(&self) -> &DecoderConfig {
        &self.text_config
    }

    pub fn layout(cfg: &DecoderConfig, prefixes: &DecoderPrefixes) -> GraphLayout {
        decoder_layout(cfg, prefixes, F::projection_bias(cfg))
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, F::MODEL_TYPES)?;
        let text_config: DecoderConfig = source.parse_config()?;
        let prefixes = DecoderPrefixes::detect(
            &source.checkpoint,
            &MODEL_PREFIXES,
            &HEAD_PREFIXES,
            text_config.tie_word_embeddings,
        )?;
        let layout = Self::layout(&text_config, &prefixes);
        let (loaded, _) = source.load(&layout, config.use_cache)?;

        Ok(Self {
            loaded,
            text_config,
            _flavor: PhantomData,
        })
    }
}

impl<F: DecoderFlavor> ModelAdapter for DecoderModel<F> {
    fn architecture(&self) -> &'static str {
        F::NAME
    }

    fn loaded(&self) -> &LoadedModel {
        &self.loaded
    }

    fn layernorms_in_block(&self, block: &Block) -> Result<NormSet> {
        decoder_norm_set(block)
    }

    fn subsets_in_block(&self, block: &Block) -> Result<Vec<Subset>> {
        standard_subsets(block)
    }
}

impl<F: DecoderFlavor> RegisteredAdapter for DecoderModel<F> {
    const NAME: &'static str = F::NAME;
    const MODEL_TYPES: &'static [&'static str] = F::MODEL_TYPES;
    const MODALITY: Modality = Modality::Text;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path, model_type: &str) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": model_type,
        "hidden_size": 8,
        "intermediate_size": 16,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "num_hidden_layers": 2,
        "vocab_size": 16,
        "use_cache": true
    });
    fixtures::write_config(dir, &config);
    let cfg: DecoderConfig = serde_json::from_value(config).unwrap();
    let prefixes = DecoderPrefixes {
        model: "model".to_string(),
        lm_head: Some("lm_head".to_string()),
    };
    let bias = match model_type {
        "qwen2" => Qwen2Flavor::projection_bias(&cfg),
        _ => ProjectionBias::from_config(&cfg),
    };
    fixtures::write_weights(dir, &decoder_layout(&cfg, &prefixes, bias), &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::shared::fixtures;
    use crate::models::shared::graph::ModuleRef;
    use crate::models::shared::subset::ensure_disjoint;
    use candle_core::DType;
    use serde_json::json;

    fn build<A: RegisteredAdapter>(dir: &std::path::Path) -> Result<A> {
        A::build_model(&AdapterConfig::new(A::NAME, dir).with_device("cpu"))
    }

    #[test]
    fn llama_exposes_blocks_norms_and_subsets() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "llama");
        let adapter: Llama = build(dir.path()).unwrap();

        assert_eq!(adapter.architecture(), "Llama");
        assert_eq!(adapter.blocks().len(), 2);
        for block in adapter.blocks() {
            let subsets = adapter.subsets_in_block(block).unwrap();
            assert_eq!(subsets.len(), 4);
            ensure_disjoint(&subsets).unwrap();
            let norms = adapter.layernorms_in_block(block).unwrap();
            assert_eq!(
                norms.keys().map(String::as_str).collect::<Vec<_>>(),
                vec!["input_layernorm", "post_attention_layernorm"]
            );
        }

        assert_eq!(adapter.embed_layers(), vec![ModuleRef::model("embed_tokens")]);
        assert_eq!(adapter.head_layers(), vec![ModuleRef::model("lm_head")]);
        assert_eq!(adapter.pre_head_layernorm_layers(), vec![ModuleRef::model("norm")]);
        assert!(adapter.as_multimodal().is_none());
        assert!(!adapter.needs_mask_update());
    }

    #[test]
    fn output_projection_chains_from_value_projection() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "llama");
        let adapter: Llama = build(dir.path()).unwrap();
        let block = adapter.block(1).unwrap();
        let subsets = adapter.subsets_in_block(block).unwrap();

        let v_ref = subsets[0].layer("self_attn.v_proj").unwrap();
        assert_eq!(subsets[1].prev_op, vec![v_ref.clone()]);

        let prev = adapter.resolve(&subsets[1].prev_op[0]).unwrap();
        let prev_weight = prev.as_module().unwrap().weight();
        let v_weight = block.module("self_attn.v_proj").unwrap().weight();
        assert_eq!(prev_weight.id(), v_weight.id());
    }

    #[test]
    fn cache_flag_is_patched_only_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "mistral");

        let adapter: Mistral = build(dir.path()).unwrap();
        assert!(!adapter.use_cache());
        assert_eq!(adapter.config()["use_cache"], json!(false));

        let cached =
            Mistral::build_model(&AdapterConfig::new("Mistral", dir.path()).with_device("cpu").with_cache(true))
                .unwrap();
        assert!(cached.use_cache());
        assert_eq!(cached.config()["use_cache"], json!(true));
    }

    #[test]
    fn qwen2_requires_qkv_biases() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "qwen2");
        let adapter: Qwen2 = build(dir.path()).unwrap();
        let q = adapter.blocks()[0].module("self_attn.q_proj").unwrap();
        assert!(q.bias().is_some());
        let o = adapter.blocks()[0].module("self_attn.o_proj").unwrap();
        assert!(o.bias().is_none());

        let plain = tempfile::tempdir().unwrap();
        write_test_checkpoint(plain.path(), "llama");
        let mut config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(plain.path().join("config.json")).unwrap(),
        )
        .unwrap();
        config["model_type"] = json!("qwen2");
        fixtures::write_config(plain.path(), &config);
        let err = build::<Qwen2>(plain.path()).err().unwrap();
        match err {
            Error::ModelLoadError { reason, .. } => assert!(reason.contains("q_proj.bias")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mismatched_model_type_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "llama");
        let err = build::<Mistral>(dir.path()).err().unwrap();
        assert!(matches!(err, Error::ModelLoadError { .. }));
    }

    #[test]
    fn loads_sharded_checkpoints_at_requested_precision() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "llama");
        std::fs::remove_file(dir.path().join("model.safetensors")).unwrap();
        let cfg: DecoderConfig = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        let prefixes = DecoderPrefixes {
            model: "model".to_string(),
            lm_head: Some("lm_head".to_string()),
        };
        fixtures::write_sharded_weights(dir.path(), &Llama::layout(&cfg, &prefixes));

        let adapter = Llama::build_model(
            &AdapterConfig::new("Llama", dir.path())
                .with_device("cpu")
                .with_dtype("bf16"),
        )
        .unwrap();
        assert_eq!(adapter.blocks().len(), 2);
        assert_eq!(adapter.dtype(), DType::BF16);
    }

    #[test]
    fn tied_embeddings_drop_the_head() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path(), "llama");
        let mut config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        config["tie_word_embeddings"] = json!(true);
        fixtures::write_config(dir.path(), &config);

        let adapter: Llama = build(dir.path()).unwrap();
        assert!(adapter.head_layers().is_empty());
        assert_eq!(adapter.text_config().hidden_size, 8);
    }
}
