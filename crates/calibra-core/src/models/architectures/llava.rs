//! Llava: CLIP vision tower, two-layer projector and a Llama text backbone.

use std::collections::BTreeMap;

use candle_core::{DType, Device};
use serde::Deserialize;
use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{
    LoadedModel, ModelAdapter, ModelSource, MultimodalAdapter, RegisteredAdapter,
};
use crate::models::registry::Modality;
use crate::models::shared::decoder::{
    decoder_layout, decoder_norm_set, standard_subsets, DecoderConfig, DecoderPrefixes,
    ProjectionBias,
};
use crate::models::shared::graph::{join_prefix, Block, GraphLayout, ModuleSpec};
use crate::models::shared::image::{ImageProcessor, PreprocessorConfig};
use crate::models::shared::sample::{
    token_tensors, CalibrationSample, ImageQuestion, PromptAssets, SampleProcessor,
};
use crate::models::shared::subset::{NormSet, Subset};
use crate::models::shared::vision::{VisionConfig, VisionTower};

const TEXT_PREFIXES: [&str; 2] = ["language_model.model", "model.language_model"];
const HEAD_PREFIXES: [&str; 2] = ["language_model.lm_head", "lm_head"];
const PROJECTOR_PREFIXES: [&str; 2] = ["multi_modal_projector", "model.multi_modal_projector"];
const VISION_PREFIXES: [&str; 2] = ["vision_tower", "model.vision_tower"];
const IMAGE_TOKEN: &str = "<image>";

/// Which vision features reach the projector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSelectStrategy {
    /// Patch features only; the class token is dropped.
    #[default]
    Default,
    /// Class token followed by the patch features.
    Full,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlavaConfig {
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default)]
    pub vision_feature_select_strategy: FeatureSelectStrategy,
}

fn default_image_token_index() -> u32 {
    32000
}

pub struct Llava {
    loaded: LoadedModel,
    config: LlavaConfig,
    text_config: DecoderConfig,
    vision: VisionTower,
}

impl Llava {
    pub fn llava_config(&self) -> &LlavaConfig {
        &self.config
    }

    pub fn text_config(&self) -> &DecoderConfig {
        &self.text_config
    }

    /// Image tokens each `<image>` placeholder expands to.
    pub fn image_tokens(&self) -> usize {
        match self.config.vision_feature_select_strategy {
            FeatureSelectStrategy::Default => self.vision.num_patches(),
            FeatureSelectStrategy::Full => self.vision.num_patches() + 1,
        }
    }

    pub fn layout(
        text: &DecoderConfig,
        vision: &VisionConfig,
        prefixes: &DecoderPrefixes,
        projector: &str,
    ) -> GraphLayout {
        let mut layout = decoder_layout(text, prefixes, ProjectionBias::from_config(text));
        layout
            .root_module(
                "multi_modal_projector.linear_1",
                join_prefix(projector, "linear_1"),
                ModuleSpec::Linear {
                    in_dim: vision.hidden_size,
                    out_dim: text.hidden_size,
                    bias: true,
                },
            )
            .root_module(
                "multi_modal_projector.linear_2",
                join_prefix(projector, "linear_2"),
                ModuleSpec::Linear {
                    in_dim: text.hidden_size,
                    out_dim: text.hidden_size,
                    bias: true,
                },
            );
        layout
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, Self::MODEL_TYPES)?;
        let llava_config: LlavaConfig = source.parse_config()?;
        let text_config: DecoderConfig = source.section("text_config")?;
        let vision_config: VisionConfig = source.section("vision_config")?;

        let checkpoint = &source.checkpoint;
        let prefixes = DecoderPrefixes::detect(
            checkpoint,
            &TEXT_PREFIXES,
            &HEAD_PREFIXES,
            text_config.tie_word_embeddings,
        )?;
        let projector = checkpoint
            .detect_prefix(&PROJECTOR_PREFIXES, "linear_1.")
            .ok_or_else(|| Error::model_load(&config.model_path, "No multi_modal_projector found"))?;
        let vision_prefix = checkpoint
            .detect_prefix(&VISION_PREFIXES, "vision_model.")
            .map(|prefix| join_prefix(prefix, "vision_model"))
            .ok_or_else(|| Error::model_load(&config.model_path, "No vision tower found"))?;
        debug!(
            "Llava prefixes: text '{}', projector '{}', vision '{}'",
            prefixes.model, projector, vision_prefix
        );

        let layout = Self::layout(&text_config, &vision_config, &prefixes, projector);
        let (loaded, vb) = source.load(&layout, config.use_cache)?;
        let vision = VisionTower::new(&vb, &vision_prefix, vision_config);

        Ok(Self {
            loaded,
            config: llava_config,
            text_config,
            vision,
        })
    }
}

impl ModelAdapter for Llava {
    fn architecture(&self) -> &'static str {
        Self::NAME
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

    fn as_multimodal(&self) -> Option<&dyn MultimodalAdapter> {
        Some(self)
    }
}

impl MultimodalAdapter for Llava {
    fn vision_tower(&self) -> &VisionTower {
        &self.vision
    }

    fn sample_processor(&self) -> Result<Box<dyn SampleProcessor>> {
        let fallback = PreprocessorConfig::square(self.vision.config().image_size);
        let assets = PromptAssets::from_model_dir(self.model_path(), fallback)?;
        let image_token_id = assets.required_token(IMAGE_TOKEN)?;
        Ok(Box::new(LlavaProcessor {
            assets,
            image_token_id,
            image_tokens: self.image_tokens(),
        }))
    }
}

impl RegisteredAdapter for Llava {
    const NAME: &'static str = "Llava";
    const MODEL_TYPES: &'static [&'static str] = &["llava"];
    const MODALITY: Modality = Modality::VisionLanguage;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

/// Expands the single `<image>` placeholder to the image token count of the
/// configured feature strategy.
pub struct LlavaProcessor {
    assets: PromptAssets,
    image_token_id: u32,
    image_tokens: usize,
}

impl SampleProcessor for LlavaProcessor {
    fn process(
        &self,
        pair: &ImageQuestion,
        dtype: DType,
        device: &Device,
    ) -> Result<CalibrationSample> {
        let image = ImageProcessor::load_image(&pair.image)?;
        let prompt = self.assets.render_question(&pair.question)?;

        let placeholders = prompt.matches(IMAGE_TOKEN).count();
        if placeholders != 1 {
            return Err(Error::InvalidInput(format!(
                "Chat template produced {placeholders} image placeholders for one image"
            )));
        }
        let expanded = prompt.replace(IMAGE_TOKEN, &IMAGE_TOKEN.repeat(self.image_tokens));
        let ids = self.assets.tokenizer.encode(&expanded)?;
        let image_ids = ids.iter().filter(|id| **id == self.image_token_id).count();
        if image_ids != self.image_tokens {
            return Err(Error::TokenizationError(format!(
                "Expected {} image tokens, tokenizer produced {image_ids}",
                self.image_tokens
            )));
        }

        let (input_ids, attention_mask) = token_tensors(&ids, device)?;
        let pixel_values = self
            .assets
            .images
            .preprocess(&image, device)?
            .unsqueeze(0)?
            .to_dtype(dtype)?;

        Ok(CalibrationSample {
            prompt,
            input_ids,
            attention_mask,
            pixel_values,
            extras: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": "llava",
        "image_token_index": 4,
        "text_config": {
            "model_type": "llama",
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "vocab_size": 24
        },
        "vision_config": {
            "hidden_size": 6,
            "image_size": 8,
            "patch_size": 4,
            "num_hidden_layers": 1
        }
    });
    fixtures::write_config(dir, &config);
    let text: DecoderConfig = serde_json::from_value(config["text_config"].clone()).unwrap();
    let vision: VisionConfig = serde_json::from_value(config["vision_config"].clone()).unwrap();
    let prefixes = DecoderPrefixes {
        model: "language_model.model".to_string(),
        lm_head: Some("language_model.lm_head".to_string()),
    };
    fixtures::write_weights(
        dir,
        &Llava::layout(&text, &vision, &prefixes, "multi_modal_projector"),
        &[(
            "vision_tower.vision_model.embeddings.patch_embedding.weight",
            vec![6, 3, 4, 4],
        )],
    );

    fixtures::write_tokenizer(dir, &["USER", ":", "What", "is", "this", "?"]);
    fixtures::write_tokenizer_config(
        dir,
        "{% for message in messages %}{{ message['role'].upper() }}: \
         {% for part in message['content'] %}{% if part['type'] == 'image' %}<image>\n\
         {% else %}{{ part['text'] }}{% endif %}{% endfor %}{% endfor %}\
         {% if add_generation_prompt %} ASSISTANT:{% endif %}",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::fixtures;
    use crate::models::shared::graph::ModuleRef;
    use crate::models::shared::sample::PreprocessPolicy;

    fn build(dir: &std::path::Path) -> Llava {
        Llava::build_model(&AdapterConfig::new("Llava", dir).with_device("cpu")).unwrap()
    }

    #[test]
    fn splits_tower_projector_and_backbone() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let adapter = build(dir.path());

        assert_eq!(adapter.blocks().len(), 2);
        assert_eq!(adapter.llava_config().image_token_index, 4);
        assert_eq!(adapter.text_config().hidden_size, 8);
        let projector = adapter
            .resolve(&ModuleRef::model("multi_modal_projector.linear_1"))
            .unwrap();
        assert_eq!(projector.as_module().unwrap().weight().dims(), &[8, 6]);

        let tower = adapter.vision_tower();
        assert_eq!(tower.prefix(), "vision_tower.vision_model");
        assert!(tower.contains("embeddings.patch_embedding.weight"));
        assert_eq!(tower.num_patches(), 4);
        assert_eq!(adapter.image_tokens(), 4);
        assert!(adapter.as_multimodal().is_some());
    }

    #[test]
    fn expands_image_placeholder_per_patch() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let image = dir.path().join("a.png");
        fixtures::write_png(&image, 12, 10);
        let adapter = build(dir.path());

        let pairs = vec![ImageQuestion::new(&image, "What is this ?")];
        let samples = adapter.preprocess(&pairs, PreprocessPolicy::Abort).unwrap();
        assert_eq!(samples.len(), 1);

        let sample = &samples[0];
        assert!(sample.prompt.starts_with("USER: <image>"));
        let ids = sample.input_ids.squeeze(0).unwrap().to_vec1::<u32>().unwrap();
        let image_id = fixtures_image_token_id(dir.path());
        assert_eq!(ids.iter().filter(|id| **id == image_id).count(), 4);
        assert_eq!(sample.pixel_values.dims(), &[1, 3, 8, 8]);
        assert_eq!(sample.pixel_values.dtype(), DType::F32);
        assert!(sample.extras.is_empty());
    }

    fn fixtures_image_token_id(dir: &std::path::Path) -> u32 {
        crate::tokenizer::Tokenizer::from_path(dir)
            .unwrap()
            .token_id(IMAGE_TOKEN)
            .unwrap()
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        fixtures::write_tokenizer_config(dir.path(), "{{ messages[0]['content'][1]['text'] }}");
        let image = dir.path().join("a.png");
        fixtures::write_png(&image, 8, 8);
        let adapter = build(dir.path());

        let err = adapter
            .preprocess(&[ImageQuestion::new(&image, "What")], PreprocessPolicy::Abort)
            .unwrap_err();
        assert!(matches!(err, Error::PreprocessError { index: Some(0), .. }));
    }

    #[test]
    fn full_feature_strategy_adds_the_class_token() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let mut config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        config["vision_feature_select_strategy"] = serde_json::json!("full");
        fixtures::write_config(dir.path(), &config);
        let image = dir.path().join("a.png");
        fixtures::write_png(&image, 8, 8);

        let adapter = build(dir.path());
        assert_eq!(
            adapter.llava_config().vision_feature_select_strategy,
            FeatureSelectStrategy::Full
        );
        assert_eq!(adapter.image_tokens(), 5);

        let samples = adapter
            .preprocess(&[ImageQuestion::new(&image, "What")], PreprocessPolicy::Abort)
            .unwrap();
        let ids = samples[0].input_ids.squeeze(0).unwrap().to_vec1::<u32>().unwrap();
        let image_id = fixtures_image_token_id(dir.path());
        assert_eq!(ids.iter().filter(|id| **id == image_id).count(), 5);
    }

    #[test]
    fn unknown_feature_strategy_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        write_test_checkpoint(dir.path());
        let mut config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        config["vision_feature_select_strategy"] = serde_json::json!("cls_only");
        fixtures::write_config(dir.path(), &config);

        let err = Llava::build_model(&AdapterConfig::new("Llava", dir.path()).with_device("cpu"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelLoadError { .. }));
    }
}
