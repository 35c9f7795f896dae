//! Mllama: Llama text decoder with gated cross-attention layers reading the
//! output of a tiled vision encoder.
//!
//! Blocks listed in `text_config.cross_attention_layers` replace self-attention
//! with `cross_attn`, whose keys and values are computed from the projected
//! image features rather than from the residual stream. Those blocks therefore
//! expose five subsets instead of four, and the key/value subset has no
//! preceding operation in the block to fold scales into.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{
    LoadedModel, ModelAdapter, ModelSource, MultimodalAdapter, RegisteredAdapter,
};
use crate::models::registry::Modality;
use crate::models::shared::decoder::{
    attention_projections, decoder_norm_set, decoder_norms, decoder_root, dense_mlp,
    mlp_subsets, standard_block, standard_subsets, DecoderConfig, DecoderPrefixes,
    ProjectionBias,
};
use crate::models::shared::graph::{Block, BlockKind, BlockLayout, GraphLayout, ModuleSpec, NormKind};
use crate::models::shared::image::{tile_arrangements, ImageProcessor, PreprocessorConfig};
use crate::models::shared::sample::{
    token_tensors, CalibrationSample, ImageQuestion, PromptAssets, SampleProcessor,
};
use crate::models::shared::subset::{kwargs, NormSet, Subset, SubsetBuilder};
use crate::models::shared::vision::{VisionConfig, VisionTower};

const TEXT_PREFIXES: [&str; 2] = ["language_model.model", "model.language_model"];
const HEAD_PREFIXES: [&str; 2] = ["language_model.lm_head", "lm_head"];
const PROJECTOR_PREFIXES: [&str; 2] = ["multi_modal_projector", "model.multi_modal_projector"];
const VISION_PREFIXES: [&str; 2] = ["vision_model", "model.vision_model"];
const IMAGE_TOKEN: &str = "<|image|>";
/// Rows appended to the token embedding for the image and reserved tokens.
const EXTRA_EMBEDDING_ROWS: usize = 8;
const CROSS_ATTENTION_MASK: &str = "cross_attention_mask";

#[derive(Debug, Clone, Deserialize)]
pub struct MllamaTextConfig {
    #[serde(flatten)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub cross_attention_layers: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MllamaVisionConfig {
    #[serde(flatten)]
    pub base: VisionConfig,
    #[serde(default = "default_vision_output_dim")]
    pub vision_output_dim: usize,
    #[serde(default = "default_max_num_tiles")]
    pub max_num_tiles: usize,
}

fn default_vision_output_dim() -> usize {
    7680
}

fn default_max_num_tiles() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct MllamaConfig {
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
}

fn default_image_token_index() -> u32 {
    128256
}

/// Keyword renames for the cross-attention module: it receives the block's
/// cross-attention mask under the name `attention_mask`.
fn cross_attention_sub_keys() -> BTreeMap<String, String> {
    [
        (kwargs::CROSS_ATTENTION_STATES, kwargs::CROSS_ATTENTION_STATES),
        (kwargs::ATTENTION_MASK, CROSS_ATTENTION_MASK),
        (kwargs::OUTPUT_ATTENTIONS, kwargs::OUTPUT_ATTENTIONS),
        (kwargs::PAST_KEY_VALUE, kwargs::PAST_KEY_VALUE),
        (kwargs::CACHE_POSITION, kwargs::CACHE_POSITION),
    ]
    .into_iter()
    .map(|(key, source)| (key.to_string(), source.to_string()))
    .collect()
}

pub struct Mllama {
    loaded: LoadedModel,
    config: MllamaConfig,
    text_config: MllamaTextConfig,
    vision_config: MllamaVisionConfig,
    vision: VisionTower,
}

impl Mllama {
    pub fn mllama_config(&self) -> &MllamaConfig {
        &self.config
    }

    pub fn text_config(&self) -> &MllamaTextConfig {
        &self.text_config
    }

    pub fn vision_config(&self) -> &MllamaVisionConfig {
        &self.vision_config
    }

    fn cross_attention_block(
        index: usize,
        prefixes: &DecoderPrefixes,
        cfg: &DecoderConfig,
    ) -> BlockLayout {
        let mut block = BlockLayout::new(index, BlockKind::CrossAttention, prefixes.layer(index));
        decoder_norms(&mut block, cfg);
        attention_projections(&mut block, cfg, "cross_attn", ProjectionBias::default());
        block
            .norm("cross_attn.q_norm", cfg.head_dim(), cfg.rms_norm_eps, NormKind::Rms)
            .norm("cross_attn.k_norm", cfg.head_dim(), cfg.rms_norm_eps, NormKind::Rms);
        dense_mlp(&mut block, cfg, false);
        block
    }

    pub fn layout(
        text: &MllamaTextConfig,
        vision: &MllamaVisionConfig,
        prefixes: &DecoderPrefixes,
        projector: &str,
    ) -> GraphLayout {
        let d = &text.decoder;
        let cross: BTreeSet<usize> = text.cross_attention_layers.iter().copied().collect();

        let mut layout = GraphLayout::default();
        decoder_root(&mut layout, prefixes, d, d.vocab_size + EXTRA_EMBEDDING_ROWS);
        layout.root_module(
            "multi_modal_projector",
            projector,
            ModuleSpec::Linear {
                in_dim: vision.vision_output_dim,
                out_dim: d.hidden_size,
                bias: true,
            },
        );

        for index in 0..d.num_hidden_layers {
            let block = if cross.contains(&index) {
                Self::cross_attention_block(index, prefixes, d)
            } else {
                standard_block(index, prefixes, d, ProjectionBias::default())
            };
            layout.push_block(block);
        }
        layout
    }

    fn load(config: &AdapterConfig) -> Result<Self> {
        let source = ModelSource::open(config, Self::MODEL_TYPES)?;
        let mllama_config: MllamaConfig = source.parse_config()?;
        let text_config: MllamaTextConfig = source.section("text_config")?;
        let vision_config: MllamaVisionConfig = source.section("vision_config")?;

        let layers = text_config.decoder.num_hidden_layers;
        if let Some(bad) = text_config
            .cross_attention_layers
            .iter()
            .find(|index| **index >= layers)
        {
            return Err(Error::model_load(
                &config.model_path,
                format!("Cross-attention layer {bad} is out of range for {layers} layers"),
            ));
        }

        let checkpoint = &source.checkpoint;
        let prefixes = DecoderPrefixes::detect(
            checkpoint,
            &TEXT_PREFIXES,
            &HEAD_PREFIXES,
            text_config.decoder.tie_word_embeddings,
        )?;
        let projector = checkpoint
            .detect_prefix(&PROJECTOR_PREFIXES, "weight")
            .ok_or_else(|| Error::model_load(&config.model_path, "No multi_modal_projector found"))?;
        let vision_prefix = checkpoint
            .detect_prefix(&VISION_PREFIXES, "patch_embedding.")
            .ok_or_else(|| Error::model_load(&config.model_path, "No vision model found"))?;
        debug!(
            "Mllama cross-attention layers {:?}, vision prefix '{}'",
            text_config.cross_attention_layers, vision_prefix
        );

        let layout = Self::layout(&text_config, &vision_config, &prefixes, projector);
        let (loaded, vb) = source.load(&layout, config.use_cache)?;
        let vision = VisionTower::new(&vb, vision_prefix, vision_config.base.clone());

        Ok(Self {
            loaded,
            config: mllama_config,
            text_config,
            vision_config,
            vision,
        })
    }

    fn cross_attention_subsets(block: &Block) -> Result<Vec<Subset>> {
        let mut subsets = vec![
            SubsetBuilder::new(block)
                .layers(["cross_attn.q_proj"])
                .prev_op(["input_layernorm"])
                .input("cross_attn.q_proj")
                .inspect("cross_attn")
                .with_kwargs()
                .sub_keys(cross_attention_sub_keys())
                .build()?,
            // Keys and values read the image features, not the block input.
            SubsetBuilder::new(block)
                .layers(["cross_attn.k_proj", "cross_attn.v_proj"])
                .input("cross_attn.k_proj")
                .inspect("cross_attn")
                .with_kwargs()
                .sub_keys(cross_attention_sub_keys())
                .build()?,
            SubsetBuilder::new(block)
                .layers(["cross_attn.o_proj"])
                .prev_op(["cross_attn.v_proj"])
                .input("cross_attn.o_proj")
                .inspect("cross_attn.o_proj")
                .build()?,
        ];
        subsets.extend(mlp_subsets(block)?);
        Ok(subsets)
    }

    /// Subsets of `block`, by its kind.
    pub fn block_subsets(block: &Block) -> Result<Vec<Subset>> {
        match block.kind() {
            BlockKind::Standard => standard_subsets(block),
            BlockKind::CrossAttention => Self::cross_attention_subsets(block),
        }
    }
}

impl ModelAdapter for Mllama {
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
        Self::block_subsets(block)
    }

    fn needs_mask_update(&self) -> bool {
        true
    }

    fn as_multimodal(&self) -> Option<&dyn MultimodalAdapter> {
        Some(self)
    }
}

impl MultimodalAdapter for Mllama {
    fn vision_tower(&self) -> &VisionTower {
        &self.vision
    }

    fn sample_processor(&self) -> Result<Box<dyn SampleProcessor>> {
        let mut fallback = PreprocessorConfig::square(self.vision_config.base.image_size);
        fallback.max_image_tiles = Some(self.vision_config.max_num_tiles);
        let assets = PromptAssets::from_model_dir(self.model_path(), fallback)?;
        let image_token_id = assets.required_token(IMAGE_TOKEN)?;
        let images = assets.images.config();
        let max_tiles = images
            .max_image_tiles
            .unwrap_or(self.vision_config.max_num_tiles)
            .max(1);
        let tile_size = images
            .size
            .height
            .unwrap_or(self.vision_config.base.image_size)
            .max(1);
        Ok(Box::new(MllamaProcessor {
            assets,
            image_token_id,
            max_tiles,
            tile_size,
        }))
    }
}

impl RegisteredAdapter for Mllama {
    const NAME: &'static str = "Mllama";
    const MODEL_TYPES: &'static [&'static str] = &["mllama"];
    const MODALITY: Modality = Modality::VisionLanguage;

    fn build_model(config: &AdapterConfig) -> Result<Self> {
        Self::load(config).map_err(|e| e.into_load_error(&config.model_path))
    }
}

/// Fits each image onto the best grid of at most `max_tiles` tiles and packs
/// the tiles into a `max_tiles` canvas.
pub struct MllamaProcessor {
    assets: PromptAssets,
    image_token_id: u32,
    max_tiles: usize,
    tile_size: usize,
}

impl MllamaProcessor {
    /// `[1, 1, max_tiles, 3, T, T]`, unused tiles zero.
    fn pack_tiles(&self, tiles: &Tensor) -> Result<Tensor> {
        let (count, channels, height, width) = tiles.dims4()?;
        let packed = if count < self.max_tiles {
            let padding = Tensor::zeros(
                (self.max_tiles - count, channels, height, width),
                tiles.dtype(),
                tiles.device(),
            )?;
            Tensor::cat(&[tiles, &padding], 0)?
        } else {
            tiles.clone()
        };
        Ok(packed.reshape((1, 1, self.max_tiles, channels, height, width))?)
    }

    /// Position of the `rows x cols` grid among the supported grids, from 1.
    fn aspect_ratio_id(&self, rows: usize, cols: usize) -> Result<u32> {
        tile_arrangements(self.max_tiles)
            .iter()
            .position(|arrangement| *arrangement == (rows, cols))
            .map(|position| position as u32 + 1)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{rows}x{cols} tiles exceed the {} tile budget",
                    self.max_tiles
                ))
            })
    }

    /// `[1, seq_len, 1, max_tiles]`: every token from the image token onward
    /// attends to the image's tiles.
    fn cross_attention_mask(
        &self,
        image_pos: usize,
        seq_len: usize,
        num_tiles: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let mut mask = vec![0u32; seq_len * self.max_tiles];
        for pos in image_pos..seq_len {
            let row = pos * self.max_tiles;
            mask[row..row + num_tiles].fill(1);
        }
        Ok(Tensor::from_vec(mask, (1, seq_len, 1, self.max_tiles), device)?)
    }

    fn aspect_ratio_mask(&self, num_tiles: usize, device: &Device) -> Result<Tensor> {
        let mut mask = vec![0u32; self.max_tiles];
        mask[..num_tiles].fill(1);
        Ok(Tensor::from_vec(mask, (1, 1, self.max_tiles), device)?)
    }
}

impl SampleProcessor for MllamaProcessor {
    fn process(
        &self,
        pair: &ImageQuestion,
        dtype: DType,
        device: &Device,
    ) -> Result<CalibrationSample> {
        let image = ImageProcessor::load_image(&pair.image)?;
        let prompt = self.assets.render_question(&pair.question)?;
        let ids = self.assets.tokenizer.encode(&prompt)?;

        let positions: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == self.image_token_id)
            .map(|(pos, _)| pos)
            .collect();
        let image_pos = match positions.as_slice() {
            [pos] => *pos,
            [] => {
                return Err(Error::InvalidInput(format!(
                    "Prompt has no {IMAGE_TOKEN} token"
                )))
            }
            many => {
                return Err(Error::InvalidInput(format!(
                    "Prompt has {} {IMAGE_TOKEN} tokens for one image",
                    many.len()
                )))
            }
        };

        let (input_ids, attention_mask) = token_tensors(&ids, device)?;
        let tiled = self.assets.images.preprocess_tiled(
            &image,
            self.tile_size,
            self.max_tiles,
            device,
        )?;
        let num_tiles = tiled.num_tiles();
        let pixel_values = self.pack_tiles(&tiled.tiles)?.to_dtype(dtype)?;
        let aspect_ratio_id = self.aspect_ratio_id(tiled.rows, tiled.cols)?;

        let mut extras = BTreeMap::new();
        extras.insert(
            "aspect_ratio_ids".to_string(),
            Tensor::new(&[[aspect_ratio_id]], device)?,
        );
        extras.insert(
            "aspect_ratio_mask".to_string(),
            self.aspect_ratio_mask(num_tiles, device)?,
        );
        extras.insert(
            CROSS_ATTENTION_MASK.to_string(),
            self.cross_attention_mask(image_pos, ids.len(), num_tiles, device)?,
        );

        Ok(CalibrationSample {
            prompt,
            input_ids,
            attention_mask,
            pixel_values,
            extras,
        })
    }
}

#[cfg(test)]
pub(crate) fn write_test_checkpoint(dir: &std::path::Path) {
    use crate::models::shared::fixtures;

    let config = serde_json::json!({
        "model_type": "mllama",
        "image_token_index": 3,
        "text_config": {
            "model_type": "mllama_text_model",
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "num_hidden_layers": 3,
            "vocab_size": 24,
            "cross_attention_layers": [1],
            "use_cache": true
        },
        "vision_config": {
            "hidden_size": 6,
            "image_size": 8,
            "patch_size": 4,
            "num_hidden_layers": 1,
            "vision_output_dim": 12,
            "max_num_tiles": 2
        }
    });
    fixtures::write_config(dir, &config);
    let text: MllamaTextConfig = serde_json::from_value(config["text_config"].clone()).unwrap();
    let vision: MllamaVisionConfig =
        serde_json::from_value(config["vision_config"].clone()).unwrap();
    let prefixes = DecoderPrefixes {
        model: "language_model.model".to_string(),
        lm_head: Some("language_model.lm_head".to_string()),
    };
    fixtures::write_weights(
        dir,
        &Mllama::layout(&text, &vision, &prefixes, "multi_modal_projector"),
        &[("vision_model.patch_embedding.weight", vec![6, 3, 4, 4])],
    );

    fixtures::write_tokenizer(dir, &["user", "What", "is", "this", "?"]);
    fixtures::write_tokenizer_config(
        dir,
        "{{ bos_token }}{% for message in messages %}<|start_header_id|>{{ message['role'] }}\
         <|end_header_id|>{% for part in message['content'] %}{% if part['type'] == 'image' %}\
         <|image|>{% else %} {{ part['text'] }}{% endif %}{% endfor %}{{ eos_token }}{% endfor %}",
    );
}
