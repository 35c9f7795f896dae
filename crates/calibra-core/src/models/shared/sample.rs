//! Calibration sample types shared by the multimodal preprocessors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::shared::chat::ChatMessage;
use crate::models::shared::image::{ImageProcessor, PreprocessorConfig};
use crate::models::shared::template::ChatTemplate;
use crate::tokenizer::Tokenizer;

/// One raw calibration input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageQuestion {
    #[serde(alias = "img")]
    pub image: PathBuf,
    pub question: String,
}

impl ImageQuestion {
    pub fn new(image: impl Into<PathBuf>, question: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            question: question.into(),
        }
    }
}

/// What a bad pair does to a preprocessing batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessPolicy {
    /// Fail the batch on the first bad pair.
    #[default]
    Abort,
    /// Log the bad pair and continue with the rest.
    Skip,
}

/// Model-ready tensors for one pair.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    /// Rendered chat prompt the token ids were produced from
    pub prompt: String,
    /// `[1, seq_len]` u32 token ids
    pub input_ids: Tensor,
    /// `[1, seq_len]` u32 mask of ones
    pub attention_mask: Tensor,
    /// Preprocessed image at the model's precision
    pub pixel_values: Tensor,
    /// Architecture-specific inputs (aspect ratio ids, cross-attention mask)
    pub extras: BTreeMap<String, Tensor>,
}

impl CalibrationSample {
    pub fn num_tokens(&self) -> usize {
        self.input_ids.dims().last().copied().unwrap_or(0)
    }

    /// Name and shape of every tensor, in a stable order.
    pub fn shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = vec![
            ("input_ids".to_string(), self.input_ids.dims().to_vec()),
            (
                "attention_mask".to_string(),
                self.attention_mask.dims().to_vec(),
            ),
            ("pixel_values".to_string(), self.pixel_values.dims().to_vec()),
        ];
        shapes.extend(
            self.extras
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec())),
        );
        shapes
    }
}

/// Turns one pair into a sample. Built once per batch from checkpoint assets.
pub trait SampleProcessor: Send + Sync {
    /// `dtype` is the precision floating tensors are cast to.
    fn process(&self, pair: &ImageQuestion, dtype: DType, device: &Device)
        -> Result<CalibrationSample>;
}

/// `[1, len]` u32 tensors of token ids and a matching all-ones mask.
pub fn token_tensors(ids: &[u32], device: &Device) -> Result<(Tensor, Tensor)> {
    let input_ids = Tensor::new(ids, device)?.unsqueeze(0)?;
    let attention_mask = Tensor::ones((1, ids.len()), DType::U32, device)?;
    Ok((input_ids, attention_mask))
}

/// Checkpoint assets every vision-language processor needs.
pub struct PromptAssets {
    pub template: ChatTemplate,
    pub tokenizer: Tokenizer,
    pub images: ImageProcessor,
}

impl PromptAssets {
    pub fn from_model_dir(model_dir: &Path, fallback: PreprocessorConfig) -> Result<Self> {
        Ok(Self {
            template: ChatTemplate::from_model_dir(model_dir)?,
            tokenizer: Tokenizer::from_path(model_dir)?,
            images: ImageProcessor::from_model_dir(model_dir, fallback)?,
        })
    }

    /// Render the one-image user turn for `question`, without a generation
    /// prompt.
    pub fn render_question(&self, question: &str) -> Result<String> {
        let message = ChatMessage::image_question(question);
        self.template.render(&[message], false)
    }

    /// Id of a placeholder token the tokenizer must know.
    pub fn required_token(&self, token: &str) -> Result<u32> {
        self.tokenizer.token_id(token).ok_or_else(|| {
            Error::TokenizationError(format!("Tokenizer has no '{token}' token"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_question_accepts_img_alias() {
        let pair: ImageQuestion =
            serde_json::from_str(r#"{"img": "cat.png", "question": "What is this?"}"#).unwrap();
        assert_eq!(pair, ImageQuestion::new("cat.png", "What is this?"));
    }

    #[test]
    fn token_tensors_have_batch_dimension() {
        let (ids, mask) = token_tensors(&[5, 6, 7], &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[1, 3]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![1, 1, 1]]);
    }

    #[test]
    fn shapes_list_extras_after_core_tensors() {
        let (input_ids, attention_mask) = token_tensors(&[1, 2], &Device::Cpu).unwrap();
        let mut extras = BTreeMap::new();
        extras.insert(
            "aspect_ratio_ids".to_string(),
            Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap(),
        );
        let sample = CalibrationSample {
            prompt: "hi".to_string(),
            input_ids,
            attention_mask,
            pixel_values: Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap(),
            extras,
        };
        let names: Vec<String> = sample.shapes().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["input_ids", "attention_mask", "pixel_values", "aspect_ratio_ids"]
        );
        assert_eq!(sample.num_tokens(), 2);
    }
}
