//! Handle on the vision encoder of a vision-language checkpoint.
//!
//! Calibration walks the text backbone, so the vision tower is not turned into
//! blocks. It stays a lazily-read view over the mapped weights, with the
//! geometry preprocessing needs.

use candle_core::{Shape, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
}

fn default_hidden_size() -> usize {
    1024
}

fn default_image_size() -> usize {
    336
}

fn default_patch_size() -> usize {
    14
}

fn default_num_hidden_layers() -> usize {
    24
}

fn default_num_channels() -> usize {
    3
}

#[derive(Clone)]
pub struct VisionTower {
    prefix: String,
    config: VisionConfig,
    vb: VarBuilder<'static>,
}

impl VisionTower {
    pub fn new(vb: &VarBuilder<'static>, prefix: &str, config: VisionConfig) -> Self {
        Self {
            prefix: prefix.to_string(),
            config,
            vb: vb.pp(prefix),
        }
    }

    /// Checkpoint prefix of the tower's tensors.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn patches_per_side(&self) -> usize {
        self.config.image_size / self.config.patch_size.max(1)
    }

    pub fn num_patches(&self) -> usize {
        self.patches_per_side() * self.patches_per_side()
    }

    /// Whether the tower stores `name` (relative to its prefix).
    pub fn contains(&self, name: &str) -> bool {
        self.vb.contains_tensor(name)
    }

    pub fn tensor<S: Into<Shape>>(&self, shape: S, name: &str) -> Result<Tensor> {
        Ok(self.vb.get(shape, name)?)
    }
}
