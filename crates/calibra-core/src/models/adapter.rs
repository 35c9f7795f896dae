//! The adapter contract every architecture implements.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::models::registry::Modality;
use crate::models::shared::device::{DeviceProfile, DeviceSelector};
use crate::models::shared::graph::{Block, GraphLayout, ModelGraph, ModuleRef, ModuleView};
use crate::models::shared::sample::{
    CalibrationSample, ImageQuestion, PreprocessPolicy, SampleProcessor,
};
use crate::models::shared::subset::{NormSet, Subset};
use crate::models::shared::vision::VisionTower;
use crate::models::shared::weights::Checkpoint;

/// State shared by every loaded adapter.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub model_path: PathBuf,
    /// Raw `config.json`, with `use_cache` patched off when caching is disabled
    pub config: Value,
    pub graph: ModelGraph,
    pub use_cache: bool,
}

/// A checkpoint directory opened for loading: configuration read, device and
/// precision selected, tensor names indexed.
pub struct ModelSource {
    pub model_path: PathBuf,
    pub raw_config: Value,
    pub checkpoint: Checkpoint,
    pub device: DeviceProfile,
    pub dtype: DType,
}

impl ModelSource {
    /// Open `config.model_path`, rejecting checkpoints whose declared
    /// `model_type` is not one of `model_types`.
    pub fn open(config: &AdapterConfig, model_types: &[&str]) -> Result<Self> {
        let model_path = config.model_path.clone();
        if !model_path.is_dir() {
            return Err(Error::model_load(&model_path, "Model directory does not exist"));
        }

        let config_path = model_path.join("config.json");
        if !config_path.exists() {
            return Err(Error::model_load(&model_path, "config.json not found"));
        }
        let raw_config: Value = serde_json::from_str(&fs::read_to_string(&config_path)?)?;

        let declared = declared_model_type(&raw_config).ok_or_else(|| {
            Error::model_load(&model_path, "config.json does not declare a model_type")
        })?;
        if !model_types.contains(&declared) {
            return Err(Error::model_load(
                &model_path,
                format!("Expected model_type {model_types:?}, found '{declared}'"),
            ));
        }

        let device = DeviceSelector::detect_with_preference(config.device_map.as_deref())?;
        let checkpoint_dtype = raw_config
            .get("torch_dtype")
            .or_else(|| raw_config.pointer("/text_config/torch_dtype"))
            .and_then(Value::as_str);
        let dtype = device.select_dtype(Some(&config.torch_dtype), checkpoint_dtype)?;
        let checkpoint = Checkpoint::open(&model_path)?;

        info!(
            "Opening {} checkpoint at {:?} ({:?} on {:?})",
            declared, model_path, dtype, device.kind
        );

        Ok(Self {
            model_path,
            raw_config,
            checkpoint,
            device,
            dtype,
        })
    }

    /// Deserialize the whole configuration.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.raw_config.clone())?)
    }

    /// Deserialize one nested section (`text_config`, `vision_config`),
    /// falling back to defaults when the section is absent.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .raw_config
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(serde_json::from_value(value)?)
    }

    pub fn var_builder(&self) -> Result<VarBuilder<'static>> {
        self.checkpoint.var_builder(self.dtype, &self.device.device)
    }

    /// Load every module of `layout` and patch the cache flag.
    pub fn load(self, layout: &GraphLayout, use_cache: bool) -> Result<(LoadedModel, VarBuilder<'static>)> {
        let missing = layout.missing_tensors(&self.checkpoint);
        if let Some(first) = missing.first() {
            return Err(Error::model_load(
                &self.model_path,
                format!(
                    "Checkpoint is missing {} expected tensor(s), first: {first}",
                    missing.len()
                ),
            ));
        }

        let vb = self.var_builder()?;
        let graph = layout.load(&vb)?;

        let mut config = self.raw_config;
        if !use_cache {
            disable_cache(&mut config);
        }

        info!(
            "Loaded {} blocks from {:?}",
            graph.blocks().len(),
            self.model_path
        );

        Ok((
            LoadedModel {
                model_path: self.model_path,
                config,
                graph,
                use_cache,
            },
            vb,
        ))
    }
}

fn declared_model_type(config: &Value) -> Option<&str> {
    config.get("model_type").and_then(Value::as_str)
}

/// Set `use_cache = false` at the top level and in the text sub-configuration.
pub fn disable_cache(config: &mut Value) {
    if let Some(object) = config.as_object_mut() {
        object.insert("use_cache".to_string(), Value::Bool(false));
    }
    if let Some(text) = config.get_mut("text_config").and_then(Value::as_object_mut) {
        text.insert("use_cache".to_string(), Value::Bool(false));
    }
}

/// Uniform view over a loaded checkpoint for calibration passes.
pub trait ModelAdapter: Send + Sync {
    /// Registered identifier of the architecture.
    fn architecture(&self) -> &'static str;

    fn loaded(&self) -> &LoadedModel;

    /// Normalization modules of `block`, keyed by role.
    fn layernorms_in_block(&self, block: &Block) -> Result<NormSet>;

    /// Ordered subsets of `block`. Order is the order calibration applies them.
    fn subsets_in_block(&self, block: &Block) -> Result<Vec<Subset>>;

    /// Repeating layers in execution order.
    fn blocks(&self) -> &[Block] {
        self.loaded().graph.blocks()
    }

    fn block(&self, index: usize) -> Result<&Block> {
        self.loaded().graph.block(index)
    }

    fn resolve(&self, reference: &ModuleRef) -> Result<ModuleView<'_>> {
        self.loaded().graph.resolve(reference)
    }

    fn config(&self) -> &Value {
        &self.loaded().config
    }

    fn model_path(&self) -> &Path {
        &self.loaded().model_path
    }

    fn use_cache(&self) -> bool {
        self.loaded().use_cache
    }

    /// Whether the driver must rebuild the attention mask between blocks.
    fn needs_mask_update(&self) -> bool {
        false
    }

    /// Precision of the loaded parameters.
    fn dtype(&self) -> DType {
        self.loaded().graph.param_dtype()
    }

    fn device(&self) -> &Device {
        self.loaded().graph.device()
    }

    fn embed_layers(&self) -> Vec<ModuleRef> {
        root_refs(self.loaded(), &["embed_tokens"])
    }

    fn head_layers(&self) -> Vec<ModuleRef> {
        root_refs(self.loaded(), &["lm_head"])
    }

    fn pre_head_layernorm_layers(&self) -> Vec<ModuleRef> {
        root_refs(self.loaded(), &["norm"])
    }

    fn as_multimodal(&self) -> Option<&dyn MultimodalAdapter> {
        None
    }
}

/// References to the root modules among `names` the graph actually holds.
pub fn root_refs(loaded: &LoadedModel, names: &[&str]) -> Vec<ModuleRef> {
    names
        .iter()
        .filter(|name| loaded.graph.has_root(name))
        .map(|name| ModuleRef::model(*name))
        .collect()
}

/// An adapter the registry can construct.
pub trait RegisteredAdapter: ModelAdapter + Sized + 'static {
    const NAME: &'static str;
    /// `model_type` values of `config.json` this adapter accepts.
    const MODEL_TYPES: &'static [&'static str];
    const MODALITY: Modality;

    /// Load configuration and weights from `config.model_path`.
    ///
    /// Every failure is reported as a `ModelLoadError` for that path.
    fn build_model(config: &AdapterConfig) -> Result<Self>;
}

/// Adapters for models that consume images alongside text.
pub trait MultimodalAdapter: ModelAdapter {
    fn vision_tower(&self) -> &VisionTower;

    /// Processor built from the checkpoint's tokenizer, chat template and
    /// image-processor configuration.
    fn sample_processor(&self) -> Result<Box<dyn SampleProcessor>>;

    /// One result per pair, in order. Samples are cast to the precision of
    /// the loaded parameters at the time of the call.
    ///
    /// Missing or unusable tokenizer, chat template or image-processor assets
    /// fail the whole batch with a `PreprocessError` without an index, under
    /// either policy.
    fn preprocess_iter<'a>(
        &'a self,
        pairs: &'a [ImageQuestion],
    ) -> Result<Box<dyn Iterator<Item = Result<CalibrationSample>> + 'a>> {
        let processor = self
            .sample_processor()
            .map_err(Error::into_batch_preprocess_error)?;
        let dtype = self.dtype();
        let device = self.device().clone();
        Ok(Box::new(pairs.iter().enumerate().map(move |(index, pair)| {
            processor
                .process(pair, dtype, &device)
                .map_err(|e| e.into_preprocess_error(index))
        })))
    }

    fn preprocess(
        &self,
        pairs: &[ImageQuestion],
        policy: PreprocessPolicy,
    ) -> Result<Vec<CalibrationSample>> {
        let mut samples = Vec::with_capacity(pairs.len());
        for result in self.preprocess_iter(pairs)? {
            match result {
                Ok(sample) => samples.push(sample),
                Err(err) => match policy {
                    PreprocessPolicy::Abort => return Err(err),
                    PreprocessPolicy::Skip => warn!("Skipping calibration pair: {err}"),
                },
            }
        }
        info!(
            "Preprocessed {} of {} calibration pairs",
            samples.len(),
            pairs.len()
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disable_cache_patches_text_config() {
        let mut config = json!({"model_type": "mllama", "text_config": {"use_cache": true}});
        disable_cache(&mut config);
        assert_eq!(config["use_cache"], json!(false));
        assert_eq!(config["text_config"]["use_cache"], json!(false));
    }

    #[test]
    fn open_rejects_missing_directory() {
        let config = AdapterConfig::new("Llama", "/definitely/not/here");
        let err = ModelSource::open(&config, &["llama"]).err().unwrap();
        assert!(matches!(err, Error::ModelLoadError { .. }));
    }

    #[test]
    fn open_rejects_unexpected_model_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"model_type": "bert"}"#).unwrap();
        let config = AdapterConfig::new("Llama", dir.path()).with_device("cpu");
        let err = ModelSource::open(&config, &["llama"]).err().unwrap();
        match err {
            Error::ModelLoadError { reason, .. } => assert!(reason.contains("bert")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn open_requires_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig::new("Llama", dir.path()).with_device("cpu");
        let err = ModelSource::open(&config, &["llama"]).err().unwrap();
        assert!(err.to_string().contains("config.json"));
    }
}
