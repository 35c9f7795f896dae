//! Configuration types for building model adapters.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::shared::sample::PreprocessPolicy;

/// Options an adapter is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Registered architecture identifier (e.g. `Mllama`). When absent the
    /// checkpoint's declared `model_type` is used for lookup.
    #[serde(default)]
    pub model_type: Option<String>,

    /// Directory holding `config.json` and the safetensors weights
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Numeric precision of the loaded weights
    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,

    /// Device placement directive (`auto`, `cpu`, `cuda`, `cuda:N`, `metal`)
    #[serde(default)]
    pub device_map: Option<String>,

    /// Keep key-value caching enabled in the stored model configuration
    #[serde(default)]
    pub use_cache: bool,

    /// What a bad calibration pair does to a preprocessing batch
    #[serde(default)]
    pub preprocess_policy: PreprocessPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            model_type: None,
            model_path: default_model_path(),
            torch_dtype: default_torch_dtype(),
            device_map: None,
            use_cache: false,
            preprocess_policy: PreprocessPolicy::default(),
        }
    }
}

impl AdapterConfig {
    pub fn new(model_type: impl Into<String>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_type: Some(model_type.into()),
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_dtype(mut self, torch_dtype: impl Into<String>) -> Self {
        self.torch_dtype = torch_dtype.into();
        self
    }

    pub fn with_device(mut self, device_map: impl Into<String>) -> Self {
        self.device_map = Some(device_map.into());
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("Invalid config {}: {e}", path.display())))
    }

    /// Apply `CALIBRA_MODEL_PATH`, `CALIBRA_DTYPE` and `CALIBRA_DEVICE`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(path) = env_value("CALIBRA_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(dtype) = env_value("CALIBRA_DTYPE") {
            self.torch_dtype = dtype;
        }
        if let Some(device) = env_value("CALIBRA_DEVICE") {
            self.device_map = Some(device);
        }
        self
    }
}

fn env_value(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_model_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_torch_dtype() -> String {
    "auto".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"model_type": "Mllama", "model_path": "/ckpt"}"#).unwrap();
        assert_eq!(config.model_type.as_deref(), Some("Mllama"));
        assert_eq!(config.model_path, PathBuf::from("/ckpt"));
        assert_eq!(config.torch_dtype, "auto");
        assert!(config.device_map.is_none());
        assert!(!config.use_cache);
        assert_eq!(config.preprocess_policy, PreprocessPolicy::Abort);
    }

    #[test]
    fn skip_policy_parses_from_json() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"preprocess_policy": "skip"}"#).unwrap();
        assert_eq!(config.preprocess_policy, PreprocessPolicy::Skip);
    }

    #[test]
    fn from_file_reports_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.json");
        fs::write(&path, "{not json").unwrap();
        let err = AdapterConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn builder_helpers_set_fields() {
        let config = AdapterConfig::new("Llama", "/m")
            .with_dtype("bf16")
            .with_device("cpu")
            .with_cache(true);
        assert_eq!(config.torch_dtype, "bf16");
        assert_eq!(config.device_map.as_deref(), Some("cpu"));
        assert!(config.use_cache);
    }
}
