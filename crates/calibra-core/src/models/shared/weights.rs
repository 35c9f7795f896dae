//! Safetensors checkpoint discovery.
//!
//! A checkpoint directory holds either a single `model.safetensors` or a
//! `model.safetensors.index.json` pointing at shards. Tensor names are read
//! from the index or from the safetensors header without mapping the data, so
//! adapters can detect naming conventions before loading anything.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

const MAX_SAFE_TENSORS_HEADER_SIZE: usize = 100_000_000;

#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    shards: Vec<PathBuf>,
    tensor_names: BTreeSet<String>,
}

impl Checkpoint {
    pub fn open(model_dir: &Path) -> Result<Self> {
        let index_path = model_dir.join("model.safetensors.index.json");
        let (shards, tensor_names) = if index_path.exists() {
            let index_data = fs::read_to_string(&index_path)?;
            let index: Value = serde_json::from_str(&index_data)?;
            let weight_map = index
                .get("weight_map")
                .and_then(|m| m.as_object())
                .ok_or_else(|| {
                    Error::model_load(model_dir, "Invalid model.safetensors.index.json format")
                })?;

            let mut shard_files: Vec<String> = weight_map
                .values()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            shard_files.sort();
            shard_files.dedup();

            let shards = shard_files.iter().map(|f| model_dir.join(f)).collect();
            let names = weight_map.keys().cloned().collect();
            (shards, names)
        } else {
            let weights_path = model_dir.join("model.safetensors");
            if !weights_path.exists() {
                return Err(Error::model_load(
                    model_dir,
                    "No model.safetensors or model.safetensors.index.json found",
                ));
            }
            let names = read_tensor_names(&weights_path)?;
            (vec![weights_path], names)
        };

        for shard in &shards {
            if !shard.exists() {
                return Err(Error::model_load(
                    model_dir,
                    format!("Missing weight shard {}", shard.display()),
                ));
            }
        }

        debug!(
            "Opened checkpoint {:?}: {} shard(s), {} tensors",
            model_dir,
            shards.len(),
            tensor_names.len()
        );

        Ok(Self {
            dir: model_dir.to_path_buf(),
            shards,
            tensor_names,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shards(&self) -> &[PathBuf] {
        &self.shards
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensor_names.iter().map(String::as_str)
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.tensor_names.contains(tensor_name)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.tensor_names
            .range(prefix.to_string()..)
            .next()
            .is_some_and(|name| name.starts_with(prefix))
    }

    /// First candidate prefix under which the checkpoint stores tensors.
    ///
    /// Candidates are full dotted prefixes without the trailing dot; the empty
    /// string matches a checkpoint stored without any prefix.
    pub fn detect_prefix<'a>(&self, candidates: &[&'a str], tensor: &str) -> Option<&'a str> {
        candidates.iter().copied().find(|prefix| {
            let key = if prefix.is_empty() {
                tensor.to_string()
            } else {
                format!("{prefix}.{tensor}")
            };
            self.has_prefix(&key)
        })
    }

    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        // SAFETY: the shards are opened read-only and must not be modified
        // while the adapter is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&self.shards, dtype, device)? };
        Ok(vb)
    }
}

/// Read the tensor names stored in a safetensors header.
pub fn read_tensor_names(safetensors_path: &Path) -> Result<BTreeSet<String>> {
    let metadata = read_header(safetensors_path)?;
    let object = metadata.as_object().ok_or_else(|| {
        Error::model_load(safetensors_path, "Safetensors header is not a JSON object")
    })?;
    Ok(object
        .keys()
        .filter(|name| name.as_str() != "__metadata__")
        .cloned()
        .collect())
}

fn read_header(safetensors_path: &Path) -> Result<Value> {
    let mut file = fs::File::open(safetensors_path)?;

    let mut n_buf = [0u8; 8];
    file.read_exact(&mut n_buf)?;
    let header_len: usize = u64::from_le_bytes(n_buf)
        .try_into()
        .map_err(|_| Error::model_load(safetensors_path, "Invalid safetensors header length"))?;
    if header_len > MAX_SAFE_TENSORS_HEADER_SIZE {
        return Err(Error::model_load(
            safetensors_path,
            format!("Safetensors header too large: {header_len}"),
        ));
    }

    let mut header_buf = vec![0u8; header_len];
    file.read_exact(&mut header_buf)?;
    Ok(serde_json::from_slice(&header_buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    fn write_single(dir: &Path, names: &[&str]) {
        let tensors: HashMap<String, Tensor> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect();
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
    }

    #[test]
    fn reads_names_from_header() {
        let dir = tempfile::tempdir().unwrap();
        write_single(dir.path(), &["model.layers.0.mlp.up_proj.weight", "lm_head.weight"]);

        let checkpoint = Checkpoint::open(dir.path()).unwrap();
        assert!(checkpoint.contains("lm_head.weight"));
        assert!(checkpoint.has_prefix("model.layers."));
        assert!(!checkpoint.has_prefix("language_model."));
        assert_eq!(checkpoint.shards().len(), 1);
        assert_eq!(checkpoint.tensor_names().count(), 2);
    }

    #[test]
    fn detects_first_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_single(dir.path(), &["model.language_model.layers.0.input_layernorm.weight"]);

        let checkpoint = Checkpoint::open(dir.path()).unwrap();
        let found = checkpoint.detect_prefix(
            &["language_model.model", "model.language_model"],
            "layers.",
        );
        assert_eq!(found, Some("model.language_model"));
        assert_eq!(checkpoint.detect_prefix(&["vit"], "encoder."), None);
    }

    #[test]
    fn index_with_missing_shard_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"lm_head.weight": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let err = Checkpoint::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ModelLoadError { .. }));
    }

    #[test]
    fn empty_directory_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Checkpoint::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ModelLoadError { .. }));
    }
}
