//! Synthetic checkpoint assets for tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde_json::{json, Map, Value};

use crate::models::shared::graph::GraphLayout;

pub const BOS_TOKEN: &str = "<|begin_of_text|>";
pub const EOS_TOKEN: &str = "<|eot_id|>";
pub const UNK_TOKEN: &str = "<unk>";

const SPECIAL_TOKENS: [&str; 7] = [
    UNK_TOKEN,
    BOS_TOKEN,
    EOS_TOKEN,
    "<|image|>",
    "<image>",
    "<|start_header_id|>",
    "<|end_header_id|>",
];

pub fn write_config(dir: &Path, config: &Value) {
    fs::write(dir.join("config.json"), serde_json::to_string_pretty(config).unwrap()).unwrap();
}

/// Zero-valued weights for every tensor of `layout`, plus `extra` tensors.
pub fn write_weights(dir: &Path, layout: &GraphLayout, extra: &[(&str, Vec<usize>)]) {
    let mut tensors = layout.zero_tensors(DType::F32);
    for (name, shape) in extra {
        tensors.insert(
            name.to_string(),
            Tensor::zeros(shape.clone(), DType::F32, &Device::Cpu).unwrap(),
        );
    }
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
}

/// Same tensors as [`write_weights`], split over two shards with an index.
pub fn write_sharded_weights(dir: &Path, layout: &GraphLayout) {
    let mut names: Vec<(String, Tensor)> = layout.zero_tensors(DType::F32).into_iter().collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    let split = names.len() / 2;

    let mut weight_map = Map::new();
    for (shard_index, chunk) in [&names[..split], &names[split..]].into_iter().enumerate() {
        let file = format!("model-0000{}-of-00002.safetensors", shard_index + 1);
        let shard: HashMap<String, Tensor> = chunk.iter().cloned().collect();
        for name in shard.keys() {
            weight_map.insert(name.clone(), Value::String(file.clone()));
        }
        candle_core::safetensors::save(&shard, dir.join(&file)).unwrap();
    }
    let index = json!({"metadata": {}, "weight_map": weight_map});
    fs::write(
        dir.join("model.safetensors.index.json"),
        serde_json::to_string(&index).unwrap(),
    )
    .unwrap();
}

/// Word-level `tokenizer.json` knowing the special tokens above and `words`.
pub fn write_tokenizer(dir: &Path, words: &[&str]) {
    let mut vocab = Map::new();
    let mut added = Vec::new();
    for (id, token) in SPECIAL_TOKENS.iter().enumerate() {
        vocab.insert(token.to_string(), json!(id));
        added.push(json!({
            "id": id,
            "content": token,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }));
    }
    for word in words {
        if !vocab.contains_key(*word) {
            let id = vocab.len();
            vocab.insert(word.to_string(), json!(id));
        }
    }

    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": UNK_TOKEN}
    });
    fs::write(
        dir.join("tokenizer.json"),
        serde_json::to_string(&tokenizer).unwrap(),
    )
    .unwrap();
}

pub fn write_tokenizer_config(dir: &Path, chat_template: &str) {
    let config = json!({
        "bos_token": BOS_TOKEN,
        "eos_token": {"content": EOS_TOKEN, "special": true},
        "chat_template": chat_template
    });
    fs::write(
        dir.join("tokenizer_config.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();
}

pub fn write_preprocessor_config(dir: &Path, config: &Value) {
    fs::write(
        dir.join("preprocessor_config.json"),
        serde_json::to_string(config).unwrap(),
    )
    .unwrap();
}

pub fn write_png(path: &Path, width: u32, height: u32) {
    image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]))
        .save(path)
        .unwrap();
}
