//! Calibra Core - model adapters for post-training quantization calibration.
//!
//! A calibration driver needs the same few things from every checkpoint: the
//! repeating blocks in execution order, the normalization layers inside each
//! block, and the groups of linear projections ("subsets") that read the same
//! activations and can be calibrated together. This crate loads safetensors
//! checkpoints with candle and answers those questions per architecture.
//!
//! Vision-language adapters additionally turn (image, question) pairs into
//! model-ready calibration samples using the checkpoint's chat template,
//! tokenizer and image-processor settings.
//!
//! # Example
//!
//! ```ignore
//! use calibra_core::{AdapterConfig, AdapterRegistry};
//!
//! let registry = AdapterRegistry::global()?;
//! let adapter = registry.build(&AdapterConfig::new("Mllama", "/models/llama-3.2-11b-vision"))?;
//!
//! for block in adapter.blocks() {
//!     let norms = adapter.layernorms_in_block(block)?;
//!     let subsets = adapter.subsets_in_block(block)?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod tokenizer;

pub use config::AdapterConfig;
pub use error::{Error, Result};
pub use models::{
    AdapterEntry, AdapterRegistry, Block, BlockKind, CalibrationSample, ImageQuestion,
    LoadedModel, Modality, ModelAdapter, Module, ModuleRef, ModuleView, MultimodalAdapter,
    NormSet, PreprocessPolicy, RegisteredAdapter, Subset,
};
