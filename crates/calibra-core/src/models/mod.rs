//! Model adapters, the registry that builds them, and shared building blocks.

pub mod adapter;
pub mod architectures;
pub mod registry;
pub mod shared;

pub use adapter::{LoadedModel, ModelAdapter, MultimodalAdapter, RegisteredAdapter};
pub use registry::{AdapterEntry, AdapterRegistry, Modality};
pub use shared::device::{DeviceProfile, DeviceSelector};
pub use shared::graph::{Block, BlockKind, Module, ModuleRef, ModuleView};
pub use shared::sample::{CalibrationSample, ImageQuestion, PreprocessPolicy};
pub use shared::subset::{NormSet, Subset};
