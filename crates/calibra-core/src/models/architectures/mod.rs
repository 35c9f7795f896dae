//! Concrete architecture adapters.
//!
//! Adding an architecture follows this pattern:
//! 1. Describe its checkpoint layout and subsets in a module here.
//! 2. Implement `RegisteredAdapter` for it.
//! 3. List it in [`builtin_entries`].

pub mod internlm2;
pub mod llama;
pub mod llava;
pub mod mixtral;
pub mod mllama;
pub mod vit;

use crate::models::registry::AdapterEntry;

pub use internlm2::InternLM2;
pub use llama::{Llama, Mistral, Qwen2};
pub use llava::Llava;
pub use mixtral::Mixtral;
pub use mllama::Mllama;
pub use vit::Vit;

/// Every adapter compiled into the crate.
pub fn builtin_entries() -> Vec<AdapterEntry> {
    vec![
        AdapterEntry::of::<Llama>(),
        AdapterEntry::of::<Mistral>(),
        AdapterEntry::of::<Qwen2>(),
        AdapterEntry::of::<InternLM2>(),
        AdapterEntry::of::<Mixtral>(),
        AdapterEntry::of::<Vit>(),
        AdapterEntry::of::<Llava>(),
        AdapterEntry::of::<Mllama>(),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::AdapterConfig;
    use crate::models::registry::AdapterRegistry;

    fn write_fixture(name: &str, dir: &Path) {
        match name {
            "Llama" => llama::write_test_checkpoint(dir, "llama"),
            "Mistral" => llama::write_test_checkpoint(dir, "mistral"),
            "Qwen2" => llama::write_test_checkpoint(dir, "qwen2"),
            "InternLM2" => internlm2::write_test_checkpoint(dir),
            "Mixtral" => mixtral::write_test_checkpoint(dir),
            "Vit" => vit::write_test_checkpoint(dir),
            "Llava" => llava::write_test_checkpoint(dir),
            "Mllama" => mllama::write_test_checkpoint(dir),
            other => panic!("no fixture for {other}"),
        }
    }

    #[test]
    fn every_registered_adapter_builds_from_its_fixture() {
        let registry = AdapterRegistry::global().unwrap();
        for entry in registry.entries() {
            let dir = tempfile::tempdir().unwrap();
            write_fixture(entry.name, dir.path());

            let config = AdapterConfig::new(entry.name, dir.path()).with_device("cpu");
            let adapter = registry.build(&config).unwrap();
            assert_eq!(adapter.architecture(), entry.name);
            assert!(!adapter.blocks().is_empty(), "{} has no blocks", entry.name);
            assert_eq!(
                adapter.as_multimodal().is_some(),
                entry.modality.is_multimodal(),
                "{}",
                entry.name
            );

            for block in adapter.blocks() {
                let subsets = adapter.subsets_in_block(block).unwrap();
                crate::models::shared::subset::ensure_disjoint(&subsets).unwrap();
                assert!(!adapter.layernorms_in_block(block).unwrap().is_empty());
            }
        }
    }

    #[test]
    fn build_by_declared_model_type() {
        let dir = tempfile::tempdir().unwrap();
        mllama::write_test_checkpoint(dir.path());
        let config = AdapterConfig {
            model_path: dir.path().to_path_buf(),
            device_map: Some("cpu".to_string()),
            ..AdapterConfig::default()
        };
        let adapter = AdapterRegistry::global().unwrap().build(&config).unwrap();
        assert_eq!(adapter.architecture(), "Mllama");
    }
}
