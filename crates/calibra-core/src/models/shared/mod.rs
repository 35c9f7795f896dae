//! Shared model infrastructure used by all architecture adapters.
//!
//! This module holds reusable components that should not depend on any
//! specific model family.

pub mod chat;
pub mod decoder;
pub mod device;
pub mod graph;
pub mod image;
pub mod sample;
pub mod subset;
pub mod template;
pub mod vision;
pub mod weights;

#[cfg(test)]
pub(crate) mod fixtures;
