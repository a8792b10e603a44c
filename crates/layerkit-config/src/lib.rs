//! Configuration parsing for layerkit.
//!
//! This crate handles parsing of:
//! - Build recipes (layerkit.kdl)
//! - Manifest pairs (Cargo.toml + Cargo.lock) and their consistency checks
//! - Variable interpolation in toolchain commands

pub mod error;
pub mod manifest;
pub mod recipe;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use manifest::{ManifestPair, load_manifest_pair, validate_manifest_pair};
pub use recipe::{load_recipe, parse_recipe};
pub use variables::VariableContext;
