//! Core domain types and traits for the layerkit build pipeline.
//!
//! This crate contains:
//! - Resource identifiers and content digests
//! - Executor trait and job types
//! - Build artifacts (dependency layers, release binaries, runtime images)
//! - The layer store abstraction
//! - Build recipe types and the pipeline state machine

pub mod artifact;
pub mod digest;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;

pub use digest::ContentDigest;
pub use error::{Error, ErrorKind, Result};
pub use id::ResourceId;
