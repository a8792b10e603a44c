//! The layered build pipeline.
//!
//! A build runs three stages against an isolated workspace:
//!
//! 1. **Dependencies**: compile the dependency graph against a placeholder
//!    source, or restore it from a [`cache::FsLayerStore`] layer keyed by the
//!    manifest pair.
//! 2. **Compile**: swap in the real sources, remove artifacts derived from
//!    the placeholder and build the release binary.
//! 3. **Assemble**: lay the binary, assets and CA trust store out as a
//!    minimal runtime image.

pub mod assemble;
pub mod cache;
pub mod fingerprint;
pub mod fsutil;
pub mod orchestrator;
pub mod workspace;

pub use assemble::{ImageAssembler, load_image};
pub use cache::FsLayerStore;
pub use orchestrator::{
    BuildOptions, BuildOrchestrator, BuildReport, PipelineEvent, layer_key, resolved_toolchain,
};
pub use workspace::BuildWorkspace;
