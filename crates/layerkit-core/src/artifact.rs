//! Build artifacts and the dependency layer store abstraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ContentDigest, Result};

/// Content address of a dependency layer.
///
/// Derived from the manifest pair digest and a fingerprint of the toolchain
/// that compiled it, so a layer built by one builder image is never reused
/// by another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerKey(ContentDigest);

impl LayerKey {
    pub fn derive(manifest_digest: &ContentDigest, toolchain_fingerprint: &ContentDigest) -> Self {
        Self(
            ContentDigest::builder()
                .part("manifest", manifest_digest.as_str().as_bytes())
                .part("toolchain", toolchain_fingerprint.as_str().as_bytes())
                .finish(),
        )
    }

    pub fn from_digest(digest: ContentDigest) -> Self {
        Self(digest)
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.short()
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A cached set of compiled dependency artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLayer {
    /// Content address of this layer.
    pub key: LayerKey,
    /// Digest of the manifest pair the layer was compiled from.
    pub manifest_digest: ContentDigest,
    /// Store-specific location of the artifact tree.
    pub location: PathBuf,
    /// Total size of the artifact tree in bytes.
    pub size: u64,
    /// Number of files in the artifact tree.
    pub file_count: u64,
    /// When the layer was stored.
    pub created_at: DateTime<Utc>,
}

/// Policy for pruning cached layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many layers, newest first.
    pub max_layers: Option<usize>,
    /// Drop layers older than this.
    pub max_age: Option<std::time::Duration>,
}

/// Statistics from a prune operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub layers_deleted: u64,
    pub bytes_freed: u64,
}

/// Storage for dependency layers, addressed by [`LayerKey`].
pub trait LayerStore: Send + Sync {
    /// Find a stored layer.
    fn lookup(&self, key: &LayerKey) -> Result<Option<DependencyLayer>>;

    /// Snapshot `artifacts` as the layer for `key`. If another writer already
    /// published the same key, the existing layer is returned.
    fn store(
        &self,
        key: &LayerKey,
        manifest_digest: &ContentDigest,
        artifacts: &Path,
    ) -> Result<DependencyLayer>;

    /// Copy a layer's artifacts into `into`. Fails with
    /// [`Error::StaleLayer`](crate::Error::StaleLayer) if the layer was not
    /// built from `manifest_digest`.
    fn restore(
        &self,
        layer: &DependencyLayer,
        manifest_digest: &ContentDigest,
        into: &Path,
    ) -> Result<()>;

    /// All stored layers, newest first.
    fn list(&self) -> Result<Vec<DependencyLayer>>;

    /// Delete a layer.
    fn remove(&self, key: &LayerKey) -> Result<()>;

    /// Delete layers according to a policy.
    fn prune(&self, policy: &RetentionPolicy) -> Result<PruneStats>;
}

/// The compiled release binary, promoted to its well-known output path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBinary {
    pub name: String,
    pub path: PathBuf,
    pub digest: ContentDigest,
    pub size: u64,
}

/// Configuration recorded alongside an assembled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Minimal base image the rootfs is layered on.
    pub base: String,
    /// Working directory inside the image.
    pub working_dir: String,
    /// Entrypoint. Always the release binary with no arguments.
    pub entrypoint: Vec<String>,
    /// Digest of the release binary.
    pub binary_digest: ContentDigest,
    /// Path of the CA trust store inside the image.
    pub trust_store: String,
}

/// A minimal runtime image assembled on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeImage {
    /// Directory holding `rootfs/` and `image.json`.
    pub root: PathBuf,
    pub config: ImageConfig,
    /// Every file in the rootfs, as sorted absolute in-image paths.
    pub contents: Vec<String>,
    /// Digest over the config and every file's path and content.
    pub digest: ContentDigest,
}

impl RuntimeImage {
    pub fn rootfs(&self) -> PathBuf {
        self.root.join("rootfs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_key_depends_on_toolchain() {
        let manifest = ContentDigest::of_bytes(b"lib = \"1.0\"");
        let a = LayerKey::derive(&manifest, &ContentDigest::of_bytes(b"rust:1.85"));
        let b = LayerKey::derive(&manifest, &ContentDigest::of_bytes(b"rust:1.86"));
        assert_ne!(a, b);
        assert_eq!(
            a,
            LayerKey::derive(&manifest, &ContentDigest::of_bytes(b"rust:1.85"))
        );
    }

    #[test]
    fn test_layer_key_serializes_as_plain_hex() {
        let key = LayerKey::from_digest(ContentDigest::of_bytes(b"abc"));
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
    }
}
