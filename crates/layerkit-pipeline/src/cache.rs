//! Filesystem-backed dependency layer store.
//!
//! Layout:
//!
//! ```text
//! <root>/layers/<key>/layer.json
//! <root>/layers/<key>/artifacts/...
//! <root>/tmp/<id>/            in-progress writes
//! ```
//!
//! A layer is written under `tmp/` and renamed into `layers/` once complete,
//! so readers never see a half-written layer.

use chrono::Utc;
use layerkit_core::artifact::{
    DependencyLayer, LayerKey, LayerStore, PruneStats, RetentionPolicy,
};
use layerkit_core::{ContentDigest, Error, ResourceId, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fsutil;

const LAYERS_DIR: &str = "layers";
const TMP_DIR: &str = "tmp";
const METADATA_FILE: &str = "layer.json";
const ARTIFACTS_DIR: &str = "artifacts";
const STAGING_GRACE: std::time::Duration = std::time::Duration::from_secs(3600);

pub struct FsLayerStore {
    root: PathBuf,
}

impl FsLayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, key: &LayerKey) -> PathBuf {
        self.root.join(LAYERS_DIR).join(key.digest().as_str())
    }

    fn read_metadata(dir: &Path) -> Result<Option<DependencyLayer>> {
        let bytes = match fs::read(dir.join(METADATA_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut layer: DependencyLayer = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Internal(format!("corrupt layer metadata in {}: {}", dir.display(), e))
        })?;
        // The recorded location goes stale when the cache directory moves.
        layer.location = dir.join(ARTIFACTS_DIR);
        Ok(Some(layer))
    }
}

impl LayerStore for FsLayerStore {
    fn lookup(&self, key: &LayerKey) -> Result<Option<DependencyLayer>> {
        let dir = self.layer_dir(key);
        let Some(layer) = Self::read_metadata(&dir)? else {
            return Ok(None);
        };
        if layer.key != *key {
            warn!(
                expected = %key,
                found = %layer.key,
                "Layer metadata does not match its location, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(layer))
    }

    fn store(
        &self,
        key: &LayerKey,
        manifest_digest: &ContentDigest,
        artifacts: &Path,
    ) -> Result<DependencyLayer> {
        let final_dir = self.layer_dir(key);
        let staging = self.root.join(TMP_DIR).join(ResourceId::new().to_string());

        let stats = match fsutil::copy_tree(artifacts, &staging.join(ARTIFACTS_DIR)) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        };

        let layer = DependencyLayer {
            key: key.clone(),
            manifest_digest: manifest_digest.clone(),
            location: final_dir.join(ARTIFACTS_DIR),
            size: stats.bytes,
            file_count: stats.files,
            created_at: Utc::now(),
        };
        let metadata = serde_json::to_vec_pretty(&layer)
            .map_err(|e| Error::Internal(format!("failed to encode layer metadata: {}", e)))?;

        let published = fs::write(staging.join(METADATA_FILE), metadata)
            .and_then(|_| fs::create_dir_all(self.root.join(LAYERS_DIR)))
            .and_then(|_| fs::rename(&staging, &final_dir));

        match published {
            Ok(()) => {
                info!(
                    key = %key,
                    files = layer.file_count,
                    bytes = layer.size,
                    "Stored dependency layer"
                );
                Ok(layer)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                // Lost a race with another writer for the same key.
                match self.lookup(key)? {
                    Some(existing) => {
                        debug!(key = %key, "Layer already published");
                        Ok(existing)
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    fn restore(
        &self,
        layer: &DependencyLayer,
        manifest_digest: &ContentDigest,
        into: &Path,
    ) -> Result<()> {
        if layer.manifest_digest != *manifest_digest {
            return Err(Error::StaleLayer {
                expected: manifest_digest.to_string(),
                found: layer.manifest_digest.to_string(),
            });
        }

        // The caller's copy of the metadata may be out of date; trust disk.
        match Self::read_metadata(&self.layer_dir(&layer.key))? {
            Some(stored) if stored.manifest_digest == *manifest_digest => {}
            Some(stored) => {
                return Err(Error::StaleLayer {
                    expected: manifest_digest.to_string(),
                    found: stored.manifest_digest.to_string(),
                });
            }
            None => return Err(Error::NotFound(format!("layer {}", layer.key))),
        }

        fsutil::remove_path(into)?;
        let artifacts = self.layer_dir(&layer.key).join(ARTIFACTS_DIR);
        let stats = fsutil::copy_tree(&artifacts, into)?;
        debug!(
            key = %layer.key,
            files = stats.files,
            into = %into.display(),
            "Restored dependency layer"
        );
        Ok(())
    }

    fn list(&self) -> Result<Vec<DependencyLayer>> {
        let entries = match fs::read_dir(self.root.join(LAYERS_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut layers = Vec::new();
        for entry in entries {
            let entry = entry?;
            match Self::read_metadata(&entry.path()) {
                Ok(Some(layer)) => layers.push(layer),
                Ok(None) => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping layer"),
            }
        }
        layers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(layers)
    }

    fn remove(&self, key: &LayerKey) -> Result<()> {
        if !fsutil::remove_path(&self.layer_dir(key))? {
            return Err(Error::NotFound(format!("layer {}", key)));
        }
        info!(key = %key, "Removed dependency layer");
        Ok(())
    }

    fn prune(&self, policy: &RetentionPolicy) -> Result<PruneStats> {
        let now = Utc::now();
        let max_age = policy
            .max_age
            .map(chrono::Duration::from_std)
            .transpose()
            .map_err(|e| Error::Internal(format!("retention age out of range: {}", e)))?;

        let mut stats = PruneStats::default();
        for (idx, layer) in self.list()?.into_iter().enumerate() {
            let over_count = policy.max_layers.is_some_and(|max| idx >= max);
            let too_old = max_age.is_some_and(|age| now - layer.created_at > age);
            if over_count || too_old {
                self.remove(&layer.key)?;
                stats.layers_deleted += 1;
                stats.bytes_freed += layer.size;
            }
        }

        self.sweep_staging()?;
        Ok(stats)
    }
}

impl FsLayerStore {
    /// Remove staging directories left behind by interrupted writes. Recent
    /// ones may belong to a write still in progress and are kept.
    fn sweep_staging(&self) -> Result<()> {
        let entries = match fs::read_dir(self.root.join(TMP_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let age = entry
                .metadata()?
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age > STAGING_GRACE {
                debug!(path = %entry.path().display(), "Removing abandoned staging dir");
                fsutil::remove_path(&entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(name: &str) -> LayerKey {
        LayerKey::derive(
            &ContentDigest::of_bytes(name.as_bytes()),
            &ContentDigest::of_bytes(b"toolchain"),
        )
    }

    fn artifacts(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("release/deps")).unwrap();
        fs::write(dir.path().join("release/deps/liblib-0123456789abcdef.rlib"), contents).unwrap();
        dir
    }

    #[test]
    fn test_store_lookup_restore() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let manifest = ContentDigest::of_bytes(b"manifest");
        let key = key("a");
        let src = artifacts("rlib");

        assert!(store.lookup(&key).unwrap().is_none());
        let layer = store.store(&key, &manifest, src.path()).unwrap();
        assert_eq!(layer.file_count, 1);
        assert_eq!(layer.size, 4);

        let found = store.lookup(&key).unwrap().unwrap();
        assert_eq!(found.key, key);
        assert_eq!(found.manifest_digest, manifest);

        let ws = tempfile::tempdir().unwrap();
        let target = ws.path().join("target");
        fs::create_dir_all(target.join("stale")).unwrap();
        store.restore(&found, &manifest, &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("release/deps/liblib-0123456789abcdef.rlib")).unwrap(),
            "rlib"
        );
        assert!(!target.join("stale").exists());
        assert!(cache.path().join("tmp").read_dir().unwrap().next().is_none());
    }

    #[test]
    fn test_restore_after_cache_directory_moved() {
        let parent = tempfile::tempdir().unwrap();
        let before = parent.path().join("cache-a");
        let after = parent.path().join("cache-b");
        let manifest = ContentDigest::of_bytes(b"manifest");
        let key = key("moved");
        let src = artifacts("rlib");

        let stored = FsLayerStore::new(&before)
            .store(&key, &manifest, src.path())
            .unwrap();
        fs::rename(&before, &after).unwrap();

        let store = FsLayerStore::new(&after);
        let found = store.lookup(&key).unwrap().unwrap();
        assert!(found.location.starts_with(&after));

        let target = parent.path().join("target");
        store.restore(&stored, &manifest, &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("release/deps/liblib-0123456789abcdef.rlib")).unwrap(),
            "rlib"
        );
        assert!(store.list().unwrap()[0].location.starts_with(&after));
    }

    #[test]
    fn test_restore_rejects_other_manifest() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let built_from = ContentDigest::of_bytes(b"lib 1.0");
        let layer = store.store(&key("a"), &built_from, artifacts("x").path()).unwrap();

        let ws = tempfile::tempdir().unwrap();
        let err = store
            .restore(&layer, &ContentDigest::of_bytes(b"lib 1.1"), ws.path())
            .unwrap_err();
        assert!(matches!(err, Error::StaleLayer { .. }));
    }

    #[test]
    fn test_restore_trusts_stored_metadata() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let manifest = ContentDigest::of_bytes(b"lib 1.0");
        let k = key("a");
        let layer = store.store(&k, &manifest, artifacts("x").path()).unwrap();

        // Metadata on disk rewritten as if the layer came from another manifest.
        let mut tampered = layer.clone();
        tampered.manifest_digest = ContentDigest::of_bytes(b"lib 1.1");
        fs::write(
            store.layer_dir(&k).join(METADATA_FILE),
            serde_json::to_vec(&tampered).unwrap(),
        )
        .unwrap();

        let ws = tempfile::tempdir().unwrap();
        let err = store.restore(&layer, &manifest, ws.path()).unwrap_err();
        assert!(matches!(err, Error::StaleLayer { .. }));
    }

    #[test]
    fn test_store_same_key_twice_keeps_first() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let manifest = ContentDigest::of_bytes(b"m");
        let k = key("a");

        let first = store.store(&k, &manifest, artifacts("first").path()).unwrap();
        let second = store.store(&k, &manifest, artifacts("second!").path()).unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_missing() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let k = key("a");
        store.store(&k, &ContentDigest::of_bytes(b"m"), artifacts("x").path()).unwrap();

        store.remove(&k).unwrap();
        assert!(store.lookup(&k).unwrap().is_none());
        assert!(matches!(store.remove(&k), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_prune_by_count_keeps_newest() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        let manifest = ContentDigest::of_bytes(b"m");
        for name in ["a", "b", "c"] {
            store.store(&key(name), &manifest, artifacts(name).path()).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        let stats = store
            .prune(&RetentionPolicy {
                max_layers: Some(1),
                max_age: None,
            })
            .unwrap();

        assert_eq!(stats.layers_deleted, 2);
        assert_eq!(stats.bytes_freed, 2);
        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, key("c"));
    }

    #[test]
    fn test_prune_by_age() {
        let cache = tempfile::tempdir().unwrap();
        let store = FsLayerStore::new(cache.path());
        store.store(&key("a"), &ContentDigest::of_bytes(b"m"), artifacts("x").path()).unwrap();

        let keep = store
            .prune(&RetentionPolicy {
                max_layers: None,
                max_age: Some(Duration::from_secs(3600)),
            })
            .unwrap();
        assert_eq!(keep, PruneStats::default());

        std::thread::sleep(Duration::from_millis(20));
        let stats = store
            .prune(&RetentionPolicy {
                max_layers: None,
                max_age: Some(Duration::from_millis(1)),
            })
            .unwrap();
        assert_eq!(stats.layers_deleted, 1);
        assert!(store.list().unwrap().is_empty());
    }
}
