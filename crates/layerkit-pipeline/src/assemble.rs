//! Runtime image assembly.
//!
//! The image is a directory holding `rootfs/` and `image.json`. The rootfs
//! contains exactly the release binary, the static asset tree (if any) and
//! the CA trust store; no toolchain, sources or intermediate artifacts.

use layerkit_core::artifact::{ImageConfig, ReleaseBinary, RuntimeImage};
use layerkit_core::pipeline::BuildRecipe;
use layerkit_core::{ContentDigest, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::fsutil;

pub const IMAGE_DIR: &str = "image";
const ROOTFS_DIR: &str = "rootfs";
const CONFIG_FILE: &str = "image.json";
const ASSETS_DIR: &str = "assets";

/// On-disk form of `image.json`.
#[derive(Debug, Serialize, Deserialize)]
struct ImageDocument {
    config: ImageConfig,
    contents: Vec<String>,
    digest: ContentDigest,
}

pub struct ImageAssembler<'a> {
    recipe: &'a BuildRecipe,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(recipe: &'a BuildRecipe) -> Self {
        Self { recipe }
    }

    /// Assemble the runtime image under `<out_dir>/image`, replacing any
    /// previous image. On failure no image is left behind.
    pub fn assemble(&self, binary: &ReleaseBinary, out_dir: &Path) -> Result<RuntimeImage> {
        let final_dir = out_dir.join(IMAGE_DIR);
        let staging = out_dir.join(format!("{IMAGE_DIR}.tmp"));
        fsutil::remove_path(&final_dir).map_err(assembly("failed to clear previous image"))?;
        fsutil::remove_path(&staging).map_err(assembly("failed to clear staging dir"))?;

        let result = self
            .populate(binary, &staging)
            .and_then(|(config, contents, digest)| {
                let doc = ImageDocument {
                    config,
                    contents,
                    digest,
                };
                let bytes = serde_json::to_vec_pretty(&doc)
                    .map_err(|e| Error::Assembly(format!("failed to encode image config: {e}")))?;
                fs::write(staging.join(CONFIG_FILE), bytes)
                    .map_err(assembly("failed to write image config"))?;
                fs::rename(&staging, &final_dir).map_err(assembly("failed to publish image"))?;
                Ok(doc)
            });

        match result {
            Ok(doc) => {
                info!(
                    digest = %doc.digest.short(),
                    files = doc.contents.len(),
                    base = %doc.config.base,
                    "Assembled runtime image"
                );
                Ok(RuntimeImage {
                    root: final_dir,
                    config: doc.config,
                    contents: doc.contents,
                    digest: doc.digest,
                })
            }
            Err(e) => {
                let _ = fsutil::remove_path(&staging);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        binary: &ReleaseBinary,
        image_dir: &Path,
    ) -> Result<(ImageConfig, Vec<String>, ContentDigest)> {
        let runtime = &self.recipe.runtime;
        let rootfs = image_dir.join(ROOTFS_DIR);
        let workdir = in_rootfs(&rootfs, &runtime.working_dir);

        let binary_dest = workdir.join(&binary.name);
        fsutil::copy_atomic(&binary.path, &binary_dest)
            .map_err(assembly(&format!("failed to copy binary {}", binary.path.display())))?;
        set_mode(&binary_dest, 0o755).map_err(assembly("failed to mark binary executable"))?;

        if let Some(assets) = &self.recipe.assets_dir {
            let from = self.recipe.resolve(assets);
            if !from.is_dir() {
                return Err(Error::Assembly(format!(
                    "asset directory not found: {}",
                    from.display()
                )));
            }
            let stats = fsutil::copy_tree(&from, &workdir.join(ASSETS_DIR))
                .map_err(assembly("failed to copy assets"))?;
            debug!(files = stats.files, bytes = stats.bytes, "Copied asset tree");
        }

        let trust_source = self.recipe.resolve(&runtime.trust_store.source);
        if !trust_source.is_file() {
            return Err(Error::Assembly(format!(
                "CA trust store not found at {}",
                trust_source.display()
            )));
        }
        let trust_dest = in_rootfs(&rootfs, &runtime.trust_store.path);
        fsutil::copy_atomic(&trust_source, &trust_dest)
            .map_err(assembly("failed to install CA trust store"))?;
        set_mode(&trust_dest, 0o644).map_err(assembly("failed to set trust store mode"))?;

        let config = ImageConfig {
            base: runtime.base.clone(),
            working_dir: runtime.working_dir.clone(),
            entrypoint: vec![binary_path(&runtime.working_dir, &binary.name)],
            binary_digest: binary.digest.clone(),
            trust_store: runtime.trust_store.path.clone(),
        };

        let contents = enumerate(&rootfs).map_err(assembly("failed to list rootfs"))?;
        verify_minimal(&config, &contents)?;
        let digest = image_digest(&rootfs, &config, &contents)?;

        Ok((config, contents, digest))
    }
}

/// Load a previously assembled image from its directory.
pub fn load_image(image_dir: &Path) -> Result<RuntimeImage> {
    let bytes = fs::read(image_dir.join(CONFIG_FILE)).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(format!("image at {}", image_dir.display())),
        _ => e.into(),
    })?;
    let doc: ImageDocument = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Assembly(format!("corrupt image config: {e}")))?;
    Ok(RuntimeImage {
        root: image_dir.to_path_buf(),
        config: doc.config,
        contents: doc.contents,
        digest: doc.digest,
    })
}

/// Every file in a rootfs as a sorted absolute in-image path.
pub fn enumerate(rootfs: &Path) -> io::Result<Vec<String>> {
    Ok(fsutil::relative_files(rootfs)?
        .into_iter()
        .map(|path| format!("/{path}"))
        .collect())
}

/// Check that `contents` holds nothing but the binary, the trust store and
/// files under the asset directory, and that the binary and trust store
/// are present.
pub fn verify_minimal(config: &ImageConfig, contents: &[String]) -> Result<()> {
    let binary = config
        .entrypoint
        .first()
        .ok_or_else(|| Error::Assembly("image has no entrypoint".to_string()))?;
    let assets_prefix = format!("{}/", binary_path(&config.working_dir, ASSETS_DIR));

    let unexpected: Vec<&String> = contents
        .iter()
        .filter(|path| {
            *path != binary && **path != config.trust_store && !path.starts_with(&assets_prefix)
        })
        .collect();
    if !unexpected.is_empty() {
        return Err(Error::Assembly(format!(
            "image contains unexpected files: {:?}",
            unexpected
        )));
    }

    for required in [binary, &config.trust_store] {
        if !contents.contains(required) {
            return Err(Error::Assembly(format!("image is missing {required}")));
        }
    }
    Ok(())
}

fn image_digest(rootfs: &Path, config: &ImageConfig, contents: &[String]) -> Result<ContentDigest> {
    let config_bytes = serde_json::to_vec(config)
        .map_err(|e| Error::Assembly(format!("failed to encode image config: {e}")))?;
    let mut builder = ContentDigest::builder().part("config", &config_bytes);
    for path in contents {
        let digest = ContentDigest::of_file(&rootfs.join(path.trim_start_matches('/')))
            .map_err(assembly("failed to hash rootfs"))?;
        builder = builder
            .part("path", path.as_bytes())
            .part("file", digest.as_str().as_bytes());
    }
    Ok(builder.finish())
}

fn binary_path(working_dir: &str, name: &str) -> String {
    format!("{}/{}", working_dir.trim_end_matches('/'), name)
}

fn in_rootfs(rootfs: &Path, absolute: &str) -> PathBuf {
    rootfs.join(absolute.trim_start_matches('/'))
}

fn assembly(context: &str) -> impl FnOnce(io::Error) -> Error + '_ {
    move |e| Error::Assembly(format!("{context}: {e}"))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
