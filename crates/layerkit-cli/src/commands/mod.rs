//! CLI command implementations.

pub mod build;
pub mod cache;
pub mod inspect;

use anyhow::{Context as _, Result};
use layerkit_config::{load_manifest_pair, load_recipe};
use layerkit_core::executor::Executor;
use layerkit_core::pipeline::BuildRecipe;
use layerkit_executor::{LocalDockerExecutor, LocalProcessExecutor};
use layerkit_pipeline::{BuildOptions, FsLayerStore, layer_key};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::{ExecutorKind, PathArgs};

/// Settings shared by every command.
pub struct Context {
    pub recipe: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub executor: ExecutorKind,
}

impl Context {
    pub fn load_recipe(&self) -> Result<BuildRecipe> {
        let recipe = load_recipe(&self.recipe)
            .with_context(|| format!("Failed to load recipe: {}", self.recipe.display()))?;
        debug!(
            recipe = %self.recipe.display(),
            project = %recipe.project.name,
            "Loaded recipe"
        );
        Ok(recipe)
    }

    pub fn store(&self, recipe: &BuildRecipe) -> FsLayerStore {
        let root = self
            .cache_dir
            .clone()
            .unwrap_or_else(|| recipe.project.dir.join(".layerkit").join("cache"));
        FsLayerStore::new(root)
    }

    pub fn executor(&self, recipe: &BuildRecipe) -> Result<Arc<dyn Executor>> {
        match self.executor {
            ExecutorKind::Local => Ok(Arc::new(LocalProcessExecutor::new())),
            ExecutorKind::Docker => {
                if recipe.toolchain.image.is_none() {
                    anyhow::bail!("The docker executor needs a toolchain image in the recipe");
                }
                let executor = LocalDockerExecutor::new().context("Failed to connect to Docker")?;
                Ok(Arc::new(executor))
            }
        }
    }

    pub fn options(&self, recipe: &BuildRecipe, paths: &PathArgs) -> BuildOptions {
        let mut options = BuildOptions::for_recipe(recipe);
        if let Some(workspace) = &paths.workspace {
            options.workspace = workspace.clone();
        }
        if let Some(out) = &paths.out {
            options.out_dir = out.clone();
        }
        options
    }
}

pub fn validate(ctx: &Context) -> Result<()> {
    let recipe = ctx.load_recipe()?;
    println!("Recipe is valid: {} (binary '{}')", recipe.project.name, recipe.project.binary);

    let pair = load_manifest_pair(
        &recipe.resolve(&recipe.manifest.manifest),
        &recipe.resolve(&recipe.manifest.lock),
    )
    .map_err(layerkit_core::Error::from)?;
    let key = layer_key(&recipe, &pair);

    println!(
        "Manifest pair is consistent: {} {}",
        pair.package,
        pair.version.as_deref().unwrap_or("")
    );
    println!("  Declared dependencies: {}", pair.dependencies.len());
    println!("  Locked packages:       {}", pair.locked_packages);
    println!("  Layer key:             {}", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ctx(recipe: PathBuf) -> Context {
        Context {
            recipe,
            cache_dir: None,
            executor: ExecutorKind::Local,
        }
    }

    #[test]
    fn test_defaults_live_under_project() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("layerkit.kdl"), r#"project "svc""#).unwrap();
        let ctx = ctx(dir.path().join("layerkit.kdl"));

        let recipe = ctx.load_recipe().unwrap();
        assert_eq!(ctx.store(&recipe).root(), dir.path().join(".layerkit/cache"));

        let paths = PathArgs {
            workspace: None,
            out: Some(PathBuf::from("/tmp/dist")),
        };
        let options = ctx.options(&recipe, &paths);
        assert_eq!(options.workspace, dir.path().join(".layerkit/workspace"));
        assert_eq!(options.out_dir, PathBuf::from("/tmp/dist"));
    }

    #[test]
    fn test_validate_reports_manifest_errors_as_manifest_kind() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("layerkit.kdl"), r#"project "svc""#).unwrap();
        fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"svc\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();

        // No lock file next to the manifest.
        let err = validate(&ctx(dir.path().join("layerkit.kdl"))).unwrap_err();
        let kind = err.downcast_ref::<layerkit_core::Error>().map(|e| e.kind());
        assert_eq!(kind, Some(layerkit_core::ErrorKind::Manifest));
    }

    #[test]
    fn test_docker_executor_requires_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("layerkit.kdl"), r#"project "svc""#).unwrap();
        let mut ctx = ctx(dir.path().join("layerkit.kdl"));
        ctx.executor = ExecutorKind::Docker;

        let recipe = ctx.load_recipe().unwrap();
        assert!(ctx.executor(&recipe).is_err());
    }
}
