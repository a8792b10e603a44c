//! Dependency layer cache commands.

use anyhow::Result;
use layerkit_config::load_manifest_pair;
use layerkit_core::ContentDigest;
use layerkit_core::artifact::{LayerKey, LayerStore, RetentionPolicy};
use layerkit_pipeline::{layer_key, resolved_toolchain};
use std::time::Duration;

use super::Context;

pub fn list(ctx: &Context) -> Result<()> {
    let recipe = ctx.load_recipe()?;
    let store = ctx.store(&recipe);
    let layers = store.list()?;

    if layers.is_empty() {
        println!("No layers in {}", store.root().display());
        return Ok(());
    }

    println!("{:<14} {:<14} {:>8} {:>12}  CREATED", "KEY", "MANIFEST", "FILES", "BYTES");
    for layer in &layers {
        println!(
            "{:<14} {:<14} {:>8} {:>12}  {}",
            layer.key.short(),
            layer.manifest_digest.short(),
            layer.file_count,
            layer.size,
            layer.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn key(ctx: &Context) -> Result<()> {
    let recipe = ctx.load_recipe()?;
    let pair = load_manifest_pair(
        &recipe.resolve(&recipe.manifest.manifest),
        &recipe.resolve(&recipe.manifest.lock),
    )
    .map_err(layerkit_core::Error::from)?;
    let key = layer_key(&recipe, &pair);

    let cached = ctx.store(&recipe).lookup(&key)?.is_some();
    println!("{}", key);
    println!("  manifest:  {}", pair.digest);
    println!("  toolchain: {}", resolved_toolchain(&recipe).fingerprint());
    println!("  cached:    {}", if cached { "yes" } else { "no" });
    Ok(())
}

pub fn prune(ctx: &Context, keep: Option<usize>, max_age_days: Option<u64>) -> Result<()> {
    if keep.is_none() && max_age_days.is_none() {
        anyhow::bail!("Nothing to prune: pass --keep and/or --max-age-days");
    }
    let recipe = ctx.load_recipe()?;
    let policy = RetentionPolicy {
        max_layers: keep,
        max_age: max_age_days.map(|days| Duration::from_secs(days * 24 * 60 * 60)),
    };

    let stats = ctx.store(&recipe).prune(&policy)?;
    println!(
        "Deleted {} layer(s), freed {} bytes",
        stats.layers_deleted, stats.bytes_freed
    );
    Ok(())
}

pub fn remove(ctx: &Context, key: &str) -> Result<()> {
    let digest = ContentDigest::from_hex(key)
        .ok_or_else(|| anyhow::anyhow!("'{}' is not a layer key", key))?;
    let recipe = ctx.load_recipe()?;
    ctx.store(&recipe).remove(&LayerKey::from_digest(digest))?;
    println!("Removed layer {}", key);
    Ok(())
}
